use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::ReconError;
use crate::model::{ItemUpdate, ListingType, RequestUpdate};
use crate::taxonomy::Taxonomy;
use crate::title::TitleFields;

/// One hand-curated recategorization, keyed by the exact title a bad record carries today.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Correction {
    pub match_title: String,
    #[serde(default)]
    pub new_title: Option<String>,
    #[serde(default)]
    pub listing_type: Option<ListingType>,
    pub category_tier1: String,
    pub category_tier2: String,
    pub category_tier3: String,
}

impl Correction {
    /// Title the record carries once this correction has been applied.
    #[must_use]
    pub fn resulting_title(&self) -> &str {
        self.new_title.as_deref().unwrap_or(&self.match_title)
    }

    /// True when the record already looks exactly like this correction's output.
    #[must_use]
    pub fn matches_post_image(&self, fields: &TitleFields<'_>) -> bool {
        !fields.is_other
            && fields.title == self.resulting_title()
            && fields.category_tier1 == Some(self.category_tier1.as_str())
            && fields.category_tier2 == Some(self.category_tier2.as_str())
            && fields.category_tier3 == Some(self.category_tier3.as_str())
    }

    #[must_use]
    pub fn item_update(&self) -> ItemUpdate {
        ItemUpdate {
            title: self.new_title.clone(),
            listing_type: self.listing_type,
            category_tier1: Some(self.category_tier1.clone()),
            category_tier2: Some(self.category_tier2.clone()),
            category_tier3: Some(self.category_tier3.clone()),
            is_other: Some(false),
            is_available: None,
        }
    }

    /// Requests carry no listing type, so `listing_type` is ignored here.
    #[must_use]
    pub fn request_update(&self) -> RequestUpdate {
        RequestUpdate {
            title: self.new_title.clone(),
            category_tier1: Some(self.category_tier1.clone()),
            category_tier2: Some(self.category_tier2.clone()),
            category_tier3: Some(self.category_tier3.clone()),
            is_other: Some(false),
            status: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct CorrectionFile {
    #[serde(default)]
    corrections: Vec<Correction>,
}

/// Ordered, validated correction table.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct CorrectionSet {
    entries: Vec<Correction>,
}

impl CorrectionSet {
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Validate and wrap an ordered list of corrections.
    ///
    /// # Errors
    /// Returns [`ReconError::Validation`] for empty keys, duplicate keys, chained
    /// corrections (one entry's output title is another entry's key), or category
    /// paths that are not part of the taxonomy.
    pub fn new(entries: Vec<Correction>, taxonomy: &Taxonomy) -> Result<Self, ReconError> {
        let mut keys = BTreeSet::new();
        for entry in &entries {
            if entry.match_title.trim().is_empty() {
                return Err(ReconError::Validation(
                    "correction match_title MUST be non-empty".to_string(),
                ));
            }
            if entry.new_title.as_deref().is_some_and(|title| title.trim().is_empty()) {
                return Err(ReconError::Validation(format!(
                    "correction for {:?} has an empty new_title",
                    entry.match_title
                )));
            }
            if !keys.insert(entry.match_title.as_str()) {
                return Err(ReconError::Validation(format!(
                    "duplicate correction for title {:?}",
                    entry.match_title
                )));
            }
            if !taxonomy.contains_path(
                &entry.category_tier1,
                &entry.category_tier2,
                &entry.category_tier3,
            ) {
                return Err(ReconError::Validation(format!(
                    "correction for {:?} targets unknown category {} > {} > {}",
                    entry.match_title,
                    entry.category_tier1,
                    entry.category_tier2,
                    entry.category_tier3
                )));
            }
        }

        for entry in &entries {
            if let Some(new_title) = entry.new_title.as_deref() {
                if new_title != entry.match_title && keys.contains(new_title) {
                    return Err(ReconError::Validation(format!(
                        "correction for {:?} renames to {new_title:?}, \
                         which is itself a correction key",
                        entry.match_title
                    )));
                }
            }
        }

        Ok(Self { entries })
    }

    /// Parse a `corrections:` document in YAML.
    ///
    /// # Errors
    /// Returns [`ReconError::Validation`] when the document is malformed or fails validation.
    pub fn from_yaml_str(body: &str, taxonomy: &Taxonomy) -> Result<Self, ReconError> {
        let file: CorrectionFile = serde_yaml::from_str(body)
            .map_err(|err| ReconError::Validation(format!("invalid corrections YAML: {err}")))?;
        Self::new(file.corrections, taxonomy)
    }

    /// Parse a `{"corrections": [...]}` document in JSON.
    ///
    /// # Errors
    /// Returns [`ReconError::Validation`] when the document is malformed or fails validation.
    pub fn from_json_str(body: &str, taxonomy: &Taxonomy) -> Result<Self, ReconError> {
        let file: CorrectionFile = serde_json::from_str(body)
            .map_err(|err| ReconError::Validation(format!("invalid corrections JSON: {err}")))?;
        Self::new(file.corrections, taxonomy)
    }

    #[must_use]
    pub fn lookup(&self, current_title: &str) -> Option<&Correction> {
        self.entries.iter().find(|entry| entry.match_title == current_title)
    }

    #[must_use]
    pub fn curated_match(&self, fields: &TitleFields<'_>) -> Option<&Correction> {
        self.entries.iter().find(|entry| entry.matches_post_image(fields))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Correction> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jbl_correction() -> Correction {
        Correction {
            match_title: "JBL PartyBox 310 Speaker test".to_string(),
            new_title: Some("JBL PartyBox 310 Speaker".to_string()),
            listing_type: Some(ListingType::Item),
            category_tier1: "Party & Events".to_string(),
            category_tier2: "Audio & Lighting".to_string(),
            category_tier3: "PA Speaker".to_string(),
        }
    }

    #[test]
    fn yaml_corrections_load_in_declaration_order() {
        let body = r#"
corrections:
  - match_title: "JBL PartyBox 310 Speaker test"
    new_title: "JBL PartyBox 310 Speaker"
    listing_type: item
    category_tier1: "Party & Events"
    category_tier2: "Audio & Lighting"
    category_tier3: "PA Speaker"
  - match_title: "burton board"
    category_tier1: "Sports & Outdoors"
    category_tier2: "Winter Sports"
    category_tier3: "Snowboard"
"#;
        let set = match CorrectionSet::from_yaml_str(body, &Taxonomy::standard()) {
            Ok(set) => set,
            Err(err) => panic!("corrections should load: {err}"),
        };
        assert_eq!(set.len(), 2);
        let titles = set.iter().map(|entry| entry.match_title.as_str()).collect::<Vec<_>>();
        assert_eq!(titles, vec!["JBL PartyBox 310 Speaker test", "burton board"]);
        assert_eq!(
            set.lookup("burton board").map(Correction::resulting_title),
            Some("burton board")
        );
        assert!(set.lookup("Burton Board").is_none());
    }

    #[test]
    fn duplicate_keys_are_rejected() {
        let result =
            CorrectionSet::new(vec![jbl_correction(), jbl_correction()], &Taxonomy::standard());
        assert!(matches!(
            result,
            Err(ReconError::Validation(message)) if message.contains("duplicate")
        ));
    }

    #[test]
    fn unknown_category_paths_are_rejected() {
        let mut correction = jbl_correction();
        correction.category_tier2 = "Winter Sports".to_string();
        let result = CorrectionSet::new(vec![correction], &Taxonomy::standard());
        assert!(matches!(
            result,
            Err(ReconError::Validation(message)) if message.contains("unknown category")
        ));
    }

    #[test]
    fn chained_corrections_are_rejected() {
        let mut second = jbl_correction();
        second.match_title = "JBL PartyBox 310 Speaker".to_string();
        second.new_title = Some("JBL PartyBox".to_string());
        let result = CorrectionSet::new(vec![jbl_correction(), second], &Taxonomy::standard());
        assert!(matches!(
            result,
            Err(ReconError::Validation(message)) if message.contains("itself a correction key")
        ));
    }

    #[test]
    fn json_corrections_parse_like_yaml() {
        let body = r#"{"corrections": [{
            "match_title": "JBL PartyBox 310 Speaker test",
            "new_title": "JBL PartyBox 310 Speaker",
            "category_tier1": "Party & Events",
            "category_tier2": "Audio & Lighting",
            "category_tier3": "PA Speaker"
        }]}"#;
        let set = match CorrectionSet::from_json_str(body, &Taxonomy::standard()) {
            Ok(set) => set,
            Err(err) => panic!("corrections should load: {err}"),
        };
        let Some(entry) = set.lookup("JBL PartyBox 310 Speaker test") else {
            panic!("correction should be keyed by its match title");
        };
        assert_eq!(entry.listing_type, None);
        assert_eq!(entry.item_update().is_other, Some(false));
        assert_eq!(entry.request_update().title.as_deref(), Some("JBL PartyBox 310 Speaker"));
    }

    #[test]
    fn malformed_documents_are_validation_errors() {
        let result =
            CorrectionSet::from_yaml_str("corrections: [ {match_title: 3", &Taxonomy::standard());
        assert!(matches!(result, Err(ReconError::Validation(_))));
    }
}
