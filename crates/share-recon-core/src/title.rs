use serde::{Deserialize, Serialize};

use crate::corrections::{Correction, CorrectionSet};

/// The subset of an Item or Request that title canonicality depends on.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct TitleFields<'a> {
    pub title: &'a str,
    pub is_other: bool,
    pub category_tier1: Option<&'a str>,
    pub category_tier2: Option<&'a str>,
    pub category_tier3: Option<&'a str>,
    /// `custom_item_name` for Items, `custom_need` for Requests.
    pub custom_name: Option<&'a str>,
}

impl<'a> TitleFields<'a> {
    /// Canonical name derived from category or custom name; empty strings count as missing.
    #[must_use]
    pub fn derived_name(&self) -> Option<&'a str> {
        let source = if self.is_other { self.custom_name } else { self.category_tier3 };
        source.filter(|value| !value.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum TitleVerdict {
    Consistent,
    Mismatch { actual: String, expected: Option<String> },
}

impl TitleVerdict {
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        matches!(self, Self::Consistent)
    }
}

/// Compare a stored title with its canonical name.
///
/// A record with no derivable name is always a mismatch, even when its title is
/// empty too. Records that exactly carry a curated correction's output are
/// consistent, since the correction table is the authority for deliberately
/// non-Tier3 titles.
#[must_use]
pub fn check_title(fields: &TitleFields<'_>, curated: &CorrectionSet) -> TitleVerdict {
    match fields.derived_name() {
        Some(expected) if expected == fields.title => TitleVerdict::Consistent,
        _ if curated.curated_match(fields).is_some() => TitleVerdict::Consistent,
        expected => TitleVerdict::Mismatch {
            actual: fields.title.to_string(),
            expected: expected.map(str::to_string),
        },
    }
}

#[derive(Debug, Clone, Default)]
pub struct TitlePolicy {
    pub corrections: CorrectionSet,
    /// Quarantine mismatches that have no correction instead of leaving them unresolved.
    pub quarantine: bool,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TitleRepair<'a> {
    Recategorize(&'a Correction),
    Quarantine,
    Unresolved,
}

/// Decide how a mismatched record is repaired. Corrections take precedence over quarantine.
#[must_use]
pub fn plan_title_repair<'a>(current_title: &str, policy: &'a TitlePolicy) -> TitleRepair<'a> {
    if let Some(correction) = policy.corrections.lookup(current_title) {
        return TitleRepair::Recategorize(correction);
    }
    if policy.quarantine {
        return TitleRepair::Quarantine;
    }
    TitleRepair::Unresolved
}
