use serde::{Deserialize, Serialize};

type Tier2Table = &'static [(&'static str, &'static [&'static str])];

const STANDARD: &[(&str, Tier2Table)] = &[
    (
        "Party & Events",
        &[
            ("Audio & Lighting", &["PA Speaker", "DJ Controller", "Party Lights", "Microphone"]),
            (
                "Furniture & Decor",
                &["Folding Table", "Folding Chairs", "Party Tent", "Backdrop Stand"],
            ),
            ("Catering", &["Chafing Dish", "Drinks Dispenser", "Popcorn Machine"]),
        ],
    ),
    (
        "Sports & Outdoors",
        &[
            ("Winter Sports", &["Snowboard", "Skis", "Ski Boots", "Snowshoes"]),
            ("Camping", &["Tent", "Sleeping Bag", "Camping Stove", "Cooler"]),
            ("Water Sports", &["Kayak", "Paddle Board", "Wetsuit"]),
            ("Cycling", &["Mountain Bike", "Road Bike", "Bike Rack"]),
        ],
    ),
    (
        "Tools & DIY",
        &[
            ("Power Tools", &["Drill", "Circular Saw", "Jigsaw", "Sander"]),
            ("Garden", &["Lawn Mower", "Hedge Trimmer", "Pressure Washer", "Leaf Blower"]),
            ("Ladders & Access", &["Step Ladder", "Extension Ladder"]),
        ],
    ),
    (
        "Electronics",
        &[
            ("Photography", &["DSLR Camera", "Camera Lens", "Tripod", "Drone"]),
            ("Entertainment", &["Projector", "Projector Screen", "Game Console"]),
        ],
    ),
    (
        "Home & Kitchen",
        &[
            ("Appliances", &["Stand Mixer", "Carpet Cleaner", "Dehumidifier"]),
            ("Moving", &["Hand Truck", "Moving Blankets"]),
        ],
    ),
    (
        "Services",
        &[
            ("Home Help", &["Handyman", "Cleaning", "Furniture Assembly"]),
            ("Lessons", &["Music Lessons", "Tutoring"]),
        ],
    ),
];

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct CategoryPath {
    pub tier1: String,
    pub tier2: String,
    pub tier3: String,
}

impl CategoryPath {
    /// The display name a record filed under this path ought to carry.
    #[must_use]
    pub fn canonical_name(&self) -> &str {
        &self.tier3
    }
}

/// Fixed three-tier category hierarchy (Tier1 → Tier2 → Tier3).
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Taxonomy {
    paths: Vec<CategoryPath>,
}

impl Taxonomy {
    #[must_use]
    pub fn standard() -> Self {
        let mut paths = Vec::new();
        for (tier1, tier2_table) in STANDARD {
            for (tier2, tier3_names) in *tier2_table {
                for tier3 in *tier3_names {
                    paths.push(CategoryPath {
                        tier1: (*tier1).to_string(),
                        tier2: (*tier2).to_string(),
                        tier3: (*tier3).to_string(),
                    });
                }
            }
        }
        Self { paths }
    }

    #[must_use]
    pub fn paths(&self) -> &[CategoryPath] {
        &self.paths
    }

    #[must_use]
    pub fn contains_path(&self, tier1: &str, tier2: &str, tier3: &str) -> bool {
        self.paths
            .iter()
            .any(|path| path.tier1 == tier1 && path.tier2 == tier2 && path.tier3 == tier3)
    }

    /// Find the full path that ends in `tier3`.
    #[must_use]
    pub fn tier3_path(&self, tier3: &str) -> Option<&CategoryPath> {
        self.paths.iter().find(|path| path.tier3 == tier3)
    }
}

impl Default for Taxonomy {
    fn default() -> Self {
        Self::standard()
    }
}
