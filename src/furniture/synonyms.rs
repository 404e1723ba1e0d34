use crate::furniture::attributes::AttributeField;
use once_cell::sync::Lazy;
use std::{borrow::Cow, collections::HashMap};
use thiserror::Error;

// Families are (canonical, members). A term may belong to one family per field.
// Keep these short and reviewed: a wrong entry merges photos of different items.

const FURNITURE_TYPE_FAMILIES: &[(&str, &[&str])] = &[
    (
        "chair",
        &[
            "chair",
            "armchair",
            "recliner",
            "rocker",
            "stool",
            "office chair",
            "dining chair",
            "gaming chair",
        ],
    ),
    (
        "sofa",
        &["sofa", "couch", "sectional", "loveseat", "settee", "divan"],
    ),
    (
        "table",
        &[
            "table",
            "coffee table",
            "dining table",
            "end table",
            "side table",
            "console",
        ],
    ),
    (
        "desk",
        &[
            "desk",
            "writing desk",
            "computer desk",
            "office desk",
            "workstation",
        ],
    ),
    (
        "cabinet",
        &["cabinet", "chest", "hutch", "credenza", "sideboard"],
    ),
    (
        "dresser",
        &["dresser", "chest of drawers", "bureau", "wardrobe", "armoire"],
    ),
    (
        "bookshelf",
        &["bookshelf", "bookcase", "shelf", "shelving unit"],
    ),
    (
        "bed",
        &["bed", "bedframe", "bed frame", "headboard", "daybed", "futon"],
    ),
    ("nightstand", &["nightstand", "bedside table", "night table"]),
    ("ottoman", &["ottoman", "pouf", "footstool"]),
    ("bench", &["bench"]),
];

const COLOR_FAMILIES: &[(&str, &[&str])] = &[
    (
        "white",
        &["white", "off-white", "ivory", "cream", "beige", "ecru", "alabaster"],
    ),
    ("black", &["black", "ebony", "onyx", "jet"]),
    (
        "brown",
        &[
            "brown", "tan", "coffee", "mocha", "chocolate", "chestnut", "mahogany", "walnut",
        ],
    ),
    (
        "gray",
        &["gray", "grey", "silver", "charcoal", "slate", "ash", "pewter"],
    ),
    (
        "red",
        &["red", "burgundy", "wine", "cherry", "crimson", "maroon"],
    ),
    ("blue", &["blue", "navy", "teal", "turquoise", "indigo"]),
    ("green", &["green", "olive", "sage", "emerald", "mint"]),
    (
        "wood",
        &["wood", "wooden", "natural", "oak", "pine", "cedar", "birch", "maple", "teak"],
    ),
];

const MATERIAL_FAMILIES: &[(&str, &[&str])] = &[
    (
        "wood",
        &[
            "wood",
            "wooden",
            "solid wood",
            "hardwood",
            "oak",
            "pine",
            "walnut",
            "mdf",
            "plywood",
        ],
    ),
    (
        "metal",
        &["metal", "steel", "iron", "aluminum", "aluminium", "chrome", "brass"],
    ),
    (
        "fabric",
        &["fabric", "upholstered", "upholstery", "linen", "cotton", "velvet", "mesh"],
    ),
    (
        "leather",
        &["leather", "faux leather", "leatherette", "vinyl"],
    ),
    ("wicker", &["wicker", "rattan", "cane"]),
];

const STYLE_FAMILIES: &[(&str, &[&str])] = &[
    (
        "modern",
        &["modern", "contemporary", "minimalist", "sleek", "streamlined"],
    ),
    (
        "traditional",
        &["traditional", "classic", "vintage", "antique", "heritage"],
    ),
    (
        "rustic",
        &["rustic", "farmhouse", "country", "distressed", "weathered"],
    ),
    ("industrial", &["industrial"]),
    (
        "mission",
        &["mission", "craftsman", "arts and crafts", "stickley"],
    ),
];

/// Process-wide default tables, built once and only read afterwards.
pub static DEFAULT_SYNONYMS: Lazy<Result<SynonymTables, SynonymError>> =
    Lazy::new(SynonymTables::builtin);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SynonymError {
    #[error("term `{term}` is listed in both `{first}` and `{second}` ({field} table)")]
    DuplicateTerm {
        field: &'static str,
        term: String,
        first: String,
        second: String,
    },
    #[error("family `{family}` in the {field} table has no members")]
    EmptyFamily { field: &'static str, family: String },
}

/// Maps every member of a family to the family's canonical name.
#[derive(Debug, Clone, Default)]
pub struct SynonymTable {
    canonical: HashMap<String, String>,
}

impl SynonymTable {
    pub fn from_families(
        field: AttributeField,
        families: &[(&str, &[&str])],
    ) -> Result<Self, SynonymError> {
        let mut canonical: HashMap<String, String> = HashMap::new();
        for (family, members) in families {
            if members.is_empty() {
                return Err(SynonymError::EmptyFamily {
                    field: field.name(),
                    family: family.to_string(),
                });
            }
            let family_name = family.trim().to_lowercase();
            for member in members.iter().copied().chain(std::iter::once(*family)) {
                let term = member.trim().to_lowercase();
                if let Some(existing) = canonical.get(&term) {
                    if *existing != family_name {
                        return Err(SynonymError::DuplicateTerm {
                            field: field.name(),
                            term,
                            first: existing.clone(),
                            second: family_name,
                        });
                    }
                    continue;
                }
                canonical.insert(term, family_name.clone());
            }
        }
        Ok(Self { canonical })
    }

    /// Canonical family name for an already-lowercased value, or the value
    /// itself when it belongs to no family.
    pub fn canonicalize<'a>(&self, value: &'a str) -> Cow<'a, str> {
        match self.canonical.get(value) {
            Some(name) => Cow::Owned(name.clone()),
            None => Cow::Borrowed(value),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.canonical.is_empty()
    }
}

/// One synonym table per compared attribute.
#[derive(Debug, Clone, Default)]
pub struct SynonymTables {
    furniture_type: SynonymTable,
    color: SynonymTable,
    material: SynonymTable,
    style: SynonymTable,
}

impl SynonymTables {
    pub fn builtin() -> Result<Self, SynonymError> {
        Ok(Self {
            furniture_type: SynonymTable::from_families(
                AttributeField::FurnitureType,
                FURNITURE_TYPE_FAMILIES,
            )?,
            color: SynonymTable::from_families(AttributeField::Color, COLOR_FAMILIES)?,
            material: SynonymTable::from_families(AttributeField::Material, MATERIAL_FAMILIES)?,
            style: SynonymTable::from_families(AttributeField::Style, STYLE_FAMILIES)?,
        })
    }

    pub fn table(&self, field: AttributeField) -> &SynonymTable {
        match field {
            AttributeField::FurnitureType => &self.furniture_type,
            AttributeField::Color => &self.color,
            AttributeField::Material => &self.material,
            AttributeField::Style => &self.style,
        }
    }

    /// Lowercase, trim and canonicalize a raw field value. Blank input yields
    /// `None`.
    pub fn normalize(&self, field: AttributeField, raw: &str) -> Option<String> {
        let lowered = raw.trim().to_lowercase();
        if lowered.is_empty() {
            return None;
        }
        Some(self.table(field).canonicalize(&lowered).into_owned())
    }
}

/// Builtin tables, cloned out of the lazily built default.
pub fn default_synonyms() -> Result<SynonymTables, SynonymError> {
    DEFAULT_SYNONYMS.clone()
}
