use serde::{Deserialize, Deserializer, Serialize};
use serde_with::skip_serializing_none;
use std::collections::BTreeSet;

/// Values an extractor uses to say "I don't know". They collapse into `None`
/// together with blank strings so downstream code sees a single unknown state.
const UNKNOWN_MARKERS: &[&str] = &["unknown", "n/a", "na", "none", "null", "-", "?"];

/// Structured attributes for one photo of a batch.
///
/// Records are produced once by the extractor (or substituted from the
/// fallback vocabulary when extraction fails) and never mutated afterwards;
/// grouping clones them into groups.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeRecord {
    /// Position of the image in its batch.
    pub index: usize,
    pub image_ref: String,
    #[serde(default, deserialize_with = "de_attribute")]
    pub furniture_type: Option<String>,
    #[serde(default, deserialize_with = "de_attribute")]
    pub primary_color: Option<String>,
    #[serde(default, deserialize_with = "de_attribute")]
    pub material: Option<String>,
    #[serde(default, deserialize_with = "de_attribute")]
    pub style: Option<String>,
    #[serde(default, deserialize_with = "de_condition")]
    pub condition: Option<Condition>,
    #[serde(default)]
    pub features: BTreeSet<String>,
    #[serde(default)]
    pub suggested_price: Option<f64>,
    #[serde(default)]
    pub confidence: f64,
    /// Set when the extractor failed and the attributes were filled in from
    /// the fallback vocabulary.
    #[serde(default)]
    pub extraction_failed: bool,
}

impl AttributeRecord {
    pub fn new(index: usize, image_ref: impl Into<String>) -> Self {
        Self {
            index,
            image_ref: image_ref.into(),
            furniture_type: None,
            primary_color: None,
            material: None,
            style: None,
            condition: None,
            features: BTreeSet::new(),
            suggested_price: None,
            confidence: 0.0,
            extraction_failed: false,
        }
    }

    pub fn with_type(mut self, value: &str) -> Self {
        self.furniture_type = normalize_field(value);
        self
    }

    pub fn with_color(mut self, value: &str) -> Self {
        self.primary_color = normalize_field(value);
        self
    }

    pub fn with_material(mut self, value: &str) -> Self {
        self.material = normalize_field(value);
        self
    }

    pub fn with_style(mut self, value: &str) -> Self {
        self.style = normalize_field(value);
        self
    }

    pub fn with_condition(mut self, condition: Option<Condition>) -> Self {
        self.condition = condition;
        self
    }

    pub fn with_features<I, S>(mut self, features: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.features = features
            .into_iter()
            .filter_map(|tag| normalize_field(tag.as_ref()))
            .collect();
        self
    }

    pub fn with_price(mut self, price: Option<f64>) -> Self {
        self.suggested_price = price.filter(|p| p.is_finite() && *p >= 0.0);
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = clamp_confidence(confidence);
        self
    }

    pub fn field(&self, field: AttributeField) -> Option<&str> {
        match field {
            AttributeField::FurnitureType => self.furniture_type.as_deref(),
            AttributeField::Color => self.primary_color.as_deref(),
            AttributeField::Material => self.material.as_deref(),
            AttributeField::Style => self.style.as_deref(),
        }
    }

    pub fn has_any_field(&self) -> bool {
        AttributeField::ALL
            .iter()
            .any(|field| self.field(*field).is_some())
    }
}

/// The four attributes that take part in similarity scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeField {
    FurnitureType,
    Color,
    Material,
    Style,
}

impl AttributeField {
    pub const ALL: [AttributeField; 4] = [
        AttributeField::FurnitureType,
        AttributeField::Color,
        AttributeField::Material,
        AttributeField::Style,
    ];

    pub fn name(self) -> &'static str {
        match self {
            AttributeField::FurnitureType => "furniture_type",
            AttributeField::Color => "color",
            AttributeField::Material => "material",
            AttributeField::Style => "style",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Condition {
    New,
    #[serde(rename = "Like New")]
    LikeNew,
    Good,
    Fair,
    Poor,
}

impl Condition {
    /// Loose parse of model or user supplied condition text.
    pub fn parse(input: &str) -> Option<Self> {
        let lowered = input.trim().to_lowercase();
        let lowered = lowered
            .strip_prefix("used - ")
            .or_else(|| lowered.strip_prefix("used-"))
            .unwrap_or(&lowered)
            .trim();
        match lowered {
            "new" | "brand new" | "new in box" | "unused" => Some(Condition::New),
            "like new" | "like-new" | "excellent" | "very good" | "mint" => {
                Some(Condition::LikeNew)
            }
            "good" | "used" | "gently used" => Some(Condition::Good),
            "fair" | "worn" | "acceptable" => Some(Condition::Fair),
            "poor" | "damaged" | "for parts" => Some(Condition::Poor),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Condition::New => "New",
            Condition::LikeNew => "Like New",
            Condition::Good => "Good",
            Condition::Fair => "Fair",
            Condition::Poor => "Poor",
        }
    }

    pub fn marketplace_label(self) -> &'static str {
        match self {
            Condition::New => "New",
            Condition::LikeNew => "Used - Like New",
            Condition::Good => "Used - Good",
            Condition::Fair | Condition::Poor => "Used - Fair",
        }
    }
}

/// Marketplace condition string, defaulting to "Used - Good" when unknown.
pub fn marketplace_condition(condition: Option<Condition>) -> &'static str {
    condition
        .map(Condition::marketplace_label)
        .unwrap_or("Used - Good")
}

/// Trim a raw attribute and collapse blanks and unknown markers into `None`.
pub fn normalize_field(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let lowered = trimmed.to_lowercase();
    if UNKNOWN_MARKERS.contains(&lowered.as_str()) {
        return None;
    }
    Some(trimmed.to_string())
}

pub fn clamp_confidence(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

fn de_attribute<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.as_deref().and_then(normalize_field))
}

fn de_condition<'de, D>(deserializer: D) -> Result<Option<Condition>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.as_deref().and_then(Condition::parse))
}
