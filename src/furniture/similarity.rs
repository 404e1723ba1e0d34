use crate::furniture::attributes::{AttributeField, AttributeRecord};
use crate::furniture::synonyms::{SynonymTable, SynonymTables};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, sync::Arc};
use thiserror::Error;

const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

/// Per-field weights for the attribute scorer. Must sum to 1.0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimilarityWeights {
    pub furniture_type: f64,
    pub color: f64,
    pub material: f64,
    pub style: f64,
}

impl Default for SimilarityWeights {
    fn default() -> Self {
        Self {
            furniture_type: 0.4,
            color: 0.3,
            material: 0.2,
            style: 0.1,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum WeightsError {
    #[error("weight for {field} must be a finite non-negative number, got {value}")]
    Invalid { field: &'static str, value: f64 },
    #[error("weights must sum to 1.0, got {0}")]
    Sum(f64),
    #[error("expected four comma separated weights (type,color,material,style): {0}")]
    Parse(String),
}

impl SimilarityWeights {
    pub fn weight(&self, field: AttributeField) -> f64 {
        match field {
            AttributeField::FurnitureType => self.furniture_type,
            AttributeField::Color => self.color,
            AttributeField::Material => self.material,
            AttributeField::Style => self.style,
        }
    }

    pub fn total(&self) -> f64 {
        AttributeField::ALL.iter().map(|f| self.weight(*f)).sum()
    }

    pub fn validate(&self) -> Result<(), WeightsError> {
        for field in AttributeField::ALL {
            let value = self.weight(field);
            if !value.is_finite() || value < 0.0 {
                return Err(WeightsError::Invalid {
                    field: field.name(),
                    value,
                });
            }
        }
        let total = self.total();
        if (total - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(WeightsError::Sum(total));
        }
        Ok(())
    }

    /// Parse `"0.4,0.3,0.2,0.1"` (type, color, material, style). Does not
    /// validate the sum; call [`SimilarityWeights::validate`] for that.
    pub fn parse(raw: &str) -> Result<Self, WeightsError> {
        let values = raw
            .split(',')
            .map(|part| part.trim().parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| WeightsError::Parse(raw.to_string()))?;
        let [furniture_type, color, material, style] = values[..] else {
            return Err(WeightsError::Parse(raw.to_string()));
        };
        Ok(Self {
            furniture_type,
            color,
            material,
            style,
        })
    }
}

/// Pairwise similarity between two attribute records, in `[0, 1]`.
///
/// Implementations must be pure and symmetric; the grouping engine treats a
/// non-finite or out-of-range score as a strategy failure.
pub trait SimilarityScorer: Send + Sync {
    fn score(&self, a: &AttributeRecord, b: &AttributeRecord) -> f64;
}

/// Per-field similarities plus the weighted total.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FieldScores {
    pub furniture_type: f64,
    pub color: f64,
    pub material: f64,
    pub style: f64,
    pub total: f64,
    /// Both sides are the same image of the same batch.
    pub same_record: bool,
}

/// Weighted, synonym-aware attribute comparison.
#[derive(Debug, Clone)]
pub struct AttributeScorer {
    weights: SimilarityWeights,
    synonyms: Arc<SynonymTables>,
}

impl AttributeScorer {
    pub fn new(weights: SimilarityWeights, synonyms: Arc<SynonymTables>) -> Self {
        Self { weights, synonyms }
    }

    /// Weighted sum of per-field similarities. Unknown on either side
    /// contributes nothing. A record compared with itself scores 1.0 when it
    /// has at least one known field.
    pub fn breakdown(&self, a: &AttributeRecord, b: &AttributeRecord) -> FieldScores {
        let mut per_field = [0.0_f64; 4];
        let mut any_known = false;
        let mut total = 0.0;

        for (slot, field) in AttributeField::ALL.iter().copied().enumerate() {
            let left = a.field(field).and_then(|v| self.synonyms.normalize(field, v));
            let right = b.field(field).and_then(|v| self.synonyms.normalize(field, v));
            if left.is_some() || right.is_some() {
                any_known = true;
            }
            let similarity = match (left.as_deref(), right.as_deref()) {
                (Some(l), Some(r)) if l == r => 1.0,
                (Some(l), Some(r)) => {
                    let table = self.synonyms.table(field);
                    jaccard(&tokens(table, l), &tokens(table, r))
                }
                _ => 0.0,
            };
            per_field[slot] = similarity;
            total += self.weights.weight(field) * similarity;
        }

        let same_record = a.index == b.index && a.image_ref == b.image_ref;
        let total = if same_record && any_known {
            1.0
        } else {
            total.clamp(0.0, 1.0)
        };

        FieldScores {
            furniture_type: per_field[0],
            color: per_field[1],
            material: per_field[2],
            style: per_field[3],
            total,
            same_record,
        }
    }
}

impl SimilarityScorer for AttributeScorer {
    fn score(&self, a: &AttributeRecord, b: &AttributeRecord) -> f64 {
        self.breakdown(a, b).total
    }
}

fn tokens(table: &SynonymTable, value: &str) -> BTreeSet<String> {
    value
        .split_whitespace()
        .map(|token| table.canonicalize(token).into_owned())
        .collect()
}

/// `|a ∩ b| / |a ∪ b|`, zero when either side is empty.
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    intersection as f64 / union as f64
}
