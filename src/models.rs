use crate::export::ArchiveHandle;
use crate::furniture::attributes::AttributeRecord;
use crate::furniture::grouping::{Group, GroupingStrategy};
use crate::furniture::listing::Listing;
use crate::furniture::similarity::FieldScores;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRequest {
    pub images_source: ImagesSource,
    /// Package the listings into an export directory.
    #[serde(default)]
    pub export: bool,
    /// Skip persistence and export; still extracts, groups and assembles.
    #[serde(default)]
    pub dry_run: bool,
}

#[skip_serializing_none]
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BatchResponse {
    pub batch_id: String,
    pub image_count: usize,
    pub failed_extractions: usize,
    pub group_count: usize,
    pub listing_count: usize,
    pub strategy: GroupingStrategy,
    pub groups: Vec<Group>,
    pub listings: Vec<Listing>,
    /// Recovered per-item failures; the batch still completed.
    pub errors: Vec<String>,
    pub stages: Vec<StageReport>,
    #[serde(default)]
    pub archive: Option<ArchiveHandle>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StageReport {
    pub name: String,
    pub elapsed_ms: u128,
    pub timestamp: DateTime<Utc>,
    pub output: Value,
}

impl StageReport {
    pub fn new(name: &str, elapsed_ms: u128, output: Value) -> Self {
        Self {
            name: name.to_string(),
            elapsed_ms,
            timestamp: Utc::now(),
            output,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ImagesSource {
    Single(String),
    Multiple(Vec<String>),
}

#[derive(Debug, Deserialize)]
pub struct ExtractRequest {
    pub images_source: ImagesSource,
}

#[derive(Debug, Serialize)]
pub struct ExtractResponse {
    pub records: Vec<AttributeRecord>,
    pub errors: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct GroupRequest {
    pub records: Vec<AttributeRecord>,
}

#[derive(Debug, Deserialize)]
pub struct ScoreRequest {
    pub a: AttributeRecord,
    pub b: AttributeRecord,
}

#[derive(Debug, Serialize)]
pub struct ScoreResponse {
    pub scores: FieldScores,
    pub threshold: f64,
    pub would_group: bool,
}

#[derive(Debug, Deserialize)]
pub struct ListingStageRequest {
    pub group: Group,
}

#[derive(Debug, Serialize)]
pub struct ListingStageResponse {
    pub listing: Listing,
    /// Assembly error that forced a placeholder, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ExportRequest {
    pub listings: Vec<Listing>,
}
