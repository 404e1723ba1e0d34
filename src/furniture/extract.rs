use crate::furniture::attributes::{AttributeRecord, Condition};
use crate::llm::{ChatModel, ContentBlock, LlmError, LlmMessage, parse_json_reply};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{path::Path, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, warn};

// Lengths are pairwise coprime and every entry sits in its own synonym
// family, so two fallback records share type and color only when their
// indices are congruent modulo FALLBACK_CYCLE.
const FALLBACK_TYPES: &[&str] = &[
    "Chair",
    "Table",
    "Sofa",
    "Desk",
    "Cabinet",
    "Bed",
    "Bookshelf",
    "Nightstand",
    "Ottoman",
    "Bench",
];
const FALLBACK_COLORS: &[&str] = &[
    "Brown", "Black", "White", "Gray", "Blue", "Red", "Green", "Wood", "Yellow", "Orange",
    "Purple",
];
const FALLBACK_MATERIALS: &[&str] = &[
    "Wood", "Metal", "Fabric", "Leather", "Plastic", "Glass", "Wicker", "Stone", "Ceramic",
];
const FALLBACK_STYLES: &[&str] = &[
    "Modern",
    "Traditional",
    "Rustic",
    "Industrial",
    "Scandinavian",
    "Mid-Century",
    "Bohemian",
];

/// Number of batch positions before the fallback type/color pair repeats.
pub const FALLBACK_CYCLE: usize = 110;

const VISION_PROMPT: &str = "Analyze this furniture photo for a resale listing. Reply with JSON \
only: {\"furniture_type\": \"...\", \"primary_color\": \"...\", \"material\": \"...\", \
\"style\": \"...\", \"condition\": \"New|Like New|Good|Fair|Poor\", \"features\": [\"...\"], \
\"suggested_price\": 0, \"confidence\": 0.0}. Use \"unknown\" for anything you cannot see.";

const DEFAULT_MODEL_CONFIDENCE: f64 = 0.5;

impl AttributeRecord {
    /// Placeholder attributes for an image whose extraction failed, rotated
    /// by batch position so that failed images do not look alike.
    pub fn fallback(index: usize, image_ref: impl Into<String>) -> Self {
        let mut record = AttributeRecord::new(index, image_ref)
            .with_type(FALLBACK_TYPES[index % FALLBACK_TYPES.len()])
            .with_color(FALLBACK_COLORS[index % FALLBACK_COLORS.len()])
            .with_material(FALLBACK_MATERIALS[index % FALLBACK_MATERIALS.len()])
            .with_style(FALLBACK_STYLES[index % FALLBACK_STYLES.len()])
            .with_confidence(0.0);
        record.extraction_failed = true;
        record
    }
}

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error("failed to read image {path}: {message}")]
    Read { path: String, message: String },
    #[error("extraction timed out after {0:?}")]
    Timeout(Duration),
    #[error("no attribute extractor configured")]
    Unavailable,
}

#[async_trait]
pub trait AttributeExtractor: Send + Sync {
    async fn extract(&self, index: usize, image_ref: &str)
    -> Result<AttributeRecord, ExtractionError>;
}

#[derive(Debug, Clone, Copy)]
pub struct ExtractionOptions {
    pub timeout: Duration,
    pub concurrency: usize,
}

impl Default for ExtractionOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(45),
            concurrency: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtractionBatch {
    /// One record per image, in input order.
    pub records: Vec<AttributeRecord>,
    pub errors: Vec<String>,
}

impl ExtractionBatch {
    pub fn failed(&self) -> usize {
        self.records.iter().filter(|r| r.extraction_failed).count()
    }
}

/// Runs the extractor over every image with bounded concurrency. Never fails:
/// errors and timeouts are replaced by [`AttributeRecord::fallback`] and
/// reported in `errors`. Dropping the returned future drops every call still
/// in flight.
pub async fn extract_batch(
    extractor: &dyn AttributeExtractor,
    images: &[String],
    options: ExtractionOptions,
) -> ExtractionBatch {
    let outcomes: Vec<_> = stream::iter(images.iter().cloned().enumerate())
        .map(|(index, image_ref): (usize, String)| async move {
            let result =
                match tokio::time::timeout(options.timeout, extractor.extract(index, &image_ref))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(ExtractionError::Timeout(options.timeout)),
                };
            (index, image_ref, result)
        })
        .buffered(options.concurrency.max(1))
        .collect()
        .await;

    let mut records = Vec::with_capacity(images.len());
    let mut errors = Vec::new();
    for (index, image_ref, result) in outcomes {
        match result {
            Ok(mut record) => {
                record.index = index;
                record.image_ref = image_ref;
                records.push(record);
            }
            Err(err) => {
                warn!(
                    target = "furnish.extract",
                    index,
                    image = %image_ref,
                    error = %err,
                    "extraction_failed_using_fallback"
                );
                errors.push(format!("image {index} ({image_ref}): {err}"));
                records.push(AttributeRecord::fallback(index, image_ref));
            }
        }
    }
    ExtractionBatch { records, errors }
}

/// Extractor used when no model gateway is configured; every image takes the
/// fallback path.
pub struct UnconfiguredExtractor;

#[async_trait]
impl AttributeExtractor for UnconfiguredExtractor {
    async fn extract(
        &self,
        _index: usize,
        _image_ref: &str,
    ) -> Result<AttributeRecord, ExtractionError> {
        Err(ExtractionError::Unavailable)
    }
}

/// Sends one photo to a vision model and reads back its attributes.
pub struct VisionExtractor {
    model: Arc<dyn ChatModel>,
    function_name: String,
}

impl VisionExtractor {
    pub fn new(model: Arc<dyn ChatModel>, function_name: impl Into<String>) -> Self {
        Self {
            model,
            function_name: function_name.into(),
        }
    }
}

#[async_trait]
impl AttributeExtractor for VisionExtractor {
    async fn extract(
        &self,
        index: usize,
        image_ref: &str,
    ) -> Result<AttributeRecord, ExtractionError> {
        let image = image_block(image_ref).await?;
        let message = LlmMessage::user_blocks(vec![ContentBlock::text(VISION_PROMPT), image]);
        let reply = self.model.chat(&self.function_name, &[message]).await?;
        let parsed: VisionReply = parse_json_reply(&reply.text)?;
        debug!(target = "furnish.extract", index, image = %image_ref, "attributes_extracted");
        Ok(parsed.into_record(index, image_ref))
    }
}

#[derive(Debug, Default, Deserialize)]
struct VisionReply {
    #[serde(default)]
    furniture_type: Option<String>,
    #[serde(default)]
    primary_color: Option<String>,
    #[serde(default)]
    material: Option<String>,
    #[serde(default)]
    style: Option<String>,
    #[serde(default)]
    condition: Option<String>,
    #[serde(default)]
    features: Vec<String>,
    #[serde(default)]
    suggested_price: Option<Value>,
    #[serde(default)]
    confidence: Option<f64>,
}

impl VisionReply {
    fn into_record(self, index: usize, image_ref: &str) -> AttributeRecord {
        let price = self.suggested_price.as_ref().and_then(price_from_value);
        AttributeRecord::new(index, image_ref)
            .with_type(self.furniture_type.as_deref().unwrap_or_default())
            .with_color(self.primary_color.as_deref().unwrap_or_default())
            .with_material(self.material.as_deref().unwrap_or_default())
            .with_style(self.style.as_deref().unwrap_or_default())
            .with_condition(self.condition.as_deref().and_then(Condition::parse))
            .with_features(self.features)
            .with_price(price)
            .with_confidence(self.confidence.unwrap_or(DEFAULT_MODEL_CONFIDENCE))
    }
}

/// Accepts `150`, `"150"` or `"$1,200.00"`. Negative amounts are rejected.
pub(crate) fn price_from_value(value: &Value) -> Option<f64> {
    let price = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => {
            let first_digit = s.find(|c: char| c.is_ascii_digit())?;
            if s[..first_digit].contains('-') {
                return None;
            }
            s.chars()
                .filter(|c| c.is_ascii_digit() || *c == '.')
                .collect::<String>()
                .parse()
                .ok()?
        }
        _ => return None,
    };
    (price.is_finite() && price >= 0.0).then_some(price)
}

async fn image_block(image_ref: &str) -> Result<ContentBlock, ExtractionError> {
    let lowered = image_ref.to_ascii_lowercase();
    if lowered.starts_with("http://") || lowered.starts_with("https://") {
        return Ok(ContentBlock::image_url(image_ref));
    }
    let bytes = tokio::fs::read(image_ref)
        .await
        .map_err(|err| ExtractionError::Read {
            path: image_ref.to_string(),
            message: err.to_string(),
        })?;
    let mime = mime_for(Path::new(image_ref));
    Ok(ContentBlock::image_url(format!(
        "data:{mime};base64,{}",
        STANDARD.encode(bytes)
    )))
}

fn mime_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "heic" => "image/heic",
        _ => "image/jpeg",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::furniture::grouping::{GroupingConfig, GroupingEngine, GroupingStrategy};
    use crate::furniture::similarity::{AttributeScorer, SimilarityScorer, SimilarityWeights};
    use crate::furniture::synonyms::default_synonyms;
    use crate::llm::LlmResponse;
    use std::collections::HashSet;
    use std::sync::Mutex;

    struct StubExtractor {
        fail: HashSet<usize>,
        slow: HashSet<usize>,
    }

    #[async_trait]
    impl AttributeExtractor for StubExtractor {
        async fn extract(
            &self,
            index: usize,
            image_ref: &str,
        ) -> Result<AttributeRecord, ExtractionError> {
            if self.slow.contains(&index) {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            if self.fail.contains(&index) {
                return Err(ExtractionError::Llm(LlmError::Http("HTTP 500".into())));
            }
            Ok(AttributeRecord::new(99, "ignored")
                .with_type("Chair")
                .with_color("Blue")
                .with_confidence(0.9)
                .with_features([image_ref]))
        }
    }

    fn images(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("https://cdn.example.com/{i}.jpg")).collect()
    }

    #[tokio::test]
    async fn batch_keeps_order_and_substitutes_failures() {
        let extractor = StubExtractor {
            fail: HashSet::from([1]),
            slow: HashSet::new(),
        };
        let images = images(4);
        let batch = extract_batch(&extractor, &images, ExtractionOptions::default()).await;
        assert_eq!(batch.records.len(), 4);
        for (i, record) in batch.records.iter().enumerate() {
            assert_eq!(record.index, i);
            assert_eq!(record.image_ref, images[i]);
        }
        assert!(batch.records[1].extraction_failed);
        assert_eq!(batch.records[1].confidence, 0.0);
        assert!(!batch.records[0].extraction_failed);
        assert_eq!(batch.failed(), 1);
        assert_eq!(batch.errors.len(), 1);
        assert!(batch.errors[0].starts_with("image 1"));
    }

    #[tokio::test]
    async fn batch_runs_on_a_spawned_task() {
        let extractor: Arc<dyn AttributeExtractor> = Arc::new(StubExtractor {
            fail: HashSet::from([0]),
            slow: HashSet::new(),
        });
        let images = images(3);
        let handle = tokio::spawn(async move {
            extract_batch(extractor.as_ref(), &images, ExtractionOptions::default()).await
        });
        let batch = handle.await.expect("task");
        assert_eq!(batch.records.len(), 3);
        assert_eq!(batch.failed(), 1);
    }

    #[tokio::test]
    async fn slow_extraction_times_out_into_fallback() {
        let extractor = StubExtractor {
            fail: HashSet::new(),
            slow: HashSet::from([0]),
        };
        let options = ExtractionOptions {
            timeout: Duration::from_millis(50),
            concurrency: 2,
        };
        let batch = extract_batch(&extractor, &images(3), options).await;
        assert!(batch.records[0].extraction_failed);
        assert!(batch.errors[0].contains("timed out"));
        assert!(!batch.records[1].extraction_failed);
        assert!(!batch.records[2].extraction_failed);
    }

    #[test]
    fn fallback_is_deterministic_per_index() {
        let a = AttributeRecord::fallback(7, "x.jpg");
        let b = AttributeRecord::fallback(7, "x.jpg");
        assert_eq!(a, b);
        assert!(a.extraction_failed);
        assert_eq!(a.confidence, 0.0);
        assert_ne!(
            AttributeRecord::fallback(0, "x.jpg").furniture_type,
            AttributeRecord::fallback(1, "x.jpg").furniture_type
        );
    }

    #[test]
    fn fallback_records_never_reach_the_grouping_threshold_within_a_cycle() {
        let synonyms = Arc::new(default_synonyms().unwrap());
        let scorer = AttributeScorer::new(SimilarityWeights::default(), synonyms);
        let records: Vec<_> = (0..FALLBACK_CYCLE)
            .map(|i| AttributeRecord::fallback(i, format!("{i}.jpg")))
            .collect();
        let mut pairs = HashSet::new();
        for (i, a) in records.iter().enumerate() {
            let key = (a.furniture_type.clone(), a.primary_color.clone());
            assert!(pairs.insert(key), "type/color repeats at {i}");
            for b in &records[i + 1..] {
                assert!(scorer.score(a, b) < 0.7 - 1e-9);
            }
        }
        assert_eq!(
            AttributeRecord::fallback(FALLBACK_CYCLE, "x.jpg").furniture_type,
            records[0].furniture_type
        );
    }

    #[tokio::test]
    async fn failed_images_stay_in_separate_groups() {
        let synonyms = Arc::new(default_synonyms().unwrap());
        let scorer = Arc::new(AttributeScorer::new(
            SimilarityWeights::default(),
            synonyms.clone(),
        ));
        let engine = GroupingEngine::new(GroupingConfig::default(), scorer, synonyms);
        let records = vec![
            AttributeRecord::fallback(0, "a.jpg"),
            AttributeRecord::fallback(1, "b.jpg"),
        ];
        let outcome = engine.group(&records).await;
        assert_eq!(outcome.groups.len(), 2);

        let pairwise = engine.group_pairwise(&records).unwrap();
        assert_eq!(pairwise.len(), 2);
        assert_eq!(pairwise[0].strategy, GroupingStrategy::Pairwise);
        assert_eq!(pairwise[0].aggregate_confidence, 0.0);
        assert!(pairwise[0].all_failed());
    }

    struct CapturingModel {
        reply: String,
        seen: Mutex<Vec<Value>>,
    }

    #[async_trait]
    impl ChatModel for CapturingModel {
        async fn chat(
            &self,
            _function_name: &str,
            messages: &[LlmMessage],
        ) -> Result<LlmResponse, LlmError> {
            self.seen
                .lock()
                .unwrap()
                .push(serde_json::to_value(messages).unwrap());
            Ok(LlmResponse {
                text: self.reply.clone(),
                usage: None,
            })
        }
    }

    #[tokio::test]
    async fn vision_extractor_inlines_local_files_and_parses_reply() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sofa.png");
        std::fs::write(&path, [0x89, b'P', b'N', b'G']).unwrap();

        let model = Arc::new(CapturingModel {
            reply: r#"{"furniture_type":"Sofa","primary_color":"Gray","material":"unknown",
                "style":"Modern","condition":"Excellent","features":["reclining"],
                "suggested_price":"$450","confidence":0.82}"#
                .into(),
            seen: Mutex::new(Vec::new()),
        });
        let extractor = VisionExtractor::new(model.clone(), "furniture_vision");
        let path_str = path.to_string_lossy().to_string();
        let record = extractor.extract(3, &path_str).await.expect("record");

        assert_eq!(record.index, 3);
        assert_eq!(record.furniture_type.as_deref(), Some("Sofa"));
        assert_eq!(record.material, None);
        assert_eq!(record.condition, Some(Condition::LikeNew));
        assert_eq!(record.suggested_price, Some(450.0));
        assert!((record.confidence - 0.82).abs() < 1e-9);
        assert!(record.features.contains("reclining"));

        let seen = model.seen.lock().unwrap();
        let url = seen[0][0]["content"][1]["url"].as_str().unwrap();
        assert!(url.starts_with("data:image/png;base64,"));
    }

    #[tokio::test]
    async fn vision_extractor_reports_unreadable_files() {
        let model = Arc::new(CapturingModel {
            reply: "{}".into(),
            seen: Mutex::new(Vec::new()),
        });
        let extractor = VisionExtractor::new(model, "furniture_vision");
        let err = extractor
            .extract(0, "/definitely/not/here.jpg")
            .await
            .expect_err("missing file");
        assert!(matches!(err, ExtractionError::Read { .. }));
    }

    #[test]
    fn prices_parse_from_numbers_and_strings() {
        assert_eq!(price_from_value(&serde_json::json!(120)), Some(120.0));
        assert_eq!(price_from_value(&serde_json::json!("$1,200.50")), Some(1200.5));
        assert_eq!(price_from_value(&serde_json::json!("ask")), None);
        assert_eq!(price_from_value(&Value::Null), None);
        assert_eq!(price_from_value(&serde_json::json!(-50)), None);
        assert_eq!(price_from_value(&serde_json::json!("-50")), None);
        assert_eq!(price_from_value(&serde_json::json!("$-50")), None);
        assert_eq!(price_from_value(&serde_json::json!("1.2.3")), None);
    }
}

