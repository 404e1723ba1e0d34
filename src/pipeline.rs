use crate::config::{AppConfig, ConfigError};
use crate::export::{ArchiveHandle, ExportPackager};
use crate::furniture::extract::{
    AttributeExtractor, ExtractionBatch, UnconfiguredExtractor, VisionExtractor, extract_batch,
};
use crate::furniture::grouping::{GroupingEngine, GroupingOutcome};
use crate::furniture::holistic::LlmHolisticGrouper;
use crate::furniture::listing::{
    LlmListingAssembler, Listing, ListingAssembler, TemplateAssembler, assemble_listings,
};
use crate::furniture::similarity::AttributeScorer;
use crate::furniture::synonyms::SynonymTables;
use crate::llm::{ChatModel, LlmClient};
use crate::models::{BatchRequest, BatchResponse, StageReport};
use crate::supabase::SupabaseClient;
use serde_json::{Value, json};
use std::{collections::HashMap, future::Future, sync::Arc, time::Instant};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

/// Wires the collaborators together and runs one batch end to end.
#[derive(Clone)]
pub struct Pipeline {
    config: Arc<AppConfig>,
    synonyms: Arc<SynonymTables>,
    scorer: Arc<AttributeScorer>,
    extractor: Arc<dyn AttributeExtractor>,
    grouping: GroupingEngine,
    assembler: Arc<dyn ListingAssembler>,
    exporter: ExportPackager,
    supabase: Option<SupabaseClient>,
}

impl Pipeline {
    /// Validate `config` and build the collaborators it describes. Without a
    /// gateway, extraction takes the fallback path and listings are templated.
    pub fn from_config(config: AppConfig) -> Result<Self, ConfigError> {
        let synonyms = Arc::new(config.validate()?);
        let scorer = Arc::new(AttributeScorer::new(config.weights, synonyms.clone()));
        let mut grouping =
            GroupingEngine::new(config.grouping.clone(), scorer.clone(), synonyms.clone());

        let (extractor, assembler): (Arc<dyn AttributeExtractor>, Arc<dyn ListingAssembler>) =
            match (config.llm.as_ref(), config.llm_config()) {
                (Some(settings), Some(llm_config)) => {
                    let model: Arc<dyn ChatModel> = Arc::new(LlmClient::new(llm_config));
                    grouping = grouping.with_holistic(Arc::new(LlmHolisticGrouper::new(
                        model.clone(),
                        settings.grouping_function.clone(),
                    )));
                    (
                        Arc::new(VisionExtractor::new(
                            model.clone(),
                            settings.vision_function.clone(),
                        )),
                        Arc::new(LlmListingAssembler::new(
                            model,
                            settings.listing_function.clone(),
                            synonyms.clone(),
                        )),
                    )
                }
                _ => (
                    Arc::new(UnconfiguredExtractor),
                    Arc::new(TemplateAssembler::new(synonyms.clone())),
                ),
            };

        let supabase = config.supabase.as_ref().map(|settings| {
            SupabaseClient::new(settings, config.http_timeout, config.http_connect_timeout)
        });
        let exporter = ExportPackager::new(config.export_dir.clone());

        Ok(Self {
            config: Arc::new(config),
            synonyms,
            scorer,
            extractor,
            grouping,
            assembler,
            exporter,
            supabase,
        })
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn AttributeExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_assembler(mut self, assembler: Arc<dyn ListingAssembler>) -> Self {
        self.assembler = assembler;
        self
    }

    pub fn with_grouping(mut self, grouping: GroupingEngine) -> Self {
        self.grouping = grouping;
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn synonyms(&self) -> &SynonymTables {
        &self.synonyms
    }

    pub fn scorer(&self) -> &AttributeScorer {
        &self.scorer
    }

    pub fn grouping(&self) -> &GroupingEngine {
        &self.grouping
    }

    pub fn assembler(&self) -> &dyn ListingAssembler {
        self.assembler.as_ref()
    }

    pub fn exporter(&self) -> &ExportPackager {
        &self.exporter
    }

    pub async fn extract(&self, images: &[String]) -> ExtractionBatch {
        extract_batch(self.extractor.as_ref(), images, self.config.extraction).await
    }

    pub async fn run(&self, request: BatchRequest) -> Result<BatchResponse, PipelineError> {
        let batch_id = Uuid::new_v4().to_string();
        let mut stages = Vec::new();
        let mut errors = Vec::new();
        info!(target = "furnish.pipeline", batch_id = %batch_id, "batch_started");

        let images = self
            .capture_stage("resolve_images", &mut stages, async {
                stages::resolve_images(&request.images_source, self.config.max_images)
            })
            .await?;

        let extraction = self
            .capture_stage("extract_attributes", &mut stages, async {
                let batch = self.extract(&images).await;
                let output = json!({
                    "records": batch.records.len(),
                    "failed": batch.failed(),
                });
                Ok(StageOutcome::new(batch, output))
            })
            .await?;
        let failed_extractions = extraction.failed();
        errors.extend(extraction.errors.iter().cloned());

        let grouping = self
            .capture_stage("group_records", &mut stages, async {
                let outcome = self.grouping.group(&extraction.records).await;
                let output = json!({
                    "strategy": outcome.strategy,
                    "groups": outcome.groups.len(),
                    "sizes": outcome.groups.iter().map(|g| g.members.len()).collect::<Vec<_>>(),
                    "fallthrough": outcome.errors,
                });
                Ok(StageOutcome::new(outcome, output))
            })
            .await?;
        errors.extend(grouping.errors.iter().map(|e| format!("grouping {e}")));

        let listings = self
            .capture_stage("assemble_listings", &mut stages, async {
                let (listings, failures) = assemble_listings(
                    self.assembler.as_ref(),
                    &grouping.groups,
                    &self.synonyms,
                    self.config.assembly_concurrency,
                )
                .await;
                ensure_coverage(&images, &listings)?;
                let output = json!({
                    "listings": listings.len(),
                    "placeholders": failures.len(),
                    "needs_review": listings.iter().filter(|l| l.needs_review).count(),
                });
                Ok(StageOutcome::new((listings, failures), output))
            })
            .await?;
        let (listings, listing_errors) = listings;
        errors.extend(listing_errors.into_iter().map(|e| format!("listing {e}")));

        if !request.dry_run
            && let Some(client) = &self.supabase
        {
            let persist_error = self
                .capture_stage("persist_listings", &mut stages, async {
                    match client.insert_listings(&batch_id, &listings).await {
                        Ok(rows) => Ok(StageOutcome::new(None, json!({ "rows": rows }))),
                        Err(err) => {
                            warn!(
                                target = "furnish.supabase",
                                batch_id = %batch_id,
                                error = %err,
                                "listing_persist_failed"
                            );
                            let message = format!("persist: {err}");
                            Ok(StageOutcome::new(
                                Some(message.clone()),
                                json!({ "rows": 0, "error": message }),
                            ))
                        }
                    }
                })
                .await?;
            errors.extend(persist_error);
        }

        let mut archive: Option<ArchiveHandle> = None;
        if request.export && !request.dry_run {
            archive = self
                .capture_stage("export", &mut stages, async {
                    match self.exporter.export(&listings).await {
                        Ok(handle) => {
                            let output = json!({
                                "path": handle.path,
                                "missing_photos": handle.missing_photos.len(),
                            });
                            Ok(StageOutcome::new(Some(handle), output))
                        }
                        Err(err) => {
                            warn!(
                                target = "furnish.export",
                                batch_id = %batch_id,
                                error = %err,
                                "export_failed"
                            );
                            errors.push(format!("export: {err}"));
                            Ok(StageOutcome::new(None, json!({ "error": err.to_string() })))
                        }
                    }
                })
                .await?;
        }

        let GroupingOutcome {
            groups, strategy, ..
        } = grouping;
        crate::metrics::batch_completed(strategy.name(), images.len(), groups.len(), errors.len());
        info!(
            target = "furnish.pipeline",
            batch_id = %batch_id,
            images = images.len(),
            groups = groups.len(),
            errors = errors.len(),
            "batch_completed"
        );

        Ok(BatchResponse {
            batch_id,
            image_count: images.len(),
            failed_extractions,
            group_count: groups.len(),
            listing_count: listings.len(),
            strategy,
            groups,
            listings,
            errors,
            stages,
            archive,
        })
    }

    async fn capture_stage<T, Fut>(
        &self,
        name: &'static str,
        stages: &mut Vec<StageReport>,
        fut: Fut,
    ) -> Result<T, PipelineError>
    where
        Fut: Future<Output = Result<StageOutcome<T>, PipelineError>>,
    {
        let started = Instant::now();
        let outcome = fut.await?;
        let elapsed_ms = started.elapsed().as_millis();
        crate::metrics::stage_elapsed(name, elapsed_ms);
        stages.push(StageReport::new(name, elapsed_ms, outcome.output));
        Ok(outcome.value)
    }
}

/// Every resolved image must appear in exactly one listing.
fn ensure_coverage(images: &[String], listings: &[Listing]) -> Result<(), PipelineError> {
    let mut counts: HashMap<&str, usize> = images.iter().map(|i| (i.as_str(), 0)).collect();
    for image in listings.iter().flat_map(|l| l.images.iter()) {
        match counts.get_mut(image.as_str()) {
            Some(count) => *count += 1,
            None => {
                return Err(PipelineError::internal(
                    "assemble_listings",
                    format!("listing references unknown image {image}"),
                ));
            }
        }
    }
    if let Some((image, count)) = counts.iter().find(|(_, count)| **count != 1) {
        return Err(PipelineError::internal(
            "assemble_listings",
            format!("image {image} appears in {count} listings"),
        ));
    }
    Ok(())
}

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct PipelineError {
    stage: &'static str,
    message: String,
    kind: PipelineErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineErrorKind {
    InvalidInput,
    Internal,
}

impl PipelineError {
    pub fn invalid_input(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::InvalidInput,
        }
    }

    pub fn internal(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::Internal,
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> PipelineErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }
}

#[derive(Debug)]
pub struct StageOutcome<T> {
    pub value: T,
    pub output: Value,
}

impl<T> StageOutcome<T> {
    fn new(value: T, output: Value) -> Self {
        Self { value, output }
    }
}

pub mod stages {
    use super::*;
    use crate::models::ImagesSource;
    use std::collections::HashSet;
    use std::path::{Component, Path};

    pub fn resolve_images(
        source: &ImagesSource,
        max_images: usize,
    ) -> Result<StageOutcome<Vec<String>>, PipelineError> {
        let resolved = match source {
            ImagesSource::Single(value) => tokenize(value),
            ImagesSource::Multiple(values) => values
                .iter()
                .flat_map(|value| tokenize(value))
                .collect::<Vec<_>>(),
        };
        let resolved = deduplicate(resolved);

        if resolved.is_empty() {
            return Err(PipelineError::invalid_input(
                "resolve_images",
                "no images provided",
            ));
        }

        if resolved.len() > max_images {
            return Err(PipelineError::invalid_input(
                "resolve_images",
                format!("too_many_images: {} > {max_images}", resolved.len()),
            ));
        }

        let mut remote = 0;
        for image in &resolved {
            if image.contains("://") {
                match reqwest::Url::parse(image) {
                    Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => remote += 1,
                    Ok(_) => {
                        return Err(PipelineError::invalid_input(
                            "resolve_images",
                            format!("unsupported_url_scheme: {image}"),
                        ));
                    }
                    Err(_) => {
                        return Err(PipelineError::invalid_input(
                            "resolve_images",
                            format!("invalid_image_url: {image}"),
                        ));
                    }
                }
            } else if Path::new(image)
                .components()
                .any(|c| matches!(c, Component::ParentDir))
            {
                return Err(PipelineError::invalid_input(
                    "resolve_images",
                    format!("path_traversal: {image}"),
                ));
            }
        }

        let preview: Vec<&str> = resolved.iter().take(4).map(String::as_str).collect();

        Ok(StageOutcome::new(
            resolved.clone(),
            json!({
                "count": resolved.len(),
                "remote": remote,
                "local": resolved.len() - remote,
                "preview": preview,
            }),
        ))
    }

    fn tokenize(value: &str) -> Vec<String> {
        value
            .split(['\n', ',', ';', '|'])
            .map(|entry| entry.trim())
            .filter(|entry| !entry.is_empty())
            .map(|entry| entry.to_string())
            .collect()
    }

    fn deduplicate(values: Vec<String>) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut result = Vec::new();
        for value in values {
            if seen.insert(value.clone()) {
                result.push(value);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::furniture::attributes::AttributeRecord;
    use crate::furniture::extract::ExtractionError;
    use crate::furniture::listing::AssemblyError;
    use crate::furniture::grouping::GroupingStrategy;
    use crate::furniture::grouping::Group;
    use crate::furniture::holistic::{
        HolisticError, HolisticGrouper, HolisticProposal, ProposedGroup,
    };
    use crate::models::ImagesSource;
    use async_trait::async_trait;
    use std::collections::HashSet;

    fn offline() -> Pipeline {
        Pipeline::from_config(AppConfig::default()).expect("default config is valid")
    }

    fn request(images: &[&str]) -> BatchRequest {
        BatchRequest {
            images_source: ImagesSource::Multiple(images.iter().map(|s| s.to_string()).collect()),
            export: false,
            dry_run: false,
        }
    }

    fn stage_names(response: &BatchResponse) -> Vec<String> {
        response.stages.iter().map(|s| s.name.clone()).collect()
    }

    fn assert_each_image_listed_once(response: &BatchResponse) {
        let mut seen = HashSet::new();
        for image in response.listings.iter().flat_map(|l| l.images.iter()) {
            assert!(seen.insert(image.clone()), "{image} listed twice");
        }
        assert_eq!(seen.len(), response.image_count);
    }

    /// Chairs for names containing "chair", tables otherwise; fails on "bad".
    struct NameExtractor;

    #[async_trait]
    impl AttributeExtractor for NameExtractor {
        async fn extract(
            &self,
            index: usize,
            image_ref: &str,
        ) -> Result<AttributeRecord, ExtractionError> {
            if image_ref.contains("bad") {
                return Err(ExtractionError::Unavailable);
            }
            let (kind, color) = if image_ref.contains("chair") {
                ("Chair", "Blue")
            } else {
                ("Table", "Brown")
            };
            Ok(AttributeRecord::new(index, image_ref)
                .with_type(kind)
                .with_color(color)
                .with_confidence(0.9)
                .with_price(Some(80.0)))
        }
    }

    struct RefusingAssembler;

    #[async_trait]
    impl ListingAssembler for RefusingAssembler {
        async fn assemble(&self, group: &Group) -> Result<Listing, AssemblyError> {
            Err(AssemblyError::Invalid(format!("no title for {}", group.group_id)))
        }
    }

    struct PartialGrouper;

    #[async_trait]
    impl HolisticGrouper for PartialGrouper {
        async fn propose(
            &self,
            _records: &[AttributeRecord],
        ) -> Result<HolisticProposal, HolisticError> {
            Ok(HolisticProposal {
                groups: vec![ProposedGroup::of(&[0, 1])],
                ..HolisticProposal::default()
            })
        }
    }

    #[test]
    fn resolve_images_splits_trims_and_dedupes() {
        let source = ImagesSource::Single(
            "https://cdn.example.com/a.jpg, uploads/b.jpg;\nuploads/b.jpg | https://cdn.example.com/c.jpg"
                .into(),
        );
        let out = stages::resolve_images(&source, 15).expect("resolve");
        assert_eq!(
            out.value,
            vec![
                "https://cdn.example.com/a.jpg",
                "uploads/b.jpg",
                "https://cdn.example.com/c.jpg"
            ]
        );
        assert_eq!(out.output["remote"], json!(2));
        assert_eq!(out.output["local"], json!(1));
    }

    #[test]
    fn resolve_images_rejects_bad_input() {
        let cases = [
            ImagesSource::Multiple(vec![]),
            ImagesSource::Single(" , ".into()),
            ImagesSource::Multiple(vec!["ftp://example.com/a.jpg".into()]),
            ImagesSource::Multiple(vec!["file:///etc/passwd".into()]),
            ImagesSource::Multiple(vec!["uploads/../../etc/passwd".into()]),
        ];
        for source in cases {
            let err = stages::resolve_images(&source, 15).expect_err("should reject");
            assert_eq!(err.kind(), PipelineErrorKind::InvalidInput);
            assert_eq!(err.stage(), "resolve_images");
        }

        let many = ImagesSource::Multiple((0..16).map(|i| format!("{i}.jpg")).collect());
        let err = stages::resolve_images(&many, 15).expect_err("too many");
        assert!(err.detail().starts_with("too_many_images"));
    }

    #[tokio::test]
    async fn offline_run_lists_every_image_once() {
        let response = offline()
            .run(request(&["a.jpg", "b.jpg", "c.jpg"]))
            .await
            .expect("run");
        assert_eq!(
            stage_names(&response),
            vec![
                "resolve_images",
                "extract_attributes",
                "group_records",
                "assemble_listings"
            ]
        );
        assert_eq!(response.image_count, 3);
        assert_eq!(response.failed_extractions, 3);
        assert_eq!(response.group_count, 3);
        assert_eq!(response.listing_count, 3);
        assert_eq!(response.errors.len(), 3);
        assert!(response.listings.iter().all(|l| l.needs_review));
        assert!(response.archive.is_none());
        assert_each_image_listed_once(&response);
    }

    #[tokio::test]
    async fn grouped_images_share_a_listing() {
        let pipeline = offline().with_extractor(Arc::new(NameExtractor));
        let response = pipeline
            .run(request(&["chair_1.jpg", "table.jpg", "chair_2.jpg", "bad.jpg"]))
            .await
            .expect("run");
        assert_eq!(response.strategy, GroupingStrategy::Pairwise);
        assert_eq!(response.group_count, 3);
        assert_eq!(response.listings[0].images, vec!["chair_1.jpg", "chair_2.jpg"]);
        assert_eq!(response.listings[0].price, 80.0);
        assert!(!response.listings[0].needs_review);
        assert!(response.listings[2].needs_review);
        assert_eq!(response.failed_extractions, 1);
        assert_eq!(response.errors.len(), 1);
        assert_each_image_listed_once(&response);
    }

    #[tokio::test]
    async fn failed_assembly_falls_back_to_placeholders() {
        let pipeline = offline()
            .with_extractor(Arc::new(NameExtractor))
            .with_assembler(Arc::new(RefusingAssembler));
        let response = pipeline
            .run(request(&["chair_1.jpg", "chair_2.jpg", "table.jpg"]))
            .await
            .expect("run");
        assert_eq!(response.listing_count, 2);
        assert!(response.listings.iter().all(|l| l.used_fallback && l.needs_review));
        assert_eq!(
            response
                .errors
                .iter()
                .filter(|e| e.starts_with("listing group_"))
                .count(),
            2
        );
        assert_each_image_listed_once(&response);
    }

    #[tokio::test]
    async fn invalid_holistic_partition_is_reported_and_recovered() {
        let base = offline().with_extractor(Arc::new(NameExtractor));
        let engine = base
            .grouping()
            .clone()
            .with_holistic(Arc::new(PartialGrouper));
        let pipeline = base.with_grouping(engine);
        let response = pipeline
            .run(request(&["chair_1.jpg", "chair_2.jpg", "table.jpg"]))
            .await
            .expect("run");
        assert_eq!(response.strategy, GroupingStrategy::Pairwise);
        assert!(response.errors.iter().any(|e| e.starts_with("grouping holistic")));
        assert_each_image_listed_once(&response);
    }

    #[tokio::test]
    async fn export_runs_when_requested() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig {
            export_dir: dir.path().to_path_buf(),
            ..AppConfig::default()
        };
        let pipeline = Pipeline::from_config(config)
            .unwrap()
            .with_extractor(Arc::new(NameExtractor));

        let mut req = request(&["chair_1.jpg", "chair_2.jpg"]);
        req.export = true;
        let response = pipeline.run(req).await.expect("run");
        assert_eq!(stage_names(&response).last().map(String::as_str), Some("export"));
        let archive = response.archive.expect("archive");
        assert!(archive.csv_path.is_file());
        assert_eq!(archive.missing_photos.len(), 2);

        let mut dry = request(&["chair_1.jpg"]);
        dry.export = true;
        dry.dry_run = true;
        let response = pipeline.run(dry).await.expect("run");
        assert!(response.archive.is_none());
        assert!(!stage_names(&response).contains(&"export".to_string()));
    }

    #[test]
    fn invalid_config_refuses_to_build() {
        let config = AppConfig {
            max_images: 0,
            ..AppConfig::default()
        };
        assert!(Pipeline::from_config(config).is_err());
    }

    #[test]
    fn coverage_check_catches_dropped_and_duplicated_images() {
        let pipeline_images = vec!["a".to_string(), "b".to_string()];
        let listing = |images: &[&str]| Listing {
            listing_id: "FUR-1".into(),
            group_id: "group_0".into(),
            title: "t".into(),
            price: 0.0,
            condition: "Used - Good".into(),
            description: String::new(),
            category: String::new(),
            images: images.iter().map(|s| s.to_string()).collect(),
            confidence: 0.0,
            needs_review: true,
            used_fallback: false,
            reasoning: None,
        };
        assert!(ensure_coverage(&pipeline_images, &[listing(&["a", "b"])]).is_ok());
        assert!(ensure_coverage(&pipeline_images, &[listing(&["a"])]).is_err());
        assert!(ensure_coverage(&pipeline_images, &[listing(&["a", "b"]), listing(&["b"])]).is_err());
        assert!(ensure_coverage(&pipeline_images, &[listing(&["a", "b", "c"])]).is_err());
    }
}
