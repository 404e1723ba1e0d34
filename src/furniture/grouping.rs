use crate::furniture::attributes::{AttributeField, AttributeRecord};
use crate::furniture::holistic::{HolisticGrouper, HolisticProposal};
use crate::furniture::similarity::SimilarityScorer;
use crate::furniture::synonyms::SynonymTables;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Absorbs float noise in weighted sums such as 0.4 + 0.3 against 0.7.
pub const SCORE_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupingStrategy {
    Holistic,
    Pairwise,
    Heuristic,
}

impl GroupingStrategy {
    pub fn name(self) -> &'static str {
        match self {
            GroupingStrategy::Holistic => "holistic",
            GroupingStrategy::Pairwise => "pairwise",
            GroupingStrategy::Heuristic => "heuristic",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_lowercase().as_str() {
            "holistic" | "llm" => Some(GroupingStrategy::Holistic),
            "pairwise" | "similarity" => Some(GroupingStrategy::Pairwise),
            "heuristic" => Some(GroupingStrategy::Heuristic),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupingConfig {
    /// Strategies in the order they are attempted.
    pub strategies: Vec<GroupingStrategy>,
    pub threshold: f64,
}

impl Default for GroupingConfig {
    fn default() -> Self {
        Self {
            strategies: vec![
                GroupingStrategy::Holistic,
                GroupingStrategy::Pairwise,
                GroupingStrategy::Heuristic,
            ],
            threshold: 0.7,
        }
    }
}

/// Photos believed to show one physical item. `members` is never empty when
/// produced by the engine and keeps the order records were added in.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub group_id: String,
    pub members: Vec<AttributeRecord>,
    pub aggregate_confidence: f64,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub strategy: GroupingStrategy,
}

impl Group {
    fn new(ordinal: usize, members: Vec<AttributeRecord>, strategy: GroupingStrategy) -> Self {
        let aggregate_confidence = if members.is_empty() {
            0.0
        } else {
            members.iter().map(|m| m.confidence).sum::<f64>() / members.len() as f64
        };
        Self {
            group_id: format!("group_{ordinal}"),
            members,
            aggregate_confidence,
            reasoning: None,
            description: None,
            strategy,
        }
    }

    /// First member added; the canonical attribute set for the item.
    pub fn representative(&self) -> Option<&AttributeRecord> {
        self.members.first()
    }

    pub fn image_refs(&self) -> Vec<String> {
        self.members.iter().map(|m| m.image_ref.clone()).collect()
    }

    pub fn indices(&self) -> Vec<usize> {
        self.members.iter().map(|m| m.index).collect()
    }

    pub fn mean_suggested_price(&self) -> Option<f64> {
        let prices: Vec<f64> = self
            .members
            .iter()
            .filter_map(|m| m.suggested_price)
            .collect();
        if prices.is_empty() {
            None
        } else {
            Some(prices.iter().sum::<f64>() / prices.len() as f64)
        }
    }

    pub fn all_failed(&self) -> bool {
        self.members.iter().all(|m| m.extraction_failed)
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum GroupingError {
    #[error("holistic grouper is not configured")]
    Unavailable,
    #[error("holistic grouper failed: {0}")]
    Collaborator(String),
    #[error("invalid partition: {0}")]
    InvalidPartition(String),
    #[error("scorer returned {score} for records {a} and {b}")]
    InvalidScore { a: usize, b: usize, score: f64 },
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupingOutcome {
    pub groups: Vec<Group>,
    pub strategy: GroupingStrategy,
    /// Failures of the strategies tried before `strategy`.
    pub errors: Vec<String>,
}

/// Partitions attribute records into groups, falling through an ordered list
/// of strategies. HEURISTIC always succeeds and is used after the configured
/// list is exhausted, so [`GroupingEngine::group`] is total.
#[derive(Clone)]
pub struct GroupingEngine {
    config: GroupingConfig,
    scorer: Arc<dyn SimilarityScorer>,
    synonyms: Arc<SynonymTables>,
    holistic: Option<Arc<dyn HolisticGrouper>>,
}

impl GroupingEngine {
    pub fn new(
        config: GroupingConfig,
        scorer: Arc<dyn SimilarityScorer>,
        synonyms: Arc<SynonymTables>,
    ) -> Self {
        Self {
            config,
            scorer,
            synonyms,
            holistic: None,
        }
    }

    pub fn with_holistic(mut self, grouper: Arc<dyn HolisticGrouper>) -> Self {
        self.holistic = Some(grouper);
        self
    }

    pub fn config(&self) -> &GroupingConfig {
        &self.config
    }

    pub fn has_holistic(&self) -> bool {
        self.holistic.is_some()
    }

    pub async fn group(&self, records: &[AttributeRecord]) -> GroupingOutcome {
        if records.len() <= 1 {
            return GroupingOutcome {
                groups: self.group_heuristic(records),
                strategy: GroupingStrategy::Heuristic,
                errors: Vec::new(),
            };
        }

        let mut errors = Vec::new();
        for strategy in &self.config.strategies {
            let attempt = match strategy {
                GroupingStrategy::Holistic => {
                    if self.holistic.is_none() {
                        debug!(target = "furnish.grouping", "holistic_skipped_unconfigured");
                        continue;
                    }
                    self.group_holistic(records).await
                }
                GroupingStrategy::Pairwise => self.group_pairwise(records),
                GroupingStrategy::Heuristic => Ok(self.group_heuristic(records)),
            };
            match attempt {
                Ok(groups) => {
                    info!(
                        target = "furnish.grouping",
                        strategy = strategy.name(),
                        records = records.len(),
                        groups = groups.len(),
                        "records_grouped"
                    );
                    return GroupingOutcome {
                        groups,
                        strategy: *strategy,
                        errors,
                    };
                }
                Err(err) => {
                    warn!(
                        target = "furnish.grouping",
                        strategy = strategy.name(),
                        error = %err,
                        "grouping_strategy_failed"
                    );
                    errors.push(format!("{}: {err}", strategy.name()));
                }
            }
        }

        GroupingOutcome {
            groups: self.group_heuristic(records),
            strategy: GroupingStrategy::Heuristic,
            errors,
        }
    }

    pub async fn group_holistic(
        &self,
        records: &[AttributeRecord],
    ) -> Result<Vec<Group>, GroupingError> {
        let grouper = self.holistic.as_ref().ok_or(GroupingError::Unavailable)?;
        let proposal = grouper
            .propose(records)
            .await
            .map_err(|err| GroupingError::Collaborator(err.to_string()))?;
        let proposed = proposal
            .groups
            .iter()
            .filter(|g| !g.image_indices.is_empty())
            .count();
        if let Some(total) = proposal.total_groups
            && total != proposed
        {
            warn!(
                target = "furnish.grouping",
                reported = total,
                proposed,
                "holistic_group_count_mismatch"
            );
        }
        debug!(
            target = "furnish.grouping",
            proposed,
            model_confidence = proposal.confidence.unwrap_or(0.0),
            "holistic_proposal_received"
        );
        groups_from_proposal(records, proposal)
    }

    /// Upper-triangle similarity matrix; `matrix[i][j]` is set for `j > i`.
    pub fn similarity_matrix(
        &self,
        records: &[AttributeRecord],
    ) -> Result<Vec<Vec<f64>>, GroupingError> {
        let n = records.len();
        let mut matrix = vec![vec![0.0; n]; n];
        for i in 0..n {
            matrix[i][i] = 1.0;
            for j in (i + 1)..n {
                let score = self.scorer.score(&records[i], &records[j]);
                if !score.is_finite() || !(0.0..=1.0).contains(&score) {
                    return Err(GroupingError::InvalidScore { a: i, b: j, score });
                }
                matrix[i][j] = score;
                matrix[j][i] = score;
            }
        }
        Ok(matrix)
    }

    /// Greedy single pass: each unassigned record seeds a group and absorbs
    /// every later unassigned record scoring at least the threshold against
    /// the seed.
    pub fn group_pairwise(&self, records: &[AttributeRecord]) -> Result<Vec<Group>, GroupingError> {
        let matrix = self.similarity_matrix(records)?;
        let threshold = self.config.threshold;
        Ok(greedy_partition(records, GroupingStrategy::Pairwise, |i, j| {
            matrix[i][j] + SCORE_EPSILON >= threshold
        }))
    }

    /// Exact type and color match after synonym normalisation. Records
    /// missing either field stay on their own.
    pub fn group_heuristic(&self, records: &[AttributeRecord]) -> Vec<Group> {
        let keys: Vec<Option<(String, String)>> = records
            .iter()
            .map(|record| {
                let kind = record
                    .field(AttributeField::FurnitureType)
                    .and_then(|v| self.synonyms.normalize(AttributeField::FurnitureType, v))?;
                let color = record
                    .field(AttributeField::Color)
                    .and_then(|v| self.synonyms.normalize(AttributeField::Color, v))?;
                Some((kind, color))
            })
            .collect();
        greedy_partition(records, GroupingStrategy::Heuristic, |i, j| {
            matches!((&keys[i], &keys[j]), (Some(a), Some(b)) if a == b)
        })
    }
}

fn greedy_partition<F>(
    records: &[AttributeRecord],
    strategy: GroupingStrategy,
    joins: F,
) -> Vec<Group>
where
    F: Fn(usize, usize) -> bool,
{
    let mut assigned = vec![false; records.len()];
    let mut groups = Vec::new();
    for seed in 0..records.len() {
        if assigned[seed] {
            continue;
        }
        assigned[seed] = true;
        let mut members = vec![records[seed].clone()];
        for candidate in (seed + 1)..records.len() {
            if !assigned[candidate] && joins(seed, candidate) {
                assigned[candidate] = true;
                members.push(records[candidate].clone());
            }
        }
        groups.push(Group::new(groups.len(), members, strategy));
    }
    groups
}

/// Checks that `groups` covers `0..len` exactly once.
pub fn validate_partition(len: usize, groups: &[Vec<usize>]) -> Result<(), GroupingError> {
    let mut seen = vec![false; len];
    for indices in groups {
        for &index in indices {
            if index >= len {
                return Err(GroupingError::InvalidPartition(format!(
                    "index {index} out of range for {len} images"
                )));
            }
            if seen[index] {
                return Err(GroupingError::InvalidPartition(format!(
                    "index {index} assigned more than once"
                )));
            }
            seen[index] = true;
        }
    }
    let missing: Vec<usize> = seen
        .iter()
        .enumerate()
        .filter(|(_, covered)| !**covered)
        .map(|(index, _)| index)
        .collect();
    if !missing.is_empty() {
        return Err(GroupingError::InvalidPartition(format!(
            "indices {missing:?} not assigned to any group"
        )));
    }
    Ok(())
}

fn groups_from_proposal(
    records: &[AttributeRecord],
    proposal: HolisticProposal,
) -> Result<Vec<Group>, GroupingError> {
    let mut proposed: Vec<_> = proposal
        .groups
        .into_iter()
        .filter(|group| !group.image_indices.is_empty())
        .map(|mut group| {
            group.image_indices.sort_unstable();
            group
        })
        .collect();

    let partition: Vec<Vec<usize>> = proposed.iter().map(|g| g.image_indices.clone()).collect();
    validate_partition(records.len(), &partition)?;

    proposed.sort_by_key(|group| group.image_indices[0]);
    Ok(proposed
        .into_iter()
        .enumerate()
        .map(|(ordinal, group)| {
            let members = group
                .image_indices
                .iter()
                .map(|&index| records[index].clone())
                .collect();
            let mut built = Group::new(ordinal, members, GroupingStrategy::Holistic);
            built.reasoning = group.reasoning.filter(|r| !r.trim().is_empty());
            built.description = group.furniture_description.filter(|d| !d.trim().is_empty());
            built
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::furniture::holistic::{HolisticError, ProposedGroup};
    use crate::furniture::similarity::{AttributeScorer, SimilarityWeights};
    use crate::furniture::synonyms::default_synonyms;
    use async_trait::async_trait;
    use rand::{Rng, SeedableRng, rngs::SmallRng};
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedGrouper {
        groups: Vec<Vec<usize>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl HolisticGrouper for FixedGrouper {
        async fn propose(
            &self,
            _records: &[AttributeRecord],
        ) -> Result<HolisticProposal, HolisticError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(HolisticProposal {
                groups: self.groups.iter().map(|g| ProposedGroup::of(g)).collect(),
                ..HolisticProposal::default()
            })
        }
    }

    struct MiscountingGrouper;

    #[async_trait]
    impl HolisticGrouper for MiscountingGrouper {
        async fn propose(
            &self,
            _records: &[AttributeRecord],
        ) -> Result<HolisticProposal, HolisticError> {
            Ok(HolisticProposal {
                groups: vec![ProposedGroup::of(&[0, 1]), ProposedGroup::of(&[2])],
                total_groups: Some(5),
                confidence: Some(0.4),
            })
        }
    }

    struct FailingGrouper;

    #[async_trait]
    impl HolisticGrouper for FailingGrouper {
        async fn propose(
            &self,
            _records: &[AttributeRecord],
        ) -> Result<HolisticProposal, HolisticError> {
            Err(HolisticError::Unavailable("gateway down".into()))
        }
    }

    struct NanScorer;

    impl SimilarityScorer for NanScorer {
        fn score(&self, _a: &AttributeRecord, _b: &AttributeRecord) -> f64 {
            f64::NAN
        }
    }

    fn synonyms() -> Arc<SynonymTables> {
        Arc::new(default_synonyms().expect("synonyms"))
    }

    fn engine() -> GroupingEngine {
        let synonyms = synonyms();
        let scorer = Arc::new(AttributeScorer::new(
            SimilarityWeights::default(),
            synonyms.clone(),
        ));
        GroupingEngine::new(GroupingConfig::default(), scorer, synonyms)
    }

    fn fixed(groups: Vec<Vec<usize>>) -> Arc<FixedGrouper> {
        Arc::new(FixedGrouper {
            groups,
            calls: AtomicUsize::new(0),
        })
    }

    fn scenario_records() -> Vec<AttributeRecord> {
        vec![
            AttributeRecord::new(0, "a.jpg")
                .with_type("Chair")
                .with_color("Blue")
                .with_confidence(0.9),
            AttributeRecord::new(1, "b.jpg")
                .with_type("Chair")
                .with_color("Blue")
                .with_style("Modern")
                .with_confidence(0.7),
            AttributeRecord::new(2, "c.jpg")
                .with_type("Table")
                .with_color("Brown")
                .with_confidence(0.8),
        ]
    }

    fn sizes(groups: &[Group]) -> Vec<usize> {
        groups.iter().map(|g| g.members.len()).collect()
    }

    fn assert_partition(records: &[AttributeRecord], groups: &[Group]) {
        let mut seen = BTreeSet::new();
        for group in groups {
            assert!(!group.members.is_empty());
            for member in &group.members {
                assert!(seen.insert(member.index), "index {} twice", member.index);
            }
        }
        let expected: BTreeSet<usize> = records.iter().map(|r| r.index).collect();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn pairwise_groups_matching_type_and_color() {
        let records = scenario_records();
        let outcome = engine().group(&records).await;
        assert_eq!(outcome.strategy, GroupingStrategy::Pairwise);
        assert!(outcome.errors.is_empty());
        assert_eq!(sizes(&outcome.groups), vec![2, 1]);
        assert_eq!(outcome.groups[0].indices(), vec![0, 1]);
        assert_eq!(outcome.groups[0].group_id, "group_0");
        assert_eq!(outcome.groups[1].group_id, "group_1");
        assert!((outcome.groups[0].aggregate_confidence - 0.8).abs() < 1e-9);
        assert_eq!(
            outcome.groups[0].representative().map(|r| r.index),
            Some(0)
        );
    }

    #[tokio::test]
    async fn pairwise_keeps_sparse_lookalikes_apart() {
        let records = vec![
            AttributeRecord::new(0, "a.jpg").with_type("Chair"),
            AttributeRecord::new(1, "b.jpg").with_type("Chair"),
            AttributeRecord::new(2, "c.jpg").with_style("Modern"),
            AttributeRecord::new(3, "d.jpg").with_style("Modern"),
        ];
        let engine = engine();
        let matrix = engine.similarity_matrix(&records).expect("matrix");
        assert!((matrix[0][1] - 0.4).abs() < 1e-9);
        assert!((matrix[2][3] - 0.1).abs() < 1e-9);

        let outcome = engine.group(&records).await;
        assert_eq!(outcome.strategy, GroupingStrategy::Pairwise);
        assert_eq!(sizes(&outcome.groups), vec![1, 1, 1, 1]);
    }

    #[tokio::test]
    async fn single_record_is_one_group_without_calling_model() {
        let grouper = fixed(vec![vec![0]]);
        let engine = engine().with_holistic(grouper.clone());
        let records = vec![AttributeRecord::new(0, "a.jpg")];
        let outcome = engine.group(&records).await;
        assert_eq!(sizes(&outcome.groups), vec![1]);
        assert_eq!(grouper.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_input_yields_no_groups() {
        let outcome = engine().group(&[]).await;
        assert!(outcome.groups.is_empty());
        assert!(outcome.errors.is_empty());
    }

    #[tokio::test]
    async fn reported_group_count_does_not_override_partition() {
        let engine = engine().with_holistic(Arc::new(MiscountingGrouper));
        let groups = engine
            .group_holistic(&scenario_records())
            .await
            .expect("valid partition");
        assert_eq!(sizes(&groups), vec![2, 1]);
    }

    #[tokio::test]
    async fn holistic_partition_is_normalised() {
        let engine = engine().with_holistic(fixed(vec![vec![2], vec![], vec![1, 0]]));
        let records = scenario_records();
        let outcome = engine.group(&records).await;
        assert_eq!(outcome.strategy, GroupingStrategy::Holistic);
        assert_eq!(outcome.groups[0].indices(), vec![0, 1]);
        assert_eq!(outcome.groups[1].indices(), vec![2]);
        assert_eq!(outcome.groups[0].group_id, "group_0");
    }

    #[tokio::test]
    async fn partial_holistic_partition_falls_through_to_pairwise() {
        let engine = engine().with_holistic(fixed(vec![vec![0, 1]]));
        let records = scenario_records();
        let outcome = engine.group(&records).await;
        assert_eq!(outcome.strategy, GroupingStrategy::Pairwise);
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.errors[0].contains("not assigned"));
        assert_partition(&records, &outcome.groups);
        assert_eq!(sizes(&outcome.groups), vec![2, 1]);
    }

    #[tokio::test]
    async fn overlapping_or_out_of_range_partition_is_rejected() {
        let records = scenario_records();
        for bad in [vec![vec![0, 1], vec![1, 2]], vec![vec![0, 1, 2, 3]]] {
            let engine = engine().with_holistic(fixed(bad));
            let outcome = engine.group(&records).await;
            assert_eq!(outcome.strategy, GroupingStrategy::Pairwise);
            assert_partition(&records, &outcome.groups);
        }
    }

    #[tokio::test]
    async fn failing_holistic_and_pairwise_end_in_heuristic() {
        let synonyms = synonyms();
        let engine = GroupingEngine::new(GroupingConfig::default(), Arc::new(NanScorer), synonyms)
            .with_holistic(Arc::new(FailingGrouper));
        let records = scenario_records();
        let outcome = engine.group(&records).await;
        assert_eq!(outcome.strategy, GroupingStrategy::Heuristic);
        assert_eq!(outcome.errors.len(), 2);
        assert!(outcome.errors[0].starts_with("holistic"));
        assert!(outcome.errors[1].starts_with("pairwise"));
        assert_partition(&records, &outcome.groups);
        assert_eq!(sizes(&outcome.groups), vec![2, 1]);
    }

    #[tokio::test]
    async fn heuristic_runs_even_when_not_listed() {
        let synonyms = synonyms();
        let config = GroupingConfig {
            strategies: vec![GroupingStrategy::Pairwise],
            threshold: 0.7,
        };
        let engine = GroupingEngine::new(config, Arc::new(NanScorer), synonyms);
        let records = scenario_records();
        let outcome = engine.group(&records).await;
        assert_eq!(outcome.strategy, GroupingStrategy::Heuristic);
        assert_partition(&records, &outcome.groups);
    }

    #[test]
    fn heuristic_keeps_unknown_records_apart() {
        let records: Vec<_> = (0..4)
            .map(|i| AttributeRecord::new(i, format!("{i}.jpg")))
            .collect();
        let groups = engine().group_heuristic(&records);
        assert_eq!(sizes(&groups), vec![1, 1, 1, 1]);
    }

    #[test]
    fn heuristic_uses_synonym_families() {
        let records = vec![
            AttributeRecord::new(0, "a.jpg").with_type("Couch").with_color("Grey"),
            AttributeRecord::new(1, "b.jpg").with_type("Sofa").with_color("Charcoal"),
            AttributeRecord::new(2, "c.jpg").with_type("Sofa"),
        ];
        let groups = engine().group_heuristic(&records);
        assert_eq!(sizes(&groups), vec![2, 1]);
    }

    #[test]
    fn validate_partition_reports_each_violation() {
        assert!(validate_partition(3, &[vec![0, 2], vec![1]]).is_ok());
        assert!(validate_partition(0, &[]).is_ok());
        assert!(matches!(
            validate_partition(2, &[vec![0]]),
            Err(GroupingError::InvalidPartition(_))
        ));
        assert!(validate_partition(2, &[vec![0, 1], vec![1]]).is_err());
        assert!(validate_partition(2, &[vec![0, 1, 5]]).is_err());
    }

    #[test]
    fn strategy_names_parse_back() {
        for strategy in [
            GroupingStrategy::Holistic,
            GroupingStrategy::Pairwise,
            GroupingStrategy::Heuristic,
        ] {
            assert_eq!(GroupingStrategy::parse(strategy.name()), Some(strategy));
        }
        assert_eq!(GroupingStrategy::parse("dbscan"), None);
    }

    #[tokio::test]
    async fn random_batches_are_always_partitioned() {
        const TYPES: &[&str] = &["Chair", "Armchair", "Table", "Sofa", "Couch", "", "unknown"];
        const COLORS: &[&str] = &["Blue", "Navy", "Brown", "Walnut", "White", ""];
        const MATERIALS: &[&str] = &["Oak", "Wood", "Steel", "Velvet Fabric", ""];
        const STYLES: &[&str] = &["Modern", "Rustic", "Mid Century", ""];

        let mut rng = SmallRng::seed_from_u64(0x5eed);
        let engine = engine();
        for _ in 0..200 {
            let len = rng.random_range(0..16);
            let records: Vec<_> = (0..len)
                .map(|i| {
                    AttributeRecord::new(i, format!("img_{i}.jpg"))
                        .with_type(TYPES[rng.random_range(0..TYPES.len())])
                        .with_color(COLORS[rng.random_range(0..COLORS.len())])
                        .with_material(MATERIALS[rng.random_range(0..MATERIALS.len())])
                        .with_style(STYLES[rng.random_range(0..STYLES.len())])
                        .with_confidence(rng.random_range(0.0..=1.0))
                })
                .collect();
            let outcome = engine.group(&records).await;
            assert_partition(&records, &outcome.groups);
            assert_partition(&records, &engine.group_heuristic(&records));
            assert!(outcome.groups.len() <= records.len());
        }
    }
}
