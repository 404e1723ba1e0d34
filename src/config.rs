use crate::furniture::extract::{ExtractionOptions, FALLBACK_CYCLE};
use crate::furniture::grouping::{GroupingConfig, GroupingStrategy};
use crate::furniture::similarity::{SimilarityWeights, WeightsError};
use crate::furniture::synonyms::{SynonymError, SynonymTables, default_synonyms};
use crate::llm::LlmConfig;
use std::{path::PathBuf, str::FromStr, time::Duration};
use thiserror::Error;
use tracing::warn;

/// Settings for the model gateway. Absent when `TENSORZERO_GATEWAY_URL` is
/// unset, in which case extraction falls back and listings use templates.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmSettings {
    pub gateway_url: String,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub vision_function: String,
    pub grouping_function: String,
    pub listing_function: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SupabaseSettings {
    pub url: String,
    pub service_key: String,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub request_max_bytes: usize,
    pub max_images: usize,
    pub extraction: ExtractionOptions,
    pub assembly_concurrency: usize,
    pub grouping: GroupingConfig,
    pub weights: SimilarityWeights,
    pub export_dir: PathBuf,
    pub llm: Option<LlmSettings>,
    pub http_timeout: Duration,
    pub http_connect_timeout: Duration,
    pub queue_capacity: usize,
    pub redis_url: Option<String>,
    pub idempotency_ttl_secs: u64,
    pub supabase: Option<SupabaseSettings>,
    pub metrics_key: Option<String>,
    pub openapi_key: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var} has an invalid value `{value}`")]
    Invalid { var: &'static str, value: String },
    #[error("SIMILARITY_WEIGHTS: {0}")]
    Weights(#[from] WeightsError),
    #[error("GROUPING_THRESHOLD must be in (0, 1], got {0}")]
    Threshold(f64),
    #[error("GROUPING_STRATEGIES must name at least one strategy")]
    NoStrategies,
    #[error("unknown grouping strategy `{0}`")]
    UnknownStrategy(String),
    #[error("grouping strategy `{0}` listed twice")]
    DuplicateStrategy(String),
    #[error("EXTRACTION_TIMEOUT_SECS must be greater than zero")]
    ZeroTimeout,
    #[error("{var} must be at least 1")]
    Concurrency { var: &'static str },
    #[error("MAX_IMAGES must be between 1 and {max}, got {value}")]
    MaxImages { value: usize, max: usize },
    #[error("synonym tables: {0}")]
    Synonyms(#[from] SynonymError),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            request_max_bytes: 256 * 1024,
            max_images: 15,
            extraction: ExtractionOptions::default(),
            assembly_concurrency: 4,
            grouping: GroupingConfig::default(),
            weights: SimilarityWeights::default(),
            export_dir: PathBuf::from("exports"),
            llm: None,
            http_timeout: Duration::from_secs(60),
            http_connect_timeout: Duration::from_secs(5),
            queue_capacity: 64,
            redis_url: None,
            idempotency_ttl_secs: 3600,
            supabase: None,
            metrics_key: None,
            openapi_key: None,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();

        let weights = match get("SIMILARITY_WEIGHTS") {
            Some(raw) => SimilarityWeights::parse(&raw)?,
            None => defaults.weights,
        };
        let strategies = match get("GROUPING_STRATEGIES") {
            Some(raw) => parse_strategies(&raw)?,
            None => defaults.grouping.strategies.clone(),
        };

        let llm = get("TENSORZERO_GATEWAY_URL").map(|gateway_url| LlmSettings {
            gateway_url: gateway_url.trim_end_matches('/').to_string(),
            api_key: get("TENSORZERO_API_KEY"),
            model: get("TENSORZERO_MODEL"),
            vision_function: get("TENSORZERO_VISION_FUNCTION")
                .unwrap_or_else(|| "furniture_vision".into()),
            grouping_function: get("TENSORZERO_GROUPING_FUNCTION")
                .unwrap_or_else(|| "furniture_grouping".into()),
            listing_function: get("TENSORZERO_LISTING_FUNCTION")
                .unwrap_or_else(|| "furniture_listing".into()),
        });

        let supabase = get("SUPABASE_URL").and_then(|url| {
            let service_key = get("SUPABASE_SERVICE_ROLE_KEY").or_else(|| get("SUPABASE_KEY"))?;
            Some(SupabaseSettings {
                url: url.trim_end_matches('/').to_string(),
                service_key,
            })
        });

        Ok(Self {
            port: parse_or(&get, "PORT", defaults.port)?,
            request_max_bytes: parse_or(&get, "REQUEST_MAX_BYTES", defaults.request_max_bytes)?,
            max_images: parse_or(&get, "MAX_IMAGES", defaults.max_images)?,
            extraction: ExtractionOptions {
                timeout: Duration::from_secs(parse_or(&get, "EXTRACTION_TIMEOUT_SECS", 45u64)?),
                concurrency: parse_or(
                    &get,
                    "EXTRACTION_CONCURRENCY",
                    defaults.extraction.concurrency,
                )?,
            },
            assembly_concurrency: parse_or(
                &get,
                "ASSEMBLY_CONCURRENCY",
                defaults.assembly_concurrency,
            )?,
            grouping: GroupingConfig {
                strategies,
                threshold: parse_or(&get, "GROUPING_THRESHOLD", defaults.grouping.threshold)?,
            },
            weights,
            export_dir: get("EXPORT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.export_dir),
            llm,
            http_timeout: Duration::from_secs(parse_or(&get, "HTTP_TIMEOUT_SECS", 60u64)?),
            http_connect_timeout: Duration::from_secs(parse_or(
                &get,
                "HTTP_CONNECT_TIMEOUT_SECS",
                5u64,
            )?),
            queue_capacity: parse_or(&get, "QUEUE_CAPACITY", defaults.queue_capacity)?,
            redis_url: get("REDIS_URL"),
            idempotency_ttl_secs: parse_or(
                &get,
                "IDEMPOTENCY_TTL_SECS",
                defaults.idempotency_ttl_secs,
            )?,
            supabase,
            metrics_key: get("METRICS_KEY"),
            openapi_key: get("OPENAPI_KEY"),
        })
    }

    /// Startup checks. Any error here must stop the service before it takes
    /// traffic.
    pub fn validate(&self) -> Result<SynonymTables, ConfigError> {
        self.weights.validate()?;

        let threshold = self.grouping.threshold;
        if !threshold.is_finite() || threshold <= 0.0 || threshold > 1.0 {
            return Err(ConfigError::Threshold(threshold));
        }
        if self.grouping.strategies.is_empty() {
            return Err(ConfigError::NoStrategies);
        }
        if self.extraction.timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.extraction.concurrency == 0 {
            return Err(ConfigError::Concurrency {
                var: "EXTRACTION_CONCURRENCY",
            });
        }
        if self.assembly_concurrency == 0 {
            return Err(ConfigError::Concurrency {
                var: "ASSEMBLY_CONCURRENCY",
            });
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Concurrency {
                var: "QUEUE_CAPACITY",
            });
        }
        if self.max_images == 0 || self.max_images > FALLBACK_CYCLE {
            return Err(ConfigError::MaxImages {
                value: self.max_images,
                max: FALLBACK_CYCLE,
            });
        }

        if self.llm.is_none() && self.grouping.strategies.contains(&GroupingStrategy::Holistic) {
            warn!(
                target = "furnish.api",
                "holistic grouping configured without TENSORZERO_GATEWAY_URL; it will be skipped"
            );
        }

        Ok(default_synonyms()?)
    }

    pub fn llm_config(&self) -> Option<LlmConfig> {
        self.llm.as_ref().map(|settings| LlmConfig {
            gateway_url: settings.gateway_url.clone(),
            api_key: settings.api_key.clone(),
            model: settings.model.clone(),
            timeout: self.http_timeout,
            connect_timeout: self.http_connect_timeout,
        })
    }
}

fn parse_or<T, G>(get: &G, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(var) {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|_| ConfigError::Invalid { var, value: raw }),
        None => Ok(default),
    }
}

fn parse_strategies(raw: &str) -> Result<Vec<GroupingStrategy>, ConfigError> {
    let mut strategies = Vec::new();
    for name in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let strategy = GroupingStrategy::parse(name)
            .ok_or_else(|| ConfigError::UnknownStrategy(name.to_string()))?;
        if strategies.contains(&strategy) {
            return Err(ConfigError::DuplicateStrategy(strategy.name().to_string()));
        }
        strategies.push(strategy);
    }
    if strategies.is_empty() {
        return Err(ConfigError::NoStrategies);
    }
    Ok(strategies)
}
