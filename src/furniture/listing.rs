use crate::furniture::attributes::{AttributeField, Condition, marketplace_condition};
use crate::furniture::extract::price_from_value;
use crate::furniture::grouping::Group;
use crate::furniture::synonyms::SynonymTables;
use crate::llm::{ChatModel, LlmError, LlmMessage, parse_json_reply};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;
use std::{fmt::Write as _, sync::Arc};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub const MAX_TITLE_CHARS: usize = 80;

const DEFAULT_CATEGORY: &str = "Home & Garden//Furniture";

const CATEGORY_PATHS: &[(&str, &str)] = &[
    ("chair", "Home & Garden//Furniture//Chairs"),
    ("table", "Home & Garden//Furniture//Tables"),
    ("sofa", "Home & Garden//Furniture//Sofas & Loveseats"),
    ("bed", "Home & Garden//Furniture//Beds & Mattresses"),
    ("desk", "Home & Garden//Furniture//Desks"),
    ("cabinet", "Home & Garden//Furniture//Cabinets & Storage"),
    ("bookshelf", "Home & Garden//Furniture//Bookcases & Shelving"),
    ("dresser", "Home & Garden//Furniture//Dressers & Armoires"),
    ("nightstand", "Home & Garden//Furniture//Nightstands"),
    ("ottoman", "Home & Garden//Furniture//Ottomans, Footrests & Poufs"),
    ("bench", "Home & Garden//Furniture//Benches"),
];

/// A marketplace-ready listing for one group.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub listing_id: String,
    /// Group this listing was assembled from.
    pub group_id: String,
    pub title: String,
    pub price: f64,
    pub condition: String,
    pub description: String,
    pub category: String,
    pub images: Vec<String>,
    pub confidence: f64,
    pub needs_review: bool,
    /// True when the listing is a placeholder substituted after a failure.
    #[serde(default)]
    pub used_fallback: bool,
    #[serde(default)]
    pub reasoning: Option<String>,
}

impl Listing {
    /// Minimal listing built from the group's attributes alone. Always
    /// flagged for review.
    pub fn placeholder(group: &Group, synonyms: &SynonymTables) -> Self {
        let mut listing = templated(group, synonyms);
        listing.needs_review = true;
        listing.used_fallback = true;
        listing
    }
}

#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error("group {0} has no members")]
    EmptyGroup(String),
    #[error("listing reply is unusable: {0}")]
    Invalid(String),
}

#[async_trait]
pub trait ListingAssembler: Send + Sync {
    async fn assemble(&self, group: &Group) -> Result<Listing, AssemblyError>;
}

/// Builds listings from attributes with fixed templates. Used when no model
/// gateway is configured.
pub struct TemplateAssembler {
    synonyms: Arc<SynonymTables>,
}

impl TemplateAssembler {
    pub fn new(synonyms: Arc<SynonymTables>) -> Self {
        Self { synonyms }
    }
}

#[async_trait]
impl ListingAssembler for TemplateAssembler {
    async fn assemble(&self, group: &Group) -> Result<Listing, AssemblyError> {
        if group.members.is_empty() {
            return Err(AssemblyError::EmptyGroup(group.group_id.clone()));
        }
        Ok(templated(group, &self.synonyms))
    }
}

pub struct LlmListingAssembler {
    model: Arc<dyn ChatModel>,
    function_name: String,
    synonyms: Arc<SynonymTables>,
}

impl LlmListingAssembler {
    pub fn new(
        model: Arc<dyn ChatModel>,
        function_name: impl Into<String>,
        synonyms: Arc<SynonymTables>,
    ) -> Self {
        Self {
            model,
            function_name: function_name.into(),
            synonyms,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListingReply {
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    price: Option<Value>,
    #[serde(default)]
    condition: Option<String>,
    #[serde(default)]
    category: Option<String>,
}

#[async_trait]
impl ListingAssembler for LlmListingAssembler {
    async fn assemble(&self, group: &Group) -> Result<Listing, AssemblyError> {
        let representative = group
            .representative()
            .ok_or_else(|| AssemblyError::EmptyGroup(group.group_id.clone()))?;
        let prompt = listing_prompt(group);
        let reply = self
            .model
            .chat(&self.function_name, &[LlmMessage::user(prompt)])
            .await?;
        let parsed: ListingReply = parse_json_reply(&reply.text)?;

        let title = truncate_title(&parsed.title);
        if title.is_empty() {
            return Err(AssemblyError::Invalid("empty title".into()));
        }
        let price = parsed
            .price
            .as_ref()
            .and_then(price_from_value)
            .or_else(|| group.mean_suggested_price())
            .unwrap_or(0.0);
        let condition = parsed
            .condition
            .as_deref()
            .and_then(Condition::parse)
            .or(representative.condition);
        let category = category_for(
            representative.field(AttributeField::FurnitureType),
            &self.synonyms,
        )
        .or_else(|| {
            parsed
                .category
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
        })
        .unwrap_or_else(|| DEFAULT_CATEGORY.to_string());
        let description = if parsed.description.trim().is_empty() {
            templated_description(group, &title)
        } else {
            parsed.description.trim().to_string()
        };

        Ok(Listing {
            listing_id: new_listing_id(),
            group_id: group.group_id.clone(),
            title,
            price: round_price(price),
            condition: marketplace_condition(condition).to_string(),
            description,
            category,
            images: group.image_refs(),
            confidence: group.aggregate_confidence,
            needs_review: group.aggregate_confidence <= 0.0,
            used_fallback: false,
            reasoning: group.reasoning.clone(),
        })
    }
}

/// Assembles every group with bounded concurrency, keeping group order. A
/// failed group gets [`Listing::placeholder`] and an entry in the error log.
pub async fn assemble_listings(
    assembler: &dyn ListingAssembler,
    groups: &[Group],
    synonyms: &SynonymTables,
    concurrency: usize,
) -> (Vec<Listing>, Vec<String>) {
    let results: Vec<_> = stream::iter(0..groups.len())
        .map(|position| async move { (position, assembler.assemble(&groups[position]).await) })
        .buffered(concurrency.max(1))
        .collect()
        .await;

    let mut listings = Vec::with_capacity(groups.len());
    let mut errors = Vec::new();
    for (position, result) in results {
        let group = &groups[position];
        match result {
            Ok(listing) => listings.push(listing),
            Err(err) => {
                warn!(
                    target = "furnish.listing",
                    group_id = %group.group_id,
                    error = %err,
                    "listing_assembly_failed_using_placeholder"
                );
                errors.push(format!("{}: {err}", group.group_id));
                listings.push(Listing::placeholder(group, synonyms));
            }
        }
    }
    info!(
        target = "furnish.listing",
        listings = listings.len(),
        placeholders = errors.len(),
        "listings_assembled"
    );
    (listings, errors)
}

/// Marketplace category path for a furniture type, if the type is known.
pub fn category_for(furniture_type: Option<&str>, synonyms: &SynonymTables) -> Option<String> {
    let canonical = synonyms.normalize(AttributeField::FurnitureType, furniture_type?)?;
    let table = synonyms.table(AttributeField::FurnitureType);
    let head = canonical
        .split_whitespace()
        .last()
        .map(|token| table.canonicalize(token).into_owned())
        .unwrap_or_default();
    CATEGORY_PATHS
        .iter()
        .find(|(kind, _)| *kind == canonical || *kind == head)
        .map(|(_, path)| path.to_string())
}

fn templated(group: &Group, synonyms: &SynonymTables) -> Listing {
    let representative = group.representative();
    let field = |f: AttributeField| representative.and_then(|r| r.field(f));

    let noun = field(AttributeField::FurnitureType).unwrap_or("Furniture Item");
    let title = [field(AttributeField::Style), field(AttributeField::Color)]
        .into_iter()
        .flatten()
        .chain(std::iter::once(noun))
        .collect::<Vec<_>>()
        .join(" ");
    let title = truncate_title(&title);
    let description = templated_description(group, &title);
    let category = category_for(field(AttributeField::FurnitureType), synonyms)
        .unwrap_or_else(|| DEFAULT_CATEGORY.to_string());

    Listing {
        listing_id: new_listing_id(),
        group_id: group.group_id.clone(),
        description,
        price: round_price(group.mean_suggested_price().unwrap_or(0.0)),
        condition: marketplace_condition(representative.and_then(|r| r.condition)).to_string(),
        category,
        images: group.image_refs(),
        confidence: group.aggregate_confidence,
        needs_review: group.aggregate_confidence <= 0.0,
        used_fallback: false,
        reasoning: group.reasoning.clone(),
        title,
    }
}

fn templated_description(group: &Group, title: &str) -> String {
    let mut description = format!("{title}.");
    if let Some(text) = group.description.as_deref() {
        let _ = write!(description, " {text}");
    }
    if let Some(record) = group.representative() {
        if let Some(material) = record.material.as_deref() {
            let _ = write!(description, " Material: {material}.");
        }
        if let Some(condition) = record.condition {
            let _ = write!(description, " Condition: {}.", condition.label());
        }
        if !record.features.is_empty() {
            let features = record
                .features
                .iter()
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(", ");
            let _ = write!(description, " Features: {features}.");
        }
    }
    let photos = group.members.len();
    let _ = write!(
        description,
        " {photos} photo{} included. Local pickup available.",
        if photos == 1 { "" } else { "s" }
    );
    description
}

fn listing_prompt(group: &Group) -> String {
    let mut prompt = String::from(
        "Write a marketplace listing for one piece of used furniture. Reply with JSON only: \
         {\"title\": \"...\", \"description\": \"...\", \"price\": 0, \
         \"condition\": \"New|Like New|Good|Fair|Poor\", \"category\": \"...\"}. \
         Keep the title under 80 characters.\n\n",
    );
    if let Some(record) = group.representative() {
        for field in AttributeField::ALL {
            let _ = writeln!(
                prompt,
                "{}: {}",
                field.name(),
                record.field(field).unwrap_or("unknown")
            );
        }
        let _ = writeln!(
            prompt,
            "condition: {}",
            record.condition.map(|c| c.label()).unwrap_or("unknown")
        );
        if !record.features.is_empty() {
            let features = record
                .features
                .iter()
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(", ");
            let _ = writeln!(prompt, "features: {features}");
        }
    }
    let _ = writeln!(prompt, "photos: {}", group.members.len());
    if let Some(description) = group.description.as_deref() {
        let _ = writeln!(prompt, "item: {description}");
    }
    if let Some(reasoning) = group.reasoning.as_deref() {
        let _ = writeln!(prompt, "grouping notes: {reasoning}");
    }
    if let Some(price) = group.mean_suggested_price() {
        let _ = writeln!(prompt, "suggested price: {price:.2}");
    }
    prompt
}

fn truncate_title(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.chars().count() <= MAX_TITLE_CHARS {
        return trimmed.to_string();
    }
    trimmed
        .chars()
        .take(MAX_TITLE_CHARS)
        .collect::<String>()
        .trim_end()
        .to_string()
}

fn round_price(price: f64) -> f64 {
    (price * 100.0).round() / 100.0
}

fn new_listing_id() -> String {
    format!("FUR-{}", Uuid::new_v4().simple())
}
