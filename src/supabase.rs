use crate::config::SupabaseSettings;
use crate::furniture::listing::Listing;
use crate::http::build_client;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

const LISTINGS_TABLE: &str = "furniture_listings";

#[derive(Debug, Clone)]
pub struct SupabaseClient {
    base_url: String,
    service_key: String,
    http: Client,
}

#[derive(Debug, Error)]
pub enum SupabaseError {
    #[error("request failed: {0}")]
    Request(String),
}

#[derive(Debug, Serialize)]
struct ListingRow<'a> {
    batch_id: &'a str,
    listing_id: &'a str,
    group_id: &'a str,
    title: &'a str,
    price: f64,
    condition: &'a str,
    description: &'a str,
    category: &'a str,
    images: &'a [String],
    confidence: f64,
    needs_review: bool,
}

impl SupabaseClient {
    pub fn new(settings: &SupabaseSettings, timeout: Duration, connect_timeout: Duration) -> Self {
        Self {
            base_url: settings.url.trim_end_matches('/').to_string(),
            service_key: settings.service_key.clone(),
            http: build_client(timeout, connect_timeout),
        }
    }

    /// Insert one row per listing. Returns the number of rows sent.
    pub async fn insert_listings(
        &self,
        batch_id: &str,
        listings: &[Listing],
    ) -> Result<usize, SupabaseError> {
        if listings.is_empty() {
            return Ok(0);
        }
        let rows: Vec<ListingRow<'_>> = listings
            .iter()
            .map(|listing| ListingRow {
                batch_id,
                listing_id: &listing.listing_id,
                group_id: &listing.group_id,
                title: &listing.title,
                price: listing.price,
                condition: &listing.condition,
                description: &listing.description,
                category: &listing.category,
                images: &listing.images,
                confidence: listing.confidence,
                needs_review: listing.needs_review,
            })
            .collect();

        let url = format!("{}/rest/v1/{LISTINGS_TABLE}", self.base_url);
        let response = self
            .http
            .post(url)
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
            .header("Prefer", "return=minimal")
            .json(&rows)
            .send()
            .await
            .map_err(|err| SupabaseError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(SupabaseError::Request(format!(
                "HTTP {}",
                response.status()
            )));
        }
        Ok(rows.len())
    }
}
