use crate::furniture::listing::Listing;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    fmt::Write as _,
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

const CSV_NAME: &str = "marketplace_listings.csv";
const README_NAME: &str = "README.txt";
const CSV_HEADER: [&str; 6] = ["title", "price", "condition", "description", "category", "images"];
const MAX_FOLDER_TITLE: usize = 50;
const MAX_PHOTO_PREFIX: usize = 20;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("nothing to export")]
    Empty,
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("export task failed: {0}")]
    Join(String),
}

/// Where an export landed and what could not be packaged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveHandle {
    pub export_id: String,
    pub path: PathBuf,
    pub csv_path: PathBuf,
    pub listings: usize,
    pub photos_copied: usize,
    /// Image refs that were remote or unreadable and so were not copied.
    pub missing_photos: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ExportPackager {
    root: PathBuf,
}

impl ExportPackager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub async fn export(&self, listings: &[Listing]) -> Result<ArchiveHandle, ExportError> {
        if listings.is_empty() {
            return Err(ExportError::Empty);
        }
        let root = self.root.clone();
        let listings = listings.to_vec();
        let handle = tokio::task::spawn_blocking(move || write_export(&root, &listings))
            .await
            .map_err(|err| ExportError::Join(err.to_string()))??;
        info!(
            target = "furnish.export",
            export_id = %handle.export_id,
            listings = handle.listings,
            photos = handle.photos_copied,
            missing = handle.missing_photos.len(),
            "export_written"
        );
        Ok(handle)
    }
}

fn write_export(root: &Path, listings: &[Listing]) -> Result<ArchiveHandle, ExportError> {
    let created_at = Utc::now();
    let export_id = Uuid::new_v4().simple().to_string();
    let dir = root.join(format!(
        "export_{}_{}",
        created_at.format("%Y%m%d_%H%M%S"),
        &export_id[..8]
    ));
    create_dir(&dir)?;

    let csv_path = dir.join(CSV_NAME);
    let mut writer = csv::Writer::from_path(&csv_path)?;
    writer.write_record(CSV_HEADER)?;
    for listing in listings {
        let price = format!("{:.2}", listing.price);
        let images = listing.images.join("|");
        writer.write_record([
            listing.title.as_str(),
            price.as_str(),
            listing.condition.as_str(),
            listing.description.as_str(),
            listing.category.as_str(),
            images.as_str(),
        ])?;
    }
    writer.flush().map_err(|source| io_error(&csv_path, source))?;

    let mut readme = String::from("Furniture listing export\n========================\n\n");
    let _ = writeln!(readme, "Created: {}", created_at.to_rfc3339());
    let _ = writeln!(readme, "Listings: {}\n", listings.len());
    let _ = writeln!(readme, "{CSV_NAME} holds one row per listing for bulk upload.\n");

    let mut photos_copied = 0;
    let mut missing_photos = Vec::new();
    for (position, listing) in listings.iter().enumerate() {
        let folder_name = format!(
            "Listing_{:02}_{}",
            position + 1,
            clean_title(&listing.title, MAX_FOLDER_TITLE)
        );
        let folder = dir.join(&folder_name);
        create_dir(&folder)?;

        let prefix = clean_title(&listing.title, MAX_PHOTO_PREFIX);
        for (photo, image_ref) in listing.images.iter().enumerate() {
            let source = Path::new(image_ref);
            if is_remote(image_ref) || !source.is_file() {
                missing_photos.push(image_ref.clone());
                continue;
            }
            let ext = source
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| format!(".{}", e.to_ascii_lowercase()))
                .unwrap_or_else(|| ".jpg".to_string());
            let target = folder.join(format!("{prefix}_photo_{:02}{ext}", photo + 1));
            match fs::copy(source, &target) {
                Ok(_) => photos_copied += 1,
                Err(err) => {
                    warn!(
                        target = "furnish.export",
                        image = %image_ref,
                        error = %err,
                        "photo_copy_failed"
                    );
                    missing_photos.push(image_ref.clone());
                }
            }
        }

        let _ = writeln!(
            readme,
            "{folder_name}: {} | ${:.2} | {} | {} photo(s){}",
            listing.title,
            listing.price,
            listing.condition,
            listing.images.len(),
            if listing.needs_review {
                " | NEEDS REVIEW"
            } else {
                ""
            }
        );
    }

    let readme_path = dir.join(README_NAME);
    fs::write(&readme_path, readme).map_err(|source| io_error(&readme_path, source))?;

    Ok(ArchiveHandle {
        export_id,
        path: dir,
        csv_path,
        listings: listings.len(),
        photos_copied,
        missing_photos,
        created_at,
    })
}

/// Filesystem-safe title: alphanumerics, `-` and `_`, spaces as `_`.
fn clean_title(title: &str, max_chars: usize) -> String {
    let kept: String = title
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_'))
        .collect();
    let cleaned: String = kept
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .chars()
        .take(max_chars)
        .collect();
    let cleaned = cleaned.trim_matches('_').to_string();
    if cleaned.is_empty() {
        "Listing".to_string()
    } else {
        cleaned
    }
}

fn is_remote(image_ref: &str) -> bool {
    let lowered = image_ref.to_ascii_lowercase();
    lowered.starts_with("http://") || lowered.starts_with("https://")
}

fn create_dir(path: &Path) -> Result<(), ExportError> {
    fs::create_dir_all(path).map_err(|source| io_error(path, source))
}

fn io_error(path: &Path, source: std::io::Error) -> ExportError {
    ExportError::Io {
        path: path.display().to_string(),
        source,
    }
}
