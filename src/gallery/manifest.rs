use super::{GalleryError, ImageRecord};
use std::path::Path;
use tracing::{debug, info};
use walkdir::WalkDir;

/// Reads a JSON array of image records.
pub async fn load_manifest(path: &Path) -> Result<Vec<ImageRecord>, GalleryError> {
    let json = tokio::fs::read_to_string(path).await?;
    let images: Vec<ImageRecord> = serde_json::from_str(&json)?;

    info!("Loaded {} images from manifest {:?}", images.len(), path);
    Ok(images)
}

/// Builds records for every image under `source_directory`, addressed as
/// `{url_prefix}/{relative path}`. Titles come from file stems and the first
/// directory level becomes the category.
pub async fn scan_source_directory(
    source_directory: &Path,
    url_prefix: &str,
) -> Result<Vec<ImageRecord>, GalleryError> {
    if !source_directory.is_dir() {
        return Err(GalleryError::NotFound);
    }

    let root = source_directory.to_path_buf();
    let prefix = format!("/{}", url_prefix.trim_matches('/'));

    let images = tokio::task::spawn_blocking(move || {
        let mut images = Vec::new();

        for entry in WalkDir::new(&root)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                e.depth() == 0 || !is_hidden(e.file_name().to_str().unwrap_or("."))
            })
            .flatten()
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str() else {
                continue;
            };
            if !is_image(name) {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&root) else {
                continue;
            };

            let segments: Vec<String> = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().to_string())
                .collect();
            let encoded = segments
                .iter()
                .map(|s| urlencoding::encode(s).into_owned())
                .collect::<Vec<_>>()
                .join("/");

            let title = Path::new(name)
                .file_stem()
                .map(|stem| stem.to_string_lossy().replace(['_', '-'], " "))
                .unwrap_or_default();

            let mut record = ImageRecord::new(format!("{}/{}", prefix, encoded), title.clone())
                .with_title(title);
            if segments.len() > 1 {
                record = record.with_category(segments[0].clone());
            }
            images.push(record);
        }

        images
    })
    .await
    .map_err(|e| GalleryError::IoError(std::io::Error::other(e)))?;

    debug!(
        "Scanned {} images under {:?}",
        images.len(),
        source_directory
    );
    Ok(images)
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

pub(crate) fn is_image(file_name: &str) -> bool {
    let lower = file_name.to_lowercase();
    lower.ends_with(".jpg")
        || lower.ends_with(".jpeg")
        || lower.ends_with(".png")
        || lower.ends_with(".gif")
        || lower.ends_with(".webp")
        || lower.ends_with(".bmp")
}
