use crate::Config;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum StartupCheckError {
    #[error("Gallery source directory does not exist: {0}")]
    SourceDirectoryMissing(String),

    #[error("Gallery source directory is not readable: {0}")]
    SourceDirectoryUnreadable(#[from] std::io::Error),

    #[error("Manifest file missing: {0}")]
    ManifestMissing(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl StartupCheckError {
    /// Critical failures stop the server from starting.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            StartupCheckError::SourceDirectoryMissing(_)
                | StartupCheckError::SourceDirectoryUnreadable(_)
                | StartupCheckError::ManifestMissing(_)
        )
    }
}

pub async fn perform_startup_checks(config: &Config) -> Result<(), Vec<StartupCheckError>> {
    let mut errors = Vec::new();
    let gallery = &config.gallery;

    info!("Performing startup checks...");

    let source_dir = &gallery.source_directory;
    if !source_dir.exists() {
        // A manifest of remote URLs does not need local photos
        if gallery.manifest.is_some() {
            warn!(
                "Gallery source directory does not exist: {:?}; only remote images will load",
                source_dir
            );
        } else {
            error!("Gallery source directory does not exist: {:?}", source_dir);
            errors.push(StartupCheckError::SourceDirectoryMissing(
                source_dir.display().to_string(),
            ));
        }
    } else {
        match tokio::fs::read_dir(source_dir).await {
            Ok(_) => info!("Gallery source directory is accessible: {:?}", source_dir),
            Err(e) => {
                error!("Gallery source directory is not accessible: {}", e);
                errors.push(StartupCheckError::SourceDirectoryUnreadable(e));
            }
        }
    }

    if let Some(manifest) = &gallery.manifest {
        if manifest.is_file() {
            info!("Manifest found: {:?}", manifest);
        } else {
            error!("Manifest file missing: {:?}", manifest);
            errors.push(StartupCheckError::ManifestMissing(
                manifest.display().to_string(),
            ));
        }
    }

    let (min, max) = (
        gallery.packer.min_aspect_ratio,
        gallery.packer.max_aspect_ratio,
    );
    if !(min.is_finite() && max.is_finite() && min > 0.0 && min <= max) {
        warn!(
            "Aspect ratio bounds [{}, {}] are not usable, the defaults will be used",
            min, max
        );
        errors.push(StartupCheckError::InvalidConfig(format!(
            "aspect ratio bounds [{}, {}]",
            min, max
        )));
    }

    if gallery.chunk_size == 0 {
        warn!("Chunk size of 0 will be treated as 1");
        errors.push(StartupCheckError::InvalidConfig(
            "chunk_size must be at least 1".to_string(),
        ));
    }

    if errors.is_empty() {
        info!("All startup checks passed");
        Ok(())
    } else {
        error!("Startup checks failed with {} errors", errors.len());
        Err(errors)
    }
}
