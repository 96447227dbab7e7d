use axum::{
    body::Body,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::{debug, error};

/// Serves original photo files out of the gallery source directory.
#[derive(Clone)]
pub struct StaticFileHandler {
    pub root: PathBuf,
}

impl StaticFileHandler {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Maps a request path onto the root. Anything that would step outside it, or
    /// that names a hidden file, is refused.
    pub fn resolve(&self, path: &str) -> Option<PathBuf> {
        let relative = Path::new(path.trim_start_matches('/'));
        let safe = relative.components().all(|c| match c {
            Component::Normal(part) => !part.to_string_lossy().starts_with('.'),
            _ => false,
        });

        if !safe || relative.as_os_str().is_empty() {
            return None;
        }
        Some(self.root.join(relative))
    }

    pub async fn serve(&self, path: &str) -> Response {
        let Some(file_path) = self.resolve(path) else {
            error!("Path traversal attempt: {:?}", path);
            return (StatusCode::FORBIDDEN, "Forbidden").into_response();
        };

        debug!("Attempting to serve photo: {:?}", file_path);

        let metadata = match tokio::fs::metadata(&file_path).await {
            Ok(m) if m.is_file() => m,
            Ok(_) => return (StatusCode::NOT_FOUND, "File not found").into_response(),
            Err(e) => {
                debug!("Failed to get metadata for {:?}: {}", file_path, e);
                return (StatusCode::NOT_FOUND, "File not found").into_response();
            }
        };

        let file = match File::open(&file_path).await {
            Ok(file) => file,
            Err(e) => {
                debug!("Failed to open file {:?}: {}", file_path, e);
                return (StatusCode::NOT_FOUND, "File not found").into_response();
            }
        };

        let content_type = mime_guess::from_path(&file_path)
            .first_or_octet_stream()
            .to_string();

        // Photos are immutable once published; everything else gets a short cache
        let cache_control = if content_type.starts_with("image/") {
            "public, max-age=31536000"
        } else {
            "public, max-age=3600"
        };

        let mut response = Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, content_type)
            .header(header::CACHE_CONTROL, cache_control)
            .header(header::CONTENT_LENGTH, metadata.len());

        if let Ok(modified) = metadata.modified()
            && let Ok(duration) = modified.duration_since(UNIX_EPOCH)
        {
            response = response.header(header::LAST_MODIFIED, httpdate::fmt_http_date(modified));

            let etag = format!("\"{}-{}\"", duration.as_secs(), metadata.len());
            response = response.header(header::ETAG, etag);
        }

        let body = Body::from_stream(ReaderStream::new(file));
        response.body(body).unwrap_or_else(|e| {
            error!("Failed to build photo response: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_rejects_traversal() {
        let handler = StaticFileHandler::new(PathBuf::from("/srv/photos"));

        assert_eq!(
            handler.resolve("2024/lake.jpg"),
            Some(PathBuf::from("/srv/photos/2024/lake.jpg"))
        );
        assert_eq!(handler.resolve("../etc/passwd"), None);
        assert_eq!(handler.resolve("2024/../../etc/passwd"), None);
        assert_eq!(handler.resolve(".hidden/a.jpg"), None);
        assert_eq!(handler.resolve(""), None);
    }
}
