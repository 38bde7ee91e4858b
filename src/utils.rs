use std::{env, path::Path};

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("failed to download {url}: {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },
    #[error("GITHUB_TOKEN is not a valid header value")]
    InvalidToken,
    #[error("failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

async fn download_file(url: &str, path: &Path) -> Result<(), DownloadError> {
    tracing::info!(%url, path = %path.display(), "downloading model file");

    let mut header_map = HeaderMap::new();
    if let Ok(token) = env::var("GITHUB_TOKEN") {
        let auth_value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|_| DownloadError::InvalidToken)?;
        header_map.insert(AUTHORIZATION, auth_value);
    }
    header_map.insert(ACCEPT, HeaderValue::from_static("application/octet-stream"));

    let request_err = |source| DownloadError::Request {
        url: url.to_string(),
        source,
    };

    let client = reqwest::Client::new();
    let response = client
        .get(url)
        .headers(header_map)
        .send()
        .await
        .map_err(request_err)?;

    if !response.status().is_success() {
        return Err(DownloadError::Status {
            url: url.to_string(),
            status: response.status(),
        });
    }

    let bytes = response.bytes().await.map_err(request_err)?;
    let write_err = |source| DownloadError::Write {
        path: path.display().to_string(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
    }
    tokio::fs::write(path, &bytes).await.map_err(write_err)?;

    tracing::info!(path = %path.display(), bytes = bytes.len(), "model file downloaded");
    Ok(())
}

/// Fetches the model file from `url` when it is not already on disk.
///
/// Without a URL a missing file is only logged; loading the model reports the real error.
pub async fn ensure_model_exists(model_path: &Path, url: Option<&str>) -> Result<(), DownloadError> {
    tracing::info!(path = %model_path.display(), "checking model");
    if model_path.exists() {
        return Ok(());
    }

    match url {
        Some(url) => download_file(url, model_path).await,
        None => {
            tracing::warn!(
                path = %model_path.display(),
                "model file not found and MODEL_URL is not set"
            );
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn existing_model_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frozen_graph.pb");
        std::fs::write(&path, b"graph").unwrap();

        ensure_model_exists(&path, Some("http://127.0.0.1:9/unreachable"))
            .await
            .unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"graph");
    }

    #[tokio::test]
    async fn missing_model_without_url_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.pb");

        ensure_model_exists(&path, None).await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn unreachable_url_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model/frozen_graph.pb");

        let err = ensure_model_exists(&path, Some("http://127.0.0.1:9/model.pb"))
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Request { .. }));
        assert!(!path.exists());
    }
}
