//! Flat-directory storage for uploaded scans.
//!
//! There is no index: an upload is found again by scanning the upload
//! directory for a file whose name starts with `<image_id>_`.

use std::{
    io,
    path::{Path, PathBuf},
};

use thiserror::Error;
use uuid::Uuid;

pub const IMAGE_ID_PREFIX: &str = "oct_";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to create directory {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to scan {}: {source}", path.display())]
    Scan {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub fn ensure_directories<P: AsRef<Path>>(directories: &[P]) -> Result<(), StorageError> {
    for directory in directories {
        let path = directory.as_ref();
        std::fs::create_dir_all(path).map_err(|source| StorageError::CreateDir {
            path: path.to_path_buf(),
            source,
        })?;
    }
    Ok(())
}

pub fn is_allowed_file<S: AsRef<str>>(filename: &str, allowed_extensions: &[S]) -> bool {
    let Some((_, extension)) = filename.rsplit_once('.') else {
        return false;
    };
    let extension = extension.to_lowercase();
    allowed_extensions
        .iter()
        .any(|allowed| allowed.as_ref() == extension)
}

/// True for IDs shaped like the ones [`generate_image_id`] hands out.
pub fn is_valid_image_id(image_id: &str) -> bool {
    image_id.strip_prefix(IMAGE_ID_PREFIX).is_some_and(|hex| {
        hex.len() == 8 && hex.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
    })
}

pub fn generate_image_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("{IMAGE_ID_PREFIX}{}", &hex[..8])
}

/// Reduces a client supplied filename to something safe to join onto a directory.
pub fn secure_filename(filename: &str) -> String {
    let basename = filename
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or_default();

    let joined = basename.split_whitespace().collect::<Vec<_>>().join("_");
    let cleaned: String = joined
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect();
    let cleaned = cleaned.trim_matches(|c: char| c == '.' || c == '_');

    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned.to_string()
    }
}

pub fn build_saved_filename(image_id: &str, original_filename: &str) -> String {
    format!("{image_id}_{}", secure_filename(original_filename))
}

pub async fn save_upload(
    upload_dir: &Path,
    image_id: &str,
    original_filename: &str,
    data: &[u8],
) -> Result<PathBuf, StorageError> {
    let path = upload_dir.join(build_saved_filename(image_id, original_filename));
    tokio::fs::write(&path, data)
        .await
        .map_err(|source| StorageError::Write {
            path: path.clone(),
            source,
        })?;
    Ok(path)
}

/// Returns the first entry of `upload_dir` named `<image_id>_*`.
///
/// A missing upload directory is treated as "not found" rather than an error.
pub async fn find_image_path_by_id(
    image_id: &str,
    upload_dir: &Path,
) -> Result<Option<PathBuf>, StorageError> {
    let scan_err = |source| StorageError::Scan {
        path: upload_dir.to_path_buf(),
        source,
    };

    let mut entries = match tokio::fs::read_dir(upload_dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(scan_err(err)),
    };

    let prefix = format!("{image_id}_");
    while let Some(entry) = entries.next_entry().await.map_err(scan_err)? {
        if entry.file_name().to_string_lossy().starts_with(&prefix) {
            return Ok(Some(entry.path()));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::config::ALLOWED_EXTENSIONS;

    #[test]
    fn allowed_extensions_ignore_case() {
        for name in ["scan.png", "scan.PNG", "a.b.JpEg", "x.jpg", "study.dcm", ".png"] {
            assert!(is_allowed_file(name, &ALLOWED_EXTENSIONS), "{name}");
        }
    }

    #[test]
    fn other_extensions_are_rejected() {
        for name in ["scan", "scan.gif", "scan.png.exe", "scan.", "png", "archive.tar.gz"] {
            assert!(!is_allowed_file(name, &ALLOWED_EXTENSIONS), "{name}");
        }
    }

    #[test]
    fn generated_ids_are_unique_and_prefixed() {
        let ids: Vec<String> = (0..5000).map(|_| generate_image_id()).collect();
        assert!(ids.iter().all(|id| is_valid_image_id(id)));
        let unique: HashSet<&String> = ids.iter().collect();
        assert_eq!(unique.len(), ids.len());
    }

    #[test]
    fn image_id_shape_is_checked() {
        assert!(is_valid_image_id("oct_0a1b2c3d"));
        for id in [
            "oct",
            "oct_",
            "oct_0a1b2c3",
            "oct_0a1b2c3d4",
            "OCT_0a1b2c3d",
            "oct_0A1B2C3D",
            "oct_0a1b2c3g",
            "../oct_0a1b2c3d",
        ] {
            assert!(!is_valid_image_id(id), "{id}");
        }
    }

    #[test]
    fn secure_filename_strips_directories_and_unsafe_characters() {
        assert_eq!(secure_filename("../../etc/passwd"), "passwd");
        assert_eq!(secure_filename(r"C:\scans\left eye.png"), "left_eye.png");
        assert_eq!(secure_filename("my scan (1).jpg"), "my_scan_1.jpg");
        assert_eq!(secure_filename("..hidden.png"), "hidden.png");
        assert_eq!(secure_filename("視網膜.png"), "png");
        assert_eq!(secure_filename("///"), "upload");
    }

    #[test]
    fn saved_filename_is_prefixed_with_id() {
        assert_eq!(
            build_saved_filename("oct_0a1b2c3d", "uploads/scan 1.png"),
            "oct_0a1b2c3d_scan_1.png"
        );
    }

    #[test]
    fn ensure_directories_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let dirs = [root.path().join("uploads"), root.path().join("nested/reports")];
        ensure_directories(&dirs).unwrap();
        ensure_directories(&dirs).unwrap();
        assert!(dirs.iter().all(|d| d.is_dir()));
    }

    #[tokio::test]
    async fn saved_upload_is_found_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let id = generate_image_id();
        let saved = save_upload(dir.path(), &id, "scan.png", b"bytes").await.unwrap();
        save_upload(dir.path(), &generate_image_id(), "other.png", b"other")
            .await
            .unwrap();

        let found = find_image_path_by_id(&id, dir.path()).await.unwrap().unwrap();
        assert_eq!(found, saved);
        assert!(found
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with(&format!("{id}_")));
    }

    #[tokio::test]
    async fn unknown_id_or_missing_directory_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        save_upload(dir.path(), "oct_11111111", "scan.png", b"x").await.unwrap();

        assert!(find_image_path_by_id("oct_22222222", dir.path()).await.unwrap().is_none());
        // Prefix match requires the separator.
        assert!(find_image_path_by_id("oct_1111", dir.path()).await.unwrap().is_none());
        assert!(find_image_path_by_id("oct_11111111", &dir.path().join("missing"))
            .await
            .unwrap()
            .is_none());
    }
}
