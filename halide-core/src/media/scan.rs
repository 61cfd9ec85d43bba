//! Filesystem discovery helpers for the scan job.

use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use sha2::{Digest, Sha256};
use tracing::warn;
use walkdir::WalkDir;

use halide_model::{FileType, ImageId};

use crate::error::Result;

/// Media files the scanner picks up, matched case-insensitively.
static MEDIA_EXTENSIONS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "jpg", "jpeg", "png", "gif", "heic", "heif", "raw", "cr2", "nef", "arw", "dng", "mp4",
        "mov", "avi", "mkv",
    ]
    .into_iter()
    .collect()
});

static VIDEO_EXTENSIONS: Lazy<HashSet<&'static str>> =
    Lazy::new(|| ["mp4", "mov", "avi", "mkv"].into_iter().collect());

fn extension_lower(path: &Path) -> Option<String> {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
}

pub fn is_media_file(path: &Path) -> bool {
    extension_lower(path)
        .map(|ext| MEDIA_EXTENSIONS.contains(ext.as_str()))
        .unwrap_or(false)
}

pub fn classify(path: &Path) -> FileType {
    match extension_lower(path) {
        Some(ext) if VIDEO_EXTENSIONS.contains(ext.as_str()) => FileType::Video,
        _ => FileType::Image,
    }
}

/// Recursively collect whitelisted media files under a root. Unreadable
/// entries are logged and skipped rather than failing the walk.
pub fn walk_media_files(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        match entry {
            Ok(entry) if entry.file_type().is_file() && is_media_file(entry.path()) => {
                files.push(entry.into_path());
            }
            Ok(_) => {}
            Err(e) => warn!("skipping unreadable entry under {}: {e}", root.display()),
        }
    }
    files.sort();
    files
}

/// SHA-256 of the file contents, lowercase hex, read in 8 KiB chunks.
pub fn file_checksum(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Stable image id derived from the source path, so re-scanning the same
/// tree upserts the same rows.
pub fn image_id_for_path(source_path: &str) -> ImageId {
    let digest = Sha256::digest(source_path.as_bytes());
    let hex = format!("{digest:x}");
    ImageId::from(&hex[..32])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn whitelist_is_case_insensitive() {
        assert!(is_media_file(Path::new("a/b/photo.JPG")));
        assert!(is_media_file(Path::new("clip.MOV")));
        assert!(is_media_file(Path::new("shot.cr2")));
        assert!(!is_media_file(Path::new("notes.txt")));
        assert!(!is_media_file(Path::new("no_extension")));
    }

    #[test]
    fn classify_splits_videos_from_images() {
        assert_eq!(classify(Path::new("a.mp4")), FileType::Video);
        assert_eq!(classify(Path::new("a.MKV")), FileType::Video);
        assert_eq!(classify(Path::new("a.jpg")), FileType::Image);
        assert_eq!(classify(Path::new("a.dng")), FileType::Image);
    }

    #[test]
    fn walk_finds_nested_media_and_ignores_the_rest() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("sub/deep")).unwrap();
        fs::write(dir.path().join("a.jpg"), b"x").unwrap();
        fs::write(dir.path().join("sub/b.png"), b"x").unwrap();
        fs::write(dir.path().join("sub/deep/c.mov"), b"x").unwrap();
        fs::write(dir.path().join("sub/readme.md"), b"x").unwrap();

        let files = walk_media_files(dir.path());
        assert_eq!(files.len(), 3);
        assert!(files.iter().all(|p| is_media_file(p)));
    }

    #[test]
    fn checksum_is_stable_and_content_addressed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f.bin");
        fs::write(&path, b"hello").unwrap();
        let first = file_checksum(&path).unwrap();
        let second = file_checksum(&path).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
        // Known SHA-256 of "hello".
        assert_eq!(
            first,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn image_id_is_deterministic_per_path() {
        let a = image_id_for_path("/photos/a.jpg");
        assert_eq!(a, image_id_for_path("/photos/a.jpg"));
        assert_ne!(a, image_id_for_path("/photos/b.jpg"));
        assert_eq!(a.as_str().len(), 32);
    }
}
