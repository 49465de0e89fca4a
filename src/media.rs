use anyhow::{anyhow, Context};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

pub const MEDIA_DIR: &str = "media";

// Product limits, enforced before the copy. The filesystem would accept
// larger files; the course UI would not.
pub const MAX_IMAGE_BYTES: u64 = 3 * 1024 * 1024;
pub const MAX_VIDEO_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "image" => Some(Self::Image),
            "video" => Some(Self::Video),
            _ => None,
        }
    }

    pub fn max_bytes(self) -> u64 {
        match self {
            Self::Image => MAX_IMAGE_BYTES,
            Self::Video => MAX_VIDEO_BYTES,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoredMedia {
    /// Workspace-relative path, e.g. "media/3fa0c1d2e4b5a6f7-cell.png".
    pub rel_path: String,
    pub size_bytes: u64,
}

/// Copies a local file into the workspace media store under a
/// content-addressed name. Re-storing identical content lands on the same
/// name, so duplicate uploads collapse into one file.
pub fn store_media(
    workspace: &Path,
    source: &Path,
    kind: MediaKind,
) -> anyhow::Result<StoredMedia> {
    let meta = std::fs::metadata(source)
        .with_context(|| format!("failed to stat source file {}", source.to_string_lossy()))?;
    if !meta.is_file() {
        return Err(anyhow!("source is not a file: {}", source.to_string_lossy()));
    }
    let size = meta.len();
    if size > kind.max_bytes() {
        return Err(anyhow!(
            "file exceeds the {} byte limit: {} bytes",
            kind.max_bytes(),
            size
        ));
    }

    let bytes = std::fs::read(source)
        .with_context(|| format!("failed to read source file {}", source.to_string_lossy()))?;
    let digest = Sha256::digest(&bytes);
    let short_hash: String = digest
        .iter()
        .take(8)
        .map(|b| format!("{:02x}", b))
        .collect();

    let file_name = source
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("upload");
    let stored_name = format!("{}-{}", short_hash, file_name);

    let media_dir = workspace.join(MEDIA_DIR);
    std::fs::create_dir_all(&media_dir).with_context(|| {
        format!(
            "failed to create media directory {}",
            media_dir.to_string_lossy()
        )
    })?;
    let dst = media_dir.join(&stored_name);
    if !dst.exists() {
        std::fs::write(&dst, &bytes)
            .with_context(|| format!("failed to write {}", dst.to_string_lossy()))?;
    }

    Ok(StoredMedia {
        rel_path: format!("{}/{}", MEDIA_DIR, stored_name),
        size_bytes: size,
    })
}

/// Resolves a stored workspace-relative path to the URL handed to the UI
/// shell. Rejects anything outside the media store.
pub fn public_url(workspace: &Path, rel_path: &str) -> anyhow::Result<String> {
    let rel = PathBuf::from(rel_path);
    let mut parts = rel.components();
    let first_ok = matches!(
        parts.next(),
        Some(std::path::Component::Normal(p)) if p == MEDIA_DIR
    );
    let rest_ok = parts.all(|c| matches!(c, std::path::Component::Normal(_)));
    if !first_ok || !rest_ok {
        return Err(anyhow!("path is not inside the media store: {}", rel_path));
    }
    let abs = workspace.join(rel);
    Ok(format!("file://{}", abs.to_string_lossy()))
}
