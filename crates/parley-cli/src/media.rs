//! Image attachments in, generated images out

use anyhow::{Context, bail};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use parley_ai::Part;
use std::fs;
use std::path::{Path, PathBuf};

/// Mime type for a supported image file extension
fn mime_for(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    Some(match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        _ => return None,
    })
}

/// File extension for an image mime type
fn extension_for(mime_type: &str) -> &'static str {
    match mime_type {
        "image/jpeg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        _ => "png",
    }
}

/// Read an image file into an inline-data part
pub fn load_attachment(path: &Path) -> anyhow::Result<Part> {
    let Some(mime_type) = mime_for(path) else {
        bail!(
            "Unsupported attachment '{}' (expected png, jpg, gif or webp)",
            path.display()
        );
    };
    let bytes = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(Part::inline(STANDARD.encode(bytes), mime_type))
}

/// Decode every inline-data part and write it to `<dir>/<uuid>.<ext>`.
///
/// Returns the written paths in part order.
pub fn save_images(dir: &Path, parts: &[Part]) -> anyhow::Result<Vec<PathBuf>> {
    let mut written = Vec::new();
    for inline in parts.iter().filter_map(|p| p.inline_data.as_ref()) {
        let bytes = STANDARD
            .decode(inline.data.as_bytes())
            .context("Image data is not valid base64")?;
        fs::create_dir_all(dir)?;
        let path = dir.join(format!(
            "{}.{}",
            uuid::Uuid::new_v4(),
            extension_for(&inline.mime_type)
        ));
        fs::write(&path, bytes).with_context(|| format!("Failed to write {}", path.display()))?;
        written.push(path);
    }
    Ok(written)
}
