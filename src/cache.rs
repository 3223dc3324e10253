//! On-disk layout and cache file I/O.
//!
//! Originals live at `<root>/images/<id[1..2]>/<id[3..5]>/<id>` and
//! derivatives at `<root>/caches/<fp[31..32]>/<fp[29..31]>/<id>-<fp>`,
//! fanning out through two nested directory levels to keep any one
//! directory small. The exact slice offsets are part of the on-disk
//! contract.

use crate::transform::params::ImageParams;
use std::io;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};

const DIR_MODE: u32 = 0o755;
const FILE_MODE: u32 = 0o604;

/// Absolute path of an original. Ids are ASCII and at least 9 characters,
/// so the byte slices are in bounds.
pub fn original_path(data_dir: &Path, image_id: &str) -> PathBuf {
    data_dir
        .join("images")
        .join(&image_id[1..2])
        .join(&image_id[3..5])
        .join(image_id)
}

/// Absolute path of a derivative, a function of the fingerprint alone.
pub fn derivative_path(data_dir: &Path, params: &ImageParams) -> PathBuf {
    let fingerprint = params.fingerprint();
    data_dir
        .join("caches")
        .join(&fingerprint[31..32])
        .join(&fingerprint[29..31])
        .join(format!("{}-{}", params.image_id, fingerprint))
}

/// Reads a file, mapping a missing file to `None` so callers can treat it
/// as a cache miss.
pub async fn read_file(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

/// Writes `bytes` to `path` atomically: parents are created 0755, the
/// bytes land in a temp file in the same directory (mode 0604) and are
/// renamed into place. Readers never observe a partial file.
///
/// Blocking; call from a worker thread.
pub fn store(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(DIR_MODE)
        .create(parent)?;

    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("cache");
    let temp_path = parent.join(format!(".{file_name}.tmp-{:08x}", rand::random::<u32>()));

    let write_and_rename = (|| {
        std::fs::write(&temp_path, bytes)?;
        std::fs::set_permissions(&temp_path, std::fs::Permissions::from_mode(FILE_MODE))?;
        std::fs::rename(&temp_path, path)
    })();
    if write_and_rename.is_err() {
        let _ = std::fs::remove_file(&temp_path);
    }
    write_and_rename
}

/// Content type detected from the leading file bytes; used for original
/// passthrough responses.
pub fn content_type_of(bytes: &[u8]) -> &'static str {
    match image::guess_format(bytes) {
        Ok(image::ImageFormat::Jpeg) => "image/jpeg",
        Ok(image::ImageFormat::Png) => "image/png",
        Ok(image::ImageFormat::WebP) => "image/webp",
        Ok(image::ImageFormat::Gif) => "image/gif",
        _ => "application/octet-stream",
    }
}

/// Uploads are restricted to the formats the transform pipeline handles.
pub fn is_accepted_upload(bytes: &[u8]) -> bool {
    matches!(
        image::guess_format(bytes),
        Ok(image::ImageFormat::Jpeg
            | image::ImageFormat::Png
            | image::ImageFormat::WebP
            | image::ImageFormat::Gif)
    )
}
