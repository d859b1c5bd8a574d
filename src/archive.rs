//! Archive extraction for downloaded binary bundles (§4.1). Both formats are
//! extracted synchronously inside `spawn_blocking` since `zip`/`tar` are blocking
//! APIs and archives can be hundreds of megabytes.

use crate::error::{CoreError, Result};
use std::path::{Path, PathBuf};

pub async fn extract(archive: &Path, dest: &Path) -> Result<()> {
    let name = archive
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_lowercase();
    let archive = archive.to_path_buf();
    let dest = dest.to_path_buf();

    if name.ends_with(".zip") {
        tokio::task::spawn_blocking(move || extract_zip(&archive, &dest))
            .await
            .map_err(|e| CoreError::unknown(e.to_string()))??;
    } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        tokio::task::spawn_blocking(move || extract_targz(&archive, &dest))
            .await
            .map_err(|e| CoreError::unknown(e.to_string()))??;
    } else {
        return Err(CoreError::BinaryError {
            message: format!("unrecognized archive format: {}", archive.display()),
            details: None,
        });
    }
    Ok(())
}

fn extract_zip(archive: &Path, dest: &Path) -> Result<()> {
    let file = std::fs::File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file)
        .map_err(|e| CoreError::BinaryError {
            message: format!("bad zip archive: {e}"),
            details: None,
        })?;
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i).map_err(|e| CoreError::BinaryError {
            message: format!("zip entry error: {e}"),
            details: None,
        })?;
        let out_path = dest.join(entry.name());
        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
        } else {
            if let Some(parent) = out_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut f = std::fs::File::create(&out_path)?;
            std::io::copy(&mut entry, &mut f)?;
        }
    }
    Ok(())
}

fn extract_targz(archive: &Path, dest: &Path) -> Result<()> {
    let file = std::fs::File::open(archive)?;
    let gz = flate2::read::GzDecoder::new(file);
    let mut tar = tar::Archive::new(gz);
    tar.unpack(dest)?;
    Ok(())
}

/// Recursively searches `dir` for a file named exactly `name`. Archives sometimes
/// nest the binary inside a version-named subdirectory.
pub fn find_binary(dir: &Path, name: &str) -> Option<PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;
    for entry in entries.flatten() {
        let p = entry.path();
        if p.is_file() && p.file_name().and_then(|n| n.to_str()) == Some(name) {
            return Some(p);
        }
        if p.is_dir() {
            if let Some(found) = find_binary(&p, name) {
                return Some(found);
            }
        }
    }
    None
}

/// Sets the executable bit on every regular file directly under `dir`. No-op on
/// non-Unix platforms — Windows has no equivalent permission bit.
pub fn mark_executable_dir(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(entries) = std::fs::read_dir(dir) {
            for entry in entries.flatten() {
                let p = entry.path();
                if p.is_file() {
                    if let Ok(meta) = std::fs::metadata(&p) {
                        let mut perms = meta.permissions();
                        perms.set_mode(perms.mode() | 0o755);
                        let _ = std::fs::set_permissions(&p, perms);
                    }
                }
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
    Ok(())
}
