//! Shared-directory scanning.

use std::fs::File;
use std::io;
use std::path::Path;

use soulmesh_discovery::IndexedFile;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Content id of a file: BLAKE3 of its bytes, hex encoded.
pub fn content_id(path: &Path) -> io::Result<String> {
    let mut hasher = blake3::Hasher::new();
    let mut file = File::open(path)?;
    io::copy(&mut file, &mut hasher)?;
    Ok(hasher.finalize().to_hex().to_string())
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.'))
}

/// Index every regular, non-hidden file under `root`.
///
/// Unreadable entries are skipped with a warning; only a missing or
/// unreadable `root` is an error.
pub fn scan_dir(root: &Path) -> Result<Vec<IndexedFile>> {
    let mut files = Vec::new();
    if !std::fs::metadata(root)?.is_dir() {
        return Err(Error::InvalidInput(format!("{} is not a directory", root.display())));
    }
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %dir.display(), "Skipping unreadable directory: {}", e);
                continue;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if is_hidden(&path) {
                continue;
            }
            let Ok(file_type) = entry.file_type() else { continue };
            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() {
                let size = match entry.metadata() {
                    Ok(m) => m.len(),
                    Err(_) => continue,
                };
                match content_id(&path) {
                    Ok(id) => files.push(IndexedFile::new(id, path.to_string_lossy().into_owned(), size)),
                    Err(e) => warn!(path = %path.display(), "Skipping unreadable file: {}", e),
                }
            }
        }
    }

    files.sort_by(|a, b| a.path.cmp(&b.path));
    debug!(root = %root.display(), files = files.len(), "Shared directory scanned");
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scans_recursively_and_skips_hidden() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("artist/album")).unwrap();
        std::fs::create_dir_all(dir.path().join(".cache")).unwrap();
        std::fs::write(dir.path().join("artist/album/01 intro.flac"), b"flac bytes").unwrap();
        std::fs::write(dir.path().join("loose.mp3"), b"mp3").unwrap();
        std::fs::write(dir.path().join(".DS_Store"), b"junk").unwrap();
        std::fs::write(dir.path().join(".cache/blob"), b"junk").unwrap();

        let files = scan_dir(dir.path()).unwrap();
        assert_eq!(files.len(), 2);
        let flac = files.iter().find(|f| f.filename == "01 intro.flac").unwrap();
        assert_eq!(flac.size, 10);
        assert_eq!(flac.item_id, blake3::hash(b"flac bytes").to_hex().to_string());
    }

    #[test]
    fn identical_content_shares_an_id() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.flac"), b"same").unwrap();
        std::fs::write(dir.path().join("b.flac"), b"same").unwrap();
        let files = scan_dir(dir.path()).unwrap();
        assert_eq!(files[0].item_id, files[1].item_id);
    }

    #[test]
    fn missing_root_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(scan_dir(&dir.path().join("nope")).is_err());
    }
}
