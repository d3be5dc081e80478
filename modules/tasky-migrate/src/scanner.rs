//! Discover patch files.
//!
//! Execution order is the byte-wise order of filenames and nothing else, so
//! operators name patches with zero-padded prefixes (`0001_init.sql`).

use std::path::Path;

use tracing::warn;

use crate::error::{MigrateError, MigrateResult};
use crate::types::PatchFile;

/// List eligible patches in `dir`, sorted by filename.
///
/// Eligible means: a regular file, not dot-prefixed, ending in `.sql`.
/// Reads the directory fresh on every call.
pub async fn scan_patches(dir: &Path) -> MigrateResult<Vec<PatchFile>> {
    let fail = |source| MigrateError::Scan {
        path: dir.to_path_buf(),
        source,
    };

    let mut entries = tokio::fs::read_dir(dir).await.map_err(fail)?;
    let mut patches = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(fail)? {
        if !entry.file_type().await.map_err(fail)?.is_file() {
            continue;
        }
        let Ok(filename) = entry.file_name().into_string() else {
            warn!(path = %entry.path().display(), "Skipping patch with non UTF-8 filename");
            continue;
        };
        if !is_patch_name(&filename) {
            continue;
        }
        patches.push(PatchFile {
            path: entry.path(),
            filename,
        });
    }

    patches.sort_by(|a, b| a.filename.as_bytes().cmp(b.filename.as_bytes()));
    Ok(patches)
}

fn is_patch_name(name: &str) -> bool {
    !name.starts_with('.') && name.ends_with(".sql")
}
