//! Snapshot directory management.
//!
//! A snapshot is an on-disk copy of the index directory named
//! `%016x.index`, the hex name being the journal position it covers.
//! Copies are made by hard-linking every index file into the snapshot
//! directory, which costs O(number of files) and no space; on filesystems
//! that refuse links the clone falls back to a byte copy per file.

use std::fs;
use std::io;
use std::path::Path;

use longshore_error::Result;
use tracing::{debug, warn};

/// Parse a `%016x.index` directory name into the position it covers.
pub(crate) fn parse_snapshot_name(name: &str) -> Option<u64> {
    let stem = name.strip_suffix(".index")?;
    if stem.len() != 16 {
        return None;
    }
    u64::from_str_radix(stem, 16).ok()
}

/// All snapshot positions present in `directory`, ascending.
pub(crate) fn enumerate_snapshots(directory: &Path) -> Result<Vec<u64>> {
    let mut positions = Vec::new();
    for entry in fs::read_dir(directory)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(position) = parse_snapshot_name(&entry.file_name().to_string_lossy()) {
            positions.push(position);
        }
    }
    positions.sort_unstable();
    Ok(positions)
}

/// Lock and diagnostic files the KV library mutates in place; linking them
/// would let the live index write through into the snapshot.
fn skip_index_file(name: &str) -> bool {
    name == "LOCK" || name == "LOG" || name.starts_with("LOG.old")
}

/// Populate `dst` with the index files of `src`, hard-linking where the
/// filesystem allows and copying where it does not.
pub(crate) fn clone_dir(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let name = entry.file_name();
        if !entry.file_type()?.is_file() {
            warn!(name = %name.to_string_lossy(), "skipping non-file in index directory");
            continue;
        }
        if skip_index_file(&name.to_string_lossy()) {
            continue;
        }
        link_or_copy(&entry.path(), &dst.join(&name))?;
    }
    Ok(())
}

/// Hard-link `src` to `dst`, falling back to a byte copy.
pub(crate) fn link_or_copy(src: &Path, dst: &Path) -> io::Result<()> {
    match fs::hard_link(src, dst) {
        Ok(()) => Ok(()),
        Err(error) => {
            debug!(
                src = %src.display(),
                %error,
                "hard link failed, copying instead"
            );
            fs::copy(src, dst).map(|_| ())
        }
    }
}
