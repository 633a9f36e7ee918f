//! Mapping of numeric ids onto a directory tree with bounded fan-out.
//!
//! Ids below 1000 live directly under `root/<kind>`. Larger ids get one
//! `Dir-XXX` segment per group of three decimal digits above the lowest group,
//! most significant first, so no directory holds more than 1000 entries.
//! The layout is part of the on-disk format and must not change.

use std::{
    ffi::OsString,
    io,
    path::{Path, PathBuf},
};

const PYRAMID_SUFFIX: &str = ".pyramid";
const LOCK_SUFFIX: &str = ".lock";
const STAGING_SUFFIX: &str = ".tmp";

/// Top-level directory under the storage root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Pixels,
    Files,
}

impl StoreKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreKind::Pixels => "Pixels",
            StoreKind::Files => "Files",
        }
    }
}

/// The `Dir-XXX` segments for an id, most significant first.
pub fn shard_segments(id: u64) -> Vec<String> {
    let mut segments = Vec::new();
    let mut remaining = id;
    while remaining > 999 {
        remaining /= 1000;
        segments.push(format!("Dir-{:03}", remaining % 1000));
    }
    segments.reverse();
    segments
}

/// Sharded location of `id` under `root/<kind>`.
pub fn shard_path(root: &Path, kind: StoreKind, id: u64) -> PathBuf {
    let mut path = root.join(kind.as_str());
    for segment in shard_segments(id) {
        path.push(segment);
    }
    path.push(id.to_string());
    path
}

/// `path` with `suffix` appended to its final component.
fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s = OsString::from(path.as_os_str());
    s.push(suffix);
    PathBuf::from(s)
}

/// Hidden sibling of `path` with `suffix` appended, e.g. `dir/.name.tmp`.
fn hidden_sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(".");
    if let Some(file_name) = path.file_name() {
        name.push(file_name);
    }
    name.push(suffix);
    path.with_file_name(name)
}

/// Lock file guarding construction of the pyramid at `pyramid_path`.
pub fn pyramid_lock_path(pyramid_path: &Path) -> PathBuf {
    with_suffix(pyramid_path, LOCK_SUFFIX)
}

/// Directory a pyramid is built in before being renamed to `pyramid_path`.
pub fn pyramid_staging_path(pyramid_path: &Path) -> PathBuf {
    hidden_sibling(pyramid_path, STAGING_SUFFIX)
}

/// Create every missing parent directory of `path`.
///
/// Racing creators are fine: a directory that already exists is not an error.
pub fn ensure_parent_dirs(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

/// All paths derived from one storage root.
#[derive(Debug, Clone)]
pub struct PathLayout {
    root: PathBuf,
}

impl PathLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Flat pixel buffer of `id`.
    pub fn pixels_path(&self, id: u64) -> PathBuf {
        shard_path(&self.root, StoreKind::Pixels, id)
    }

    /// Pyramid container of `id`, next to its flat buffer.
    pub fn pyramid_path(&self, id: u64) -> PathBuf {
        with_suffix(&self.pixels_path(id), PYRAMID_SUFFIX)
    }

    pub fn pyramid_lock_path(&self, id: u64) -> PathBuf {
        pyramid_lock_path(&self.pyramid_path(id))
    }

    pub fn pyramid_staging_path(&self, id: u64) -> PathBuf {
        pyramid_staging_path(&self.pyramid_path(id))
    }

    /// Ancillary original file of `id`.
    pub fn files_path(&self, id: u64) -> PathBuf {
        shard_path(&self.root, StoreKind::Files, id)
    }
}
