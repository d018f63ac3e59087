//! Source file discovery
//!
//! [`SourceTree::files`] walks a directory recursively and yields the
//! absolute path of every regular file with the wanted extension. The walk
//! is lazy and sorted by file name, so the sequence is deterministic for a
//! given snapshot of the tree; calling `files` again starts over.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{EtlError, Result};

/// Default extension of source files
pub const DEFAULT_EXTENSION: &str = "json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceTree {
    root: PathBuf,
    extension: String,
}

impl SourceTree {
    /// Files under `root` ending in `.{extension}`
    ///
    /// A relative `root` is resolved against the current directory.
    pub fn new(root: impl AsRef<Path>, extension: impl Into<String>) -> Result<Self> {
        let root = root.as_ref();
        let root = std::path::absolute(root).map_err(|e| EtlError::io(root, e))?;
        let extension = extension.into().trim_start_matches('.').to_string();

        Ok(Self { root, extension })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Start a new walk over the tree
    pub fn files(&self) -> SourceFiles {
        SourceFiles {
            walk: WalkDir::new(&self.root)
                .follow_links(true)
                .sort_by_file_name()
                .into_iter(),
            extension: self.extension.clone(),
        }
    }
}

/// Lazy iterator over matching files; an I/O error ends the walk
pub struct SourceFiles {
    walk: walkdir::IntoIter,
    extension: String,
}

impl Iterator for SourceFiles {
    type Item = Result<PathBuf>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.walk.next()? {
                Ok(entry) => entry,
                Err(e) => return Some(Err(EtlError::Extract(e))),
            };

            if entry.file_type().is_file()
                && entry.path().extension() == Some(OsStr::new(&self.extension))
            {
                return Some(Ok(entry.into_path()));
            }
        }
    }
}
