//! Exclude patterns compiled into an index filter.

use std::fs::Metadata;
use std::path::Path;

use color_eyre::Result;
use ignore::gitignore::{Gitignore, GitignoreBuilder};

use blocksync_core::IndexFilter;

/// An [`IndexFilter`] driven by gitignore-style exclude patterns. Matching
/// entries (and everything below a matching directory) are left out of the
/// index on both sides of a sync.
pub struct ExcludeFilter {
    matcher: Gitignore,
}

impl ExcludeFilter {
    /// Compile patterns relative to a tree root.
    ///
    /// # Errors
    /// Returns an error if a pattern is invalid.
    pub fn new(root: &Path, patterns: &[String]) -> Result<Self> {
        let mut builder = GitignoreBuilder::new(root);
        for pattern in patterns {
            builder.add_line(None, pattern)?;
        }
        Ok(Self {
            matcher: builder.build()?,
        })
    }
}

impl IndexFilter for ExcludeFilter {
    fn accept(&self, rel_path: &Path, meta: &Metadata) -> bool {
        !self
            .matcher
            .matched(rel_path, meta.is_dir())
            .is_ignore()
    }
}
