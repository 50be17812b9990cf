//! Byte storage over an indexed tree: content-addressed range reads and
//! destination-side path resolution with conflict relocation.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tracing::debug;

use crate::error::{Error, Result};
use crate::hash::StrongHash;
use crate::node::{FsRef, NodeRepo, BLOCK_SIZE};
use crate::scan::{index_path, IndexAll, IndexFilter};

/// Read access to raw bytes addressed by strong checksum. The source side of
/// a patch only ever needs this capability.
pub trait BlockStore {
    /// The indexed tree behind this store.
    fn repo(&self) -> &NodeRepo;

    /// Bytes of the block with the given strong checksum.
    ///
    /// # Errors
    /// Returns [`Error::NotFound`] if no block is bound to the checksum.
    fn read_block(&self, strong: &StrongHash) -> Result<Bytes>;

    /// Stream `length` bytes starting at `from` out of the file with the
    /// given strong checksum. Returns the byte count written.
    ///
    /// # Errors
    /// Returns [`Error::NotFound`] for an unbound checksum and an I/O error
    /// if the backing file cannot supply the full range.
    fn read_into(
        &self,
        strong: &StrongHash,
        from: u64,
        length: u64,
        writer: &mut dyn Write,
    ) -> Result<u64>;
}

/// Filename prefix for relocated conflict entries.
pub const RELOC_PREFIX: &str = "_reloc";

/// A [`BlockStore`] over a local directory (or single file) root.
///
/// Beyond reads, a `LocalStore` resolves relative paths to absolute ones and
/// can relocate a conflicting entry to a fresh `_reloc*` sibling. A
/// relocation shadows `resolve` lookups for the original path until it is
/// cleaned; write targets use [`LocalStore::abs_path`], which never follows
/// relocations.
pub struct LocalStore {
    root_path: PathBuf,
    repo: NodeRepo,
    relocs: HashMap<PathBuf, PathBuf>,
    index_errors: Vec<Error>,
}

impl LocalStore {
    /// Open and index a store, accepting every entry.
    ///
    /// # Errors
    /// Returns an error if the root cannot be indexed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with_filter(root, &IndexAll)
    }

    /// Open and index a store with an entry filter.
    ///
    /// # Errors
    /// Returns an error if the root cannot be indexed.
    pub fn open_with_filter(
        root: impl Into<PathBuf>,
        filter: &dyn IndexFilter,
    ) -> Result<Self> {
        let root_path = root.into();
        let mut index_errors = Vec::new();
        let tree = index_path(&root_path, filter, &mut index_errors)?;
        Ok(Self {
            root_path,
            repo: NodeRepo::new(tree),
            relocs: HashMap::new(),
            index_errors,
        })
    }

    /// Re-index the root in place, keeping relocation state.
    ///
    /// # Errors
    /// Returns an error if the root cannot be indexed.
    pub fn reindex(&mut self, filter: &dyn IndexFilter) -> Result<()> {
        let mut index_errors = Vec::new();
        let tree = index_path(&self.root_path, filter, &mut index_errors)?;
        self.repo = NodeRepo::new(tree);
        self.index_errors = index_errors;
        Ok(())
    }

    #[must_use]
    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    /// Per-entry errors funnelled while indexing the root.
    #[must_use]
    pub fn index_errors(&self) -> &[Error] {
        &self.index_errors
    }

    /// Strip the root from an absolute path.
    #[must_use]
    pub fn rel_path(&self, abs: &Path) -> Option<PathBuf> {
        abs.strip_prefix(&self.root_path)
            .ok()
            .map(Path::to_path_buf)
    }

    /// Absolute path for a relative one, ignoring relocations. This is the
    /// address for writes that (re)create content at a path.
    #[must_use]
    pub fn abs_path(&self, rel: &Path) -> PathBuf {
        if matches!(self.repo.root(), FsRef::File(_)) {
            return self.root_path.clone();
        }
        self.root_path.join(rel)
    }

    /// Absolute path for a relative one, following a pending relocation if
    /// the path has one. This is the address for reads of existing content.
    #[must_use]
    pub fn resolve(&self, rel: &Path) -> PathBuf {
        if matches!(self.repo.root(), FsRef::File(_)) {
            return self.root_path.clone();
        }
        match self.relocs.get(rel) {
            Some(reloc) => self.root_path.join(reloc),
            None => self.root_path.join(rel),
        }
    }

    /// Move the entry at `rel` out of the way to a freshly-named `_reloc*`
    /// sibling in the store root and record the shadow mapping. Returns the
    /// absolute relocation path.
    ///
    /// # Errors
    /// Returns an error if a relocation name cannot be allocated or the
    /// rename fails.
    pub fn relocate(&mut self, rel: &Path) -> Result<PathBuf> {
        let from = self.root_path.join(rel);

        // Allocate a fresh sibling name, then free it so a directory can
        // take it over.
        let placeholder = tempfile::Builder::new()
            .prefix(RELOC_PREFIX)
            .tempfile_in(&self.root_path)
            .map_err(|e| Error::io("create", &self.root_path, e))?;
        let reloc_abs = placeholder.path().to_path_buf();
        drop(placeholder);

        std::fs::rename(&from, &reloc_abs).map_err(|e| Error::io("rename", &from, e))?;
        debug!(from = %from.display(), to = %reloc_abs.display(), "relocated conflict");

        let reloc_rel = reloc_abs
            .strip_prefix(&self.root_path)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| reloc_abs.clone());
        self.relocs.insert(rel.to_path_buf(), reloc_rel);
        Ok(reloc_abs)
    }

    /// Drop the shadow mapping for a cleaned relocation.
    pub fn clear_reloc(&mut self, rel: &Path) {
        self.relocs.remove(rel);
    }

    /// Pending relocations, original relpath to relocation relpath.
    #[must_use]
    pub fn relocs(&self) -> &HashMap<PathBuf, PathBuf> {
        &self.relocs
    }
}

impl BlockStore for LocalStore {
    fn repo(&self) -> &NodeRepo {
        &self.repo
    }

    fn read_block(&self, strong: &StrongHash) -> Result<Bytes> {
        let block = self
            .repo
            .block(strong)
            .ok_or_else(|| Error::NotFound(strong.to_hex()))?;
        let file = self.repo.tree().file(block.file);
        let offset = u64::from(block.position) * BLOCK_SIZE as u64;
        let length = file.block_len(block.position);

        let mut buf = Vec::with_capacity(length as usize);
        self.read_into(&file.strong, offset, length, &mut buf)?;
        Ok(Bytes::from(buf))
    }

    fn read_into(
        &self,
        strong: &StrongHash,
        from: u64,
        length: u64,
        writer: &mut dyn Write,
    ) -> Result<u64> {
        let file_id = self
            .repo
            .file(strong)
            .ok_or_else(|| Error::NotFound(strong.to_hex()))?;
        let rel = self.repo.tree().rel_path(FsRef::File(file_id));
        let path = self.resolve(&rel);

        let mut fh = File::open(&path).map_err(|e| Error::io("open", &path, e))?;
        fh.seek(SeekFrom::Start(from))
            .map_err(|e| Error::io("seek", &path, e))?;
        let written = std::io::copy(&mut std::io::Read::take(fh, length), writer)
            .map_err(|e| Error::io("read", &path, e))?;
        if written != length {
            return Err(Error::short_read(&path, length, written));
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::treegen::{d, f, seeded_bytes, write_tree};
    use tempfile::TempDir;

    fn store_with(entries: &[crate::treegen::Gen]) -> (TempDir, LocalStore) {
        let root = TempDir::new().unwrap();
        write_tree(root.path(), entries);
        let store = LocalStore::open(root.path()).unwrap();
        (root, store)
    }

    #[test]
    fn read_into_serves_ranges() {
        let (_root, store) = store_with(&[d("foo", vec![f("bar", vec![(42, 65537)])])]);
        let content = seeded_bytes(42, 65537);
        let strong = StrongHash::from_bytes(&content);

        let mut out = Vec::new();
        let n = store.read_into(&strong, 100, 2000, &mut out).unwrap();
        assert_eq!(n, 2000);
        assert_eq!(out, &content[100..2100]);
    }

    #[test]
    fn read_into_rejects_short_ranges() {
        let (_root, store) = store_with(&[f("bar", vec![(42, 100)])]);
        let strong = StrongHash::from_bytes(&seeded_bytes(42, 100));

        let mut out = Vec::new();
        let err = store.read_into(&strong, 50, 100, &mut out).unwrap_err();
        assert!(matches!(err, Error::Io { op: "read", .. }), "{err}");
    }

    #[test]
    fn read_block_uses_true_length_of_short_tail() {
        let (_root, store) = store_with(&[f("bar", vec![(42, BLOCK_SIZE + 7)])]);
        let content = seeded_bytes(42, BLOCK_SIZE + 7);
        let tail_strong = StrongHash::from_bytes(&content[BLOCK_SIZE..]);

        let bytes = store.read_block(&tail_strong).unwrap();
        assert_eq!(bytes.len(), 7);
        assert_eq!(&bytes[..], &content[BLOCK_SIZE..]);
    }

    #[test]
    fn unknown_strong_is_not_found() {
        let (_root, store) = store_with(&[f("bar", vec![(42, 10)])]);
        let strong = StrongHash::from_bytes(b"absent");

        assert!(matches!(
            store.read_block(&strong),
            Err(Error::NotFound(_))
        ));
        let mut sink = Vec::new();
        assert!(matches!(
            store.read_into(&strong, 0, 1, &mut sink),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn relocation_shadows_resolve_until_cleared() {
        let (root, mut store) = store_with(&[d("foo", vec![f("bar", vec![(1, 64)])])]);
        let rel = Path::new("foo/bar");

        assert_eq!(store.resolve(rel), root.path().join("foo/bar"));

        let reloc = store.relocate(rel).unwrap();
        assert!(reloc
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with(RELOC_PREFIX));
        assert!(reloc.exists());
        assert!(!root.path().join("foo/bar").exists());

        // Reads follow the shadow, writes do not.
        assert_eq!(store.resolve(rel), reloc);
        assert_eq!(store.abs_path(rel), root.path().join("foo/bar"));

        store.clear_reloc(rel);
        assert_eq!(store.resolve(rel), root.path().join("foo/bar"));
    }

    #[test]
    fn file_rooted_store_resolves_to_its_root() {
        let root = TempDir::new().unwrap();
        write_tree(root.path(), &[f("solo", vec![(3, 20)])]);
        let path = root.path().join("solo");
        let store = LocalStore::open(&path).unwrap();

        assert_eq!(store.resolve(Path::new("anything")), path);
        assert_eq!(store.abs_path(Path::new("")), path);

        let strong = StrongHash::from_bytes(&seeded_bytes(3, 20));
        let bytes = store.read_block(&strong).unwrap();
        assert_eq!(bytes.len(), 20);
    }

    #[test]
    fn rel_path_strips_the_root() {
        let (root, store) = store_with(&[d("foo", vec![f("bar", vec![(1, 8)])])]);
        assert_eq!(
            store.rel_path(&root.path().join("foo/bar")),
            Some(PathBuf::from("foo/bar"))
        );
        assert_eq!(store.rel_path(Path::new("/elsewhere")), None);
    }
}
