//! Filesystem indexing: walk a root, produce a [`Tree`].

use std::fs::{self, Metadata};
use std::io::Read;
use std::path::Path;

use sha1::{Digest, Sha1};
use tracing::debug;

use crate::error::{Error, Result};
use crate::hash::{StrongHash, WeakChecksum};
use crate::node::{Block, DirId, Tree, BLOCK_SIZE};

/// Accepts or rejects entries during indexing. Rejecting a directory
/// short-circuits its whole subtree.
pub trait IndexFilter {
    fn accept(&self, rel_path: &Path, meta: &Metadata) -> bool;
}

impl<F: Fn(&Path, &Metadata) -> bool> IndexFilter for F {
    fn accept(&self, rel_path: &Path, meta: &Metadata) -> bool {
        self(rel_path, meta)
    }
}

/// The filter that accepts everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndexAll;

impl IndexFilter for IndexAll {
    fn accept(&self, _rel_path: &Path, _meta: &Metadata) -> bool {
        true
    }
}

/// Index whatever lives at `root`: a directory yields a full tree, a regular
/// file a single-file tree.
///
/// Unreadable entries below the root are reported through `errors` and
/// skipped; an unreadable root is fatal.
///
/// # Errors
/// Returns an error if the root cannot be indexed at all.
pub fn index_path(
    root: &Path,
    filter: &dyn IndexFilter,
    errors: &mut Vec<Error>,
) -> Result<Tree> {
    let meta = fs::metadata(root).map_err(|e| Error::IndexUnreadable {
        path: root.to_path_buf(),
        source: e,
    })?;
    if meta.is_dir() {
        index_dir(root, filter, errors)
    } else if meta.is_file() {
        index_file(root)
    } else {
        Err(Error::KindMismatch {
            path: root.to_path_buf(),
            expected: "a file or directory",
        })
    }
}

/// Index a directory tree rooted at `root`.
///
/// # Errors
/// Returns an error if the root directory cannot be read.
pub fn index_dir(
    root: &Path,
    filter: &dyn IndexFilter,
    errors: &mut Vec<Error>,
) -> Result<Tree> {
    let meta = fs::metadata(root).map_err(|e| Error::IndexUnreadable {
        path: root.to_path_buf(),
        source: e,
    })?;
    if !meta.is_dir() {
        return Err(Error::KindMismatch {
            path: root.to_path_buf(),
            expected: "a directory",
        });
    }

    let (mut tree, root_id) = Tree::with_root_dir(mode_bits(&meta));
    index_children(&mut tree, root_id, root, Path::new(""), filter, errors).map_err(|e| {
        Error::IndexUnreadable {
            path: root.to_path_buf(),
            source: e,
        }
    })?;
    tree.compute_dir_strongs();
    debug!(
        root = %root.display(),
        dirs = tree.dir_count(),
        files = tree.file_count(),
        strong = %tree.root_strong(),
        "indexed directory tree"
    );
    Ok(tree)
}

/// Index a single regular file as a tree of its own.
///
/// # Errors
/// Returns an error if the path is not a readable regular file.
pub fn index_file(path: &Path) -> Result<Tree> {
    let meta = fs::metadata(path).map_err(|e| Error::IndexUnreadable {
        path: path.to_path_buf(),
        source: e,
    })?;
    if !meta.is_file() {
        return Err(Error::KindMismatch {
            path: path.to_path_buf(),
            expected: "a regular file",
        });
    }

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let (size, strong, blocks) = file_blocks(path)?;
    Ok(Tree::with_root_file(
        name,
        mode_bits(&meta),
        size,
        strong,
        blocks,
    ))
}

fn index_children(
    tree: &mut Tree,
    dir_id: DirId,
    abs_dir: &Path,
    rel_dir: &Path,
    filter: &dyn IndexFilter,
    errors: &mut Vec<Error>,
) -> std::io::Result<()> {
    let mut names = Vec::new();
    for entry in fs::read_dir(abs_dir)? {
        match entry {
            Ok(entry) => names.push(entry.file_name()),
            Err(e) => errors.push(Error::io("read_dir", abs_dir, e)),
        }
    }
    names.sort();

    for name in names {
        let abs = abs_dir.join(&name);
        let rel = rel_dir.join(&name);
        let meta = match fs::metadata(&abs) {
            Ok(meta) => meta,
            Err(e) => {
                errors.push(Error::io("stat", &abs, e));
                continue;
            }
        };
        if !filter.accept(&rel, &meta) {
            continue;
        }
        let name = name.to_string_lossy().into_owned();

        if meta.is_dir() {
            let sub = tree.add_dir(dir_id, name, mode_bits(&meta));
            if let Err(e) = index_children(tree, sub, &abs, &rel, filter, errors) {
                errors.push(Error::io("read_dir", &abs, e));
            }
        } else if meta.is_file() {
            match file_blocks(&abs) {
                Ok((size, strong, blocks)) => {
                    tree.add_file(dir_id, name, mode_bits(&meta), size, strong, blocks);
                }
                Err(e) => errors.push(e),
            }
        }
        // Symlinks and special files are not indexed.
    }

    Ok(())
}

/// Stream a file in [`BLOCK_SIZE`] chunks, producing one fingerprinted block
/// per non-empty chunk and a single running digest for the whole file.
fn file_blocks(path: &Path) -> Result<(u64, StrongHash, Vec<Block>)> {
    let mut file = fs::File::open(path).map_err(|e| Error::io("open", path, e))?;
    let mut hasher = Sha1::new();
    let mut blocks = Vec::new();
    let mut chunk = [0u8; BLOCK_SIZE];
    let mut size = 0u64;
    let mut position = 0u32;

    loop {
        let n = read_chunk(&mut file, &mut chunk).map_err(|e| Error::io("read", path, e))?;
        if n == 0 {
            break;
        }
        let data = &chunk[..n];

        let mut weak = WeakChecksum::new();
        weak.update(data);
        blocks.push(Block {
            position,
            weak: weak.value(),
            strong: StrongHash::from_bytes(data),
        });

        hasher.update(data);
        size += n as u64;
        position += 1;
    }

    Ok((size, StrongHash::from_digest(hasher), blocks))
}

/// Read until the buffer is full or the stream ends.
fn read_chunk(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(unix)]
fn mode_bits(meta: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt as _;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode_bits(meta: &Metadata) -> u32 {
    if meta.is_dir() {
        0o755
    } else {
        0o644
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::FsRef;
    use tempfile::TempDir;

    #[test]
    fn file_block_count_and_strong() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.bin");
        let content: Vec<u8> = (0..BLOCK_SIZE * 2 + 5).map(|i| (i % 251) as u8).collect();
        fs::write(&path, &content).unwrap();

        let tree = index_file(&path).unwrap();
        let FsRef::File(id) = tree.root() else {
            panic!("file root expected");
        };
        let file = tree.file(id);

        assert_eq!(file.size, content.len() as u64);
        assert_eq!(file.blocks.len(), 3);
        assert_eq!(file.blocks[2].position, 2);
        assert_eq!(file.strong, StrongHash::from_bytes(&content));
        assert_eq!(
            file.blocks[2].strong,
            StrongHash::from_bytes(&content[BLOCK_SIZE * 2..])
        );
    }

    #[test]
    fn empty_file_has_no_blocks() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty");
        fs::write(&path, b"").unwrap();

        let tree = index_file(&path).unwrap();
        let FsRef::File(id) = tree.root() else {
            panic!("file root expected");
        };
        assert!(tree.file(id).blocks.is_empty());
        assert_eq!(tree.file(id).strong, StrongHash::from_bytes(b""));
    }

    #[test]
    fn indexing_a_dir_as_file_fails() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            index_file(dir.path()),
            Err(Error::KindMismatch { .. })
        ));
    }

    #[test]
    fn identical_trees_share_root_strong() {
        let mut errors = Vec::new();
        let mut build = || {
            let dir = TempDir::new().unwrap();
            fs::create_dir_all(dir.path().join("a/b")).unwrap();
            fs::write(dir.path().join("a/top.txt"), b"top").unwrap();
            fs::write(dir.path().join("a/b/deep.txt"), b"deep").unwrap();
            dir
        };
        let one = build();
        let two = build();

        let tree_one = index_dir(one.path(), &IndexAll, &mut errors).unwrap();
        let tree_two = index_dir(two.path(), &IndexAll, &mut errors).unwrap();
        assert!(errors.is_empty());
        assert_eq!(tree_one.root_strong(), tree_two.root_strong());
    }

    #[test]
    fn content_change_changes_root_strong() {
        let mut errors = Vec::new();
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("f"), b"one").unwrap();
        let before = index_dir(dir.path(), &IndexAll, &mut errors).unwrap();

        fs::write(dir.path().join("f"), b"two").unwrap();
        let after = index_dir(dir.path(), &IndexAll, &mut errors).unwrap();

        assert_ne!(before.root_strong(), after.root_strong());
    }

    #[test]
    fn filter_short_circuits_subtrees() {
        let mut errors = Vec::new();
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("skip/me")).unwrap();
        fs::write(dir.path().join("skip/me/hidden.txt"), b"hidden").unwrap();
        fs::write(dir.path().join("keep.txt"), b"keep").unwrap();

        let filter =
            |rel: &Path, _meta: &Metadata| rel.file_name().is_none_or(|n| n != "skip");
        let tree = index_dir(dir.path(), &filter, &mut errors).unwrap();

        assert_eq!(tree.file_count(), 1);
        assert_eq!(tree.dir_count(), 1); // root only
    }

    #[test]
    fn unreadable_root_is_fatal() {
        let mut errors = Vec::new();
        let missing = Path::new("/definitely/not/here");
        assert!(matches!(
            index_dir(missing, &IndexAll, &mut errors),
            Err(Error::IndexUnreadable { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_entry_is_funnelled_not_fatal() {
        use std::os::unix::fs::PermissionsExt as _;

        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("locked")).unwrap();
        fs::write(dir.path().join("locked/inner.txt"), b"x").unwrap();
        fs::write(dir.path().join("ok.txt"), b"ok").unwrap();
        fs::set_permissions(dir.path().join("locked"), fs::Permissions::from_mode(0o000))
            .unwrap();

        let mut errors = Vec::new();
        let tree = index_dir(dir.path(), &IndexAll, &mut errors).unwrap();

        fs::set_permissions(dir.path().join("locked"), fs::Permissions::from_mode(0o755))
            .unwrap();

        assert!(!errors.is_empty());
        assert_eq!(tree.file_count(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn modes_are_recorded() {
        use std::os::unix::fs::PermissionsExt as _;

        let mut errors = Vec::new();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("exec.sh");
        fs::write(&path, b"#!/bin/sh\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o765)).unwrap();

        let tree = index_dir(dir.path(), &IndexAll, &mut errors).unwrap();
        let FsRef::Dir(root) = tree.root() else {
            panic!("dir root expected");
        };
        let file = tree.file(tree.dir(root).files[0]);
        assert_eq!(file.mode, 0o765);
    }
}
