//! Hierarchical content index: directories, files and their blocks.
//!
//! Nodes live in an arena owned by [`Tree`] and refer to each other by
//! index, never by owning pointers. A tree is built bottom-up by the indexer
//! and is immutable afterwards, except for directory strong checksums which
//! are filled in by [`Tree::compute_dir_strongs`] once every descendant is
//! finalized.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::hash::StrongHash;

/// Fixed block size governing both indexing and matching.
pub const BLOCK_SIZE: usize = 8192;

/// Index of a directory node within its [`Tree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DirId(pub u32);

/// Index of a file node within its [`Tree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileId(pub u32);

/// A fixed-size chunk of a file, fingerprinted both ways.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    /// 0-based chunk index within the parent file.
    pub position: u32,
    /// Rolling weak checksum of the chunk bytes.
    pub weak: u32,
    /// Strong checksum of the chunk bytes.
    pub strong: StrongHash,
}

impl Block {
    /// Byte offset of this block in its containing file.
    #[must_use]
    pub fn offset(&self) -> u64 {
        u64::from(self.position) * BLOCK_SIZE as u64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileNode {
    pub name: String,
    pub mode: u32,
    pub size: u64,
    /// Digest of the file contents (not derived from block checksums).
    pub strong: StrongHash,
    pub parent: Option<DirId>,
    pub blocks: Vec<Block>,
}

impl FileNode {
    /// True length of the block at `position` (the last block may be short).
    #[must_use]
    pub fn block_len(&self, position: u32) -> u64 {
        let offset = u64::from(position) * BLOCK_SIZE as u64;
        (self.size - offset).min(BLOCK_SIZE as u64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirNode {
    pub name: String,
    pub mode: u32,
    /// Digest of the canonical child listing; the Merkle root of the subtree.
    pub strong: StrongHash,
    pub parent: Option<DirId>,
    pub subdirs: Vec<DirId>,
    pub files: Vec<FileId>,
}

/// Reference to a filesystem node: a directory or a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FsRef {
    Dir(DirId),
    File(FileId),
}

/// Reference to any node of the index, blocks included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeHandle {
    Dir(DirId),
    File(FileId),
    Block(FileId, u32),
}

/// An immutable hierarchical index of one tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tree {
    dirs: Vec<DirNode>,
    files: Vec<FileNode>,
    root: FsRef,
}

impl Tree {
    /// Start a directory-rooted tree. The root has no name; relative paths
    /// are expressed below it.
    #[must_use]
    pub fn with_root_dir(mode: u32) -> (Self, DirId) {
        let tree = Self {
            dirs: vec![DirNode {
                name: String::new(),
                mode,
                strong: StrongHash::from_bytes(&[]),
                parent: None,
                subdirs: Vec::new(),
                files: Vec::new(),
            }],
            files: Vec::new(),
            root: FsRef::Dir(DirId(0)),
        };
        (tree, DirId(0))
    }

    /// Build a tree whose root is a single regular file.
    #[must_use]
    pub fn with_root_file(
        name: String,
        mode: u32,
        size: u64,
        strong: StrongHash,
        blocks: Vec<Block>,
    ) -> Self {
        Self {
            dirs: Vec::new(),
            files: vec![FileNode {
                name,
                mode,
                size,
                strong,
                parent: None,
                blocks,
            }],
            root: FsRef::File(FileId(0)),
        }
    }

    /// Append a subdirectory under `parent`.
    pub fn add_dir(&mut self, parent: DirId, name: String, mode: u32) -> DirId {
        let id = DirId(self.dirs.len() as u32);
        self.dirs.push(DirNode {
            name,
            mode,
            strong: StrongHash::from_bytes(&[]),
            parent: Some(parent),
            subdirs: Vec::new(),
            files: Vec::new(),
        });
        self.dirs[parent.0 as usize].subdirs.push(id);
        id
    }

    /// Append a file under `parent`.
    pub fn add_file(
        &mut self,
        parent: DirId,
        name: String,
        mode: u32,
        size: u64,
        strong: StrongHash,
        blocks: Vec<Block>,
    ) -> FileId {
        let id = FileId(self.files.len() as u32);
        self.files.push(FileNode {
            name,
            mode,
            size,
            strong,
            parent: Some(parent),
            blocks,
        });
        self.dirs[parent.0 as usize].files.push(id);
        id
    }

    #[must_use]
    pub fn root(&self) -> FsRef {
        self.root
    }

    #[must_use]
    pub fn dir(&self, id: DirId) -> &DirNode {
        &self.dirs[id.0 as usize]
    }

    #[must_use]
    pub fn file(&self, id: FileId) -> &FileNode {
        &self.files[id.0 as usize]
    }

    #[must_use]
    pub fn dir_count(&self) -> usize {
        self.dirs.len()
    }

    #[must_use]
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Strong checksum of the root node.
    #[must_use]
    pub fn root_strong(&self) -> StrongHash {
        match self.root {
            FsRef::Dir(id) => self.dir(id).strong,
            FsRef::File(id) => self.file(id).strong,
        }
    }

    #[must_use]
    pub fn strong_of(&self, handle: NodeHandle) -> StrongHash {
        match handle {
            NodeHandle::Dir(id) => self.dir(id).strong,
            NodeHandle::File(id) => self.file(id).strong,
            NodeHandle::Block(file, position) => {
                self.file(file).blocks[position as usize].strong
            }
        }
    }

    /// Relative path of a filesystem node from the tree root. The root
    /// itself resolves to the empty path.
    #[must_use]
    pub fn rel_path(&self, node: FsRef) -> PathBuf {
        let mut parts: Vec<&str> = Vec::new();
        let mut current = node;
        loop {
            let (name, parent) = match current {
                FsRef::Dir(id) => {
                    let dir = self.dir(id);
                    (dir.name.as_str(), dir.parent)
                }
                FsRef::File(id) => {
                    let file = self.file(id);
                    (file.name.as_str(), file.parent)
                }
            };
            match parent {
                Some(parent) => {
                    parts.push(name);
                    current = FsRef::Dir(parent);
                }
                None => break,
            }
        }
        parts.into_iter().rev().collect()
    }

    /// Canonical child listing of a directory: one line per child, subdirs
    /// first, `<strong>\t<d|f>\t<name>\n`. Valid once dir strongs are
    /// computed.
    #[must_use]
    pub fn dir_listing(&self, id: DirId) -> String {
        let dir = self.dir(id);
        let mut out = String::new();
        for &sub in &dir.subdirs {
            let sub = self.dir(sub);
            let _ = writeln!(out, "{}\td\t{}", sub.strong, sub.name);
        }
        for &file in &dir.files {
            let file = self.file(file);
            let _ = writeln!(out, "{}\tf\t{}", file.strong, file.name);
        }
        out
    }

    /// Fill in every directory's strong checksum, bottom-up. File strongs
    /// must already be final.
    pub fn compute_dir_strongs(&mut self) {
        if let FsRef::Dir(root) = self.root {
            self.compute_dir_strong(root);
        }
    }

    fn compute_dir_strong(&mut self, id: DirId) -> StrongHash {
        let subdirs = self.dir(id).subdirs.clone();
        for sub in subdirs {
            self.compute_dir_strong(sub);
        }
        let strong = StrongHash::from_bytes(self.dir_listing(id).as_bytes());
        self.dirs[id.0 as usize].strong = strong;
        strong
    }

    /// Find the filesystem node at a relative path. The empty path is the
    /// root.
    #[must_use]
    pub fn lookup(&self, rel: &Path) -> Option<FsRef> {
        let mut current = self.root;
        for component in rel.components() {
            let name = component.as_os_str().to_str()?;
            let FsRef::Dir(id) = current else {
                return None;
            };
            let dir = self.dir(id);
            current = dir
                .subdirs
                .iter()
                .copied()
                .find(|&sub| self.dir(sub).name == name)
                .map(FsRef::Dir)
                .or_else(|| {
                    dir.files
                        .iter()
                        .copied()
                        .find(|&file| self.file(file).name == name)
                        .map(FsRef::File)
                })?;
        }
        Some(current)
    }

    /// Traverse the index breadth-first. The visitor decides per node
    /// whether to descend into its children (files descend into blocks).
    pub fn walk(&self, visitor: impl FnMut(&Tree, NodeHandle) -> bool) {
        let start = match self.root {
            FsRef::Dir(id) => NodeHandle::Dir(id),
            FsRef::File(id) => NodeHandle::File(id),
        };
        self.walk_from(start, visitor);
    }

    /// Traverse breadth-first from an arbitrary node.
    pub fn walk_from(&self, start: NodeHandle, mut visitor: impl FnMut(&Tree, NodeHandle) -> bool) {
        let mut queue: Vec<NodeHandle> = vec![start];
        let mut head = 0;
        while head < queue.len() {
            let current = queue[head];
            head += 1;
            if !visitor(self, current) {
                continue;
            }
            match current {
                NodeHandle::Dir(id) => {
                    let dir = self.dir(id);
                    queue.extend(dir.subdirs.iter().map(|&d| NodeHandle::Dir(d)));
                    queue.extend(dir.files.iter().map(|&f| NodeHandle::File(f)));
                }
                NodeHandle::File(id) => {
                    queue.extend(
                        (0..self.file(id).blocks.len() as u32)
                            .map(|p| NodeHandle::Block(id, p)),
                    );
                }
                NodeHandle::Block(..) => {}
            }
        }
    }
}

/// A block within a specific file of a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRef {
    pub file: FileId,
    pub position: u32,
}

/// Flat mapping between checksums and nodes, derived from a finalized tree.
///
/// The weak map is many-to-many (weak collisions are expected). The strong
/// maps are kept per kind, because a file shorter than one block shares its
/// strong checksum with its only block and an empty file shares it with
/// every other empty file. Each per-kind map is one-to-one under SHA-1
/// collision resistance, keeping the last node visited for duplicate
/// content.
#[derive(Debug, Default, Clone)]
pub struct BlockIndex {
    weak: HashMap<u32, Vec<BlockRef>>,
    files: HashMap<StrongHash, FileId>,
    dirs: HashMap<StrongHash, DirId>,
    blocks: HashMap<StrongHash, BlockRef>,
}

impl BlockIndex {
    /// Derive the flat index from a tree in a single traversal.
    #[must_use]
    pub fn build(tree: &Tree) -> Self {
        let mut index = Self::default();
        tree.walk(|tree, handle| {
            let strong = tree.strong_of(handle);
            match handle {
                NodeHandle::Dir(id) => {
                    index.dirs.insert(strong, id);
                }
                NodeHandle::File(id) => {
                    index.files.insert(strong, id);
                }
                NodeHandle::Block(file, position) => {
                    let block = BlockRef { file, position };
                    index.blocks.insert(strong, block);
                    let weak = tree.file(file).blocks[position as usize].weak;
                    index.weak.entry(weak).or_default().push(block);
                }
            }
            true
        });
        index
    }

    /// Any node bound to a strong checksum, preferring files over
    /// directories over blocks.
    #[must_use]
    pub fn node(&self, strong: &StrongHash) -> Option<NodeHandle> {
        self.file(strong)
            .map(NodeHandle::File)
            .or_else(|| self.dir(strong).map(NodeHandle::Dir))
            .or_else(|| {
                self.block(strong)
                    .map(|b| NodeHandle::Block(b.file, b.position))
            })
    }

    #[must_use]
    pub fn file(&self, strong: &StrongHash) -> Option<FileId> {
        self.files.get(strong).copied()
    }

    #[must_use]
    pub fn dir(&self, strong: &StrongHash) -> Option<DirId> {
        self.dirs.get(strong).copied()
    }

    #[must_use]
    pub fn block(&self, strong: &StrongHash) -> Option<BlockRef> {
        self.blocks.get(strong).copied()
    }

    /// All blocks sharing a weak checksum.
    #[must_use]
    pub fn blocks_with_weak(&self, weak: u32) -> &[BlockRef] {
        self.weak.get(&weak).map_or(&[], Vec::as_slice)
    }
}

/// A finalized tree together with its flat checksum lookups.
#[derive(Debug, Clone)]
pub struct NodeRepo {
    tree: Tree,
    index: BlockIndex,
}

impl NodeRepo {
    #[must_use]
    pub fn new(tree: Tree) -> Self {
        let index = BlockIndex::build(&tree);
        Self { tree, index }
    }

    #[must_use]
    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    #[must_use]
    pub fn index(&self) -> &BlockIndex {
        &self.index
    }

    #[must_use]
    pub fn root(&self) -> FsRef {
        self.tree.root()
    }

    /// Look up a file node by content checksum.
    #[must_use]
    pub fn file(&self, strong: &StrongHash) -> Option<FileId> {
        self.index.file(strong)
    }

    /// Look up a directory node by listing checksum.
    #[must_use]
    pub fn dir(&self, strong: &StrongHash) -> Option<DirId> {
        self.index.dir(strong)
    }

    /// Look up a block by content checksum.
    #[must_use]
    pub fn block(&self, strong: &StrongHash) -> Option<BlockRef> {
        self.index.block(strong)
    }
}
