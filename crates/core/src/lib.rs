//! blocksync-core: content-addressed block-level directory sync engine.
//!
//! Provides hierarchical content indexing, rsync-style block matching, and
//! patch planning/execution that turns one tree into a byte-exact replica
//! of another while reusing content already on the destination.

pub mod error;
pub mod hash;
pub mod matcher;
pub mod node;
pub mod patch;
pub mod scan;
pub mod store;
pub mod track;

#[cfg(test)]
pub(crate) mod treegen;

pub use error::{Error, Result};
pub use hash::{weak_checksum, StrongHash, WeakChecksum};
pub use matcher::{match_file, BlockMatch, ByteRange, FileMatch};
pub use node::{
    Block, BlockIndex, BlockRef, DirId, DirNode, FileId, FileNode, FsRef, NodeHandle, NodeRepo,
    Tree, BLOCK_SIZE,
};
pub use patch::{patch, EntryKind, ExecError, PatchCmd, PatchPlan, TempId};
pub use scan::{index_dir, index_file, index_path, IndexAll, IndexFilter};
pub use store::{BlockStore, LocalStore, RELOC_PREFIX};
pub use track::{start_tracker, IndexSummary, PatchSummary, TrackerRequest};
