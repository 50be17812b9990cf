//! Patch planning and execution: diff two indexed trees into an ordered
//! command sequence, then apply it with crash-safe staging.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read as _, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::hash::StrongHash;
use crate::matcher::match_file;
use crate::node::{FileNode, FsRef, NodeHandle, Tree, BLOCK_SIZE};
use crate::store::{BlockStore, LocalStore};

/// Ties temp-staging commands to the `LocalTemp` that opened their handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TempId(pub u32);

/// What the planner found sitting at a conflicted path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    File,
    Dir,
    Other,
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::File => "file",
            Self::Dir => "directory",
            Self::Other => "entry",
        })
    }
}

/// One step of a patch plan. Paths are relative to the destination store
/// root unless noted otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatchCmd {
    /// The destination already holds the right content at the right path.
    Keep { path: PathBuf },
    /// Destination content at `from` is the source content wanted at `to`.
    /// The last planned use of `from` moves it; earlier uses copy.
    Transfer { from: PathBuf, to: PathBuf },
    /// The wrong kind of entry occupies `path`; relocate it aside. The
    /// relocation is deleted after the whole plan succeeds.
    Conflict { path: PathBuf, found: EntryKind },
    /// Create a directory that nothing else would create.
    MakeDir { path: PathBuf },
    /// Fetch an entire source file into `path`.
    SrcFileDownload {
        src_strong: StrongHash,
        path: PathBuf,
        size: u64,
    },
    /// Open the destination file at `path` and stage a sibling temp file
    /// truncated to `size`.
    LocalTemp {
        temp: TempId,
        path: PathBuf,
        size: u64,
    },
    /// Copy a range of the opened destination file into the temp.
    LocalTempCopy {
        temp: TempId,
        local_offset: u64,
        temp_offset: u64,
        length: u64,
    },
    /// Fetch a source range into the temp.
    SrcTempCopy {
        temp: TempId,
        src_strong: StrongHash,
        src_offset: u64,
        temp_offset: u64,
        length: u64,
    },
    /// Adjust the file length without touching content; used when the match
    /// shows truncation is all that is needed.
    Resize { path: PathBuf, size: u64 },
    /// Close both handles and rename the temp over the destination.
    ReplaceWithTemp { temp: TempId },
}

impl fmt::Display for PatchCmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Keep { path } => write!(f, "keep {}", path.display()),
            Self::Transfer { from, to } => {
                write!(f, "transfer {} to {}", from.display(), to.display())
            }
            Self::Conflict { path, found } => {
                write!(f, "conflict at {}, relocating {found}", path.display())
            }
            Self::MakeDir { path } => write!(f, "create directory {}", path.display()),
            Self::SrcFileDownload {
                src_strong,
                path,
                size,
            } => write!(
                f,
                "download {src_strong} to {} ({size} bytes)",
                path.display()
            ),
            Self::LocalTemp { path, size, .. } => {
                write!(f, "stage temp for {} ({size} bytes)", path.display())
            }
            Self::LocalTempCopy {
                local_offset,
                temp_offset,
                length,
                ..
            } => write!(
                f,
                "copy {length} bytes from target offset {local_offset} to temp offset {temp_offset}"
            ),
            Self::SrcTempCopy {
                src_strong,
                src_offset,
                temp_offset,
                length,
                ..
            } => write!(
                f,
                "copy {length} bytes from source {src_strong} offset {src_offset} to temp offset {temp_offset}"
            ),
            Self::Resize { path, size } => {
                write!(f, "resize {} to {size} bytes", path.display())
            }
            Self::ReplaceWithTemp { .. } => write!(f, "replace target with temp"),
        }
    }
}

/// A command that failed during execution, with the underlying error.
#[derive(Debug, thiserror::Error)]
#[error("{cmd} failed: {source}")]
pub struct ExecError {
    pub cmd: PatchCmd,
    #[source]
    pub source: Error,
}

/// An ordered command sequence transforming a destination tree into a
/// byte-exact replica of a source tree.
pub struct PatchPlan<S: BlockStore> {
    /// The commands, in execution order.
    pub cmds: Vec<PatchCmd>,
    src_store: S,
    dst_store: LocalStore,
    dst_file_unmatch: BTreeSet<PathBuf>,
    dst_dir_unmatch: BTreeSet<PathBuf>,
    reloc_refs: HashMap<PathBuf, i64>,
}

/// Index both roots and plan the patch between them.
///
/// # Errors
/// Returns an error if either root cannot be indexed or a destination file
/// cannot be read while matching.
pub fn patch(src: &Path, dst: &Path) -> Result<PatchPlan<LocalStore>> {
    let src_store = LocalStore::open(src)?;
    let dst_store = LocalStore::open(dst)?;
    PatchPlan::new(src_store, dst_store)
}

impl<S: BlockStore> PatchPlan<S> {
    /// Diff the source tree against the destination store and emit the
    /// command sequence.
    ///
    /// # Errors
    /// Returns an error if a destination file cannot be read while matching.
    pub fn new(src_store: S, dst_store: LocalStore) -> Result<Self> {
        let mut dst_file_unmatch = BTreeSet::new();
        let mut dst_dir_unmatch = BTreeSet::new();
        dst_store.repo().tree().walk(|tree, handle| match handle {
            NodeHandle::File(id) => {
                dst_file_unmatch.insert(tree.rel_path(FsRef::File(id)));
                false
            }
            NodeHandle::Dir(id) => {
                let rel = tree.rel_path(FsRef::Dir(id));
                if !rel.as_os_str().is_empty() {
                    dst_dir_unmatch.insert(rel);
                }
                true
            }
            NodeHandle::Block(..) => false,
        });

        let mut cmds = Vec::new();
        let mut reloc_refs: HashMap<PathBuf, i64> = HashMap::new();
        let mut next_temp = 0u32;
        let mut plan_err: Option<Error> = None;

        src_store.repo().tree().walk(|tree, handle| {
            if plan_err.is_some() {
                return false;
            }
            let (fs_ref, is_file) = match handle {
                NodeHandle::File(id) => (FsRef::File(id), true),
                NodeHandle::Dir(id) => (FsRef::Dir(id), false),
                NodeHandle::Block(..) => return false,
            };
            let src_path = tree.rel_path(fs_ref);

            // The source claims this path; whatever the destination holds
            // there is not leftover.
            dst_file_unmatch.remove(&src_path);
            dst_dir_unmatch.remove(&src_path);

            let src_strong = tree.strong_of(handle);
            let has_children = match handle {
                NodeHandle::Dir(id) => {
                    let dir = tree.dir(id);
                    !dir.subdirs.is_empty() || !dir.files.is_empty()
                }
                _ => false,
            };
            // Every empty directory shares the empty listing checksum;
            // content hits mean nothing for them.
            let dst_hit = if is_file || has_children {
                dst_store
                    .repo()
                    .file(&src_strong)
                    .map(FsRef::File)
                    .or_else(|| dst_store.repo().dir(&src_strong).map(FsRef::Dir))
            } else {
                None
            };

            if let Some(dst_ref) = dst_hit {
                if matches!(dst_ref, FsRef::File(_)) == is_file {
                    let dst_path = dst_store.repo().tree().rel_path(dst_ref);
                    *reloc_refs.entry(dst_path.clone()).or_insert(0) += 1;

                    if dst_path == src_path {
                        cmds.push(PatchCmd::Keep { path: src_path });
                        return !is_file;
                    }
                    cmds.push(PatchCmd::Transfer {
                        from: dst_path,
                        to: src_path,
                    });
                    if !is_file {
                        // The one transfer carries the identical subtree;
                        // claim its paths rather than planning them again.
                        claim_subtree(
                            tree,
                            handle,
                            &mut dst_file_unmatch,
                            &mut dst_dir_unmatch,
                        );
                    }
                    return false;
                }
                // Content hit of the wrong kind: treat as no hit.
            }

            let dst_abs = dst_store.resolve(&src_path);
            let dst_meta = fs::metadata(&dst_abs).ok();

            if is_file {
                let NodeHandle::File(file_id) = handle else {
                    return false;
                };
                let src_file = tree.file(file_id);

                match dst_meta {
                    Some(meta) if !meta.is_file() => {
                        // Wrong kind in the way: relocate it, then download.
                        claim_dst_subtree(
                            &dst_store,
                            &src_path,
                            &mut dst_file_unmatch,
                            &mut dst_dir_unmatch,
                        );
                        cmds.push(PatchCmd::Conflict {
                            path: src_path.clone(),
                            found: entry_kind(&meta),
                        });
                        cmds.push(PatchCmd::SrcFileDownload {
                            src_strong,
                            path: src_path,
                            size: src_file.size,
                        });
                    }
                    None => {
                        cmds.push(PatchCmd::SrcFileDownload {
                            src_strong,
                            path: src_path,
                            size: src_file.size,
                        });
                    }
                    Some(meta) => {
                        match file_cmds(src_file, src_path, &dst_abs, meta.len(), &mut next_temp)
                        {
                            Ok(mut staged) => cmds.append(&mut staged),
                            Err(e) => plan_err = Some(e),
                        }
                    }
                }
                false
            } else {
                let mut conflicted = false;
                if let Some(meta) = &dst_meta {
                    if !meta.is_dir() {
                        claim_dst_subtree(
                            &dst_store,
                            &src_path,
                            &mut dst_file_unmatch,
                            &mut dst_dir_unmatch,
                        );
                        cmds.push(PatchCmd::Conflict {
                            path: src_path.clone(),
                            found: entry_kind(meta),
                        });
                        conflicted = true;
                    }
                }
                // Child commands create their parent directories; an empty
                // directory has to be created explicitly.
                if !has_children && (dst_meta.is_none() || conflicted) {
                    cmds.push(PatchCmd::MakeDir { path: src_path });
                }
                true
            }
        });

        if let Some(e) = plan_err {
            return Err(e);
        }

        debug!(commands = cmds.len(), "patch plan ready");
        Ok(Self {
            cmds,
            src_store,
            dst_store,
            dst_file_unmatch,
            dst_dir_unmatch,
            reloc_refs,
        })
    }

    #[must_use]
    pub fn src_store(&self) -> &S {
        &self.src_store
    }

    #[must_use]
    pub fn dst_store(&self) -> &LocalStore {
        &self.dst_store
    }

    /// Planned-use counters per destination relpath, consulted by
    /// `Transfer` to pick move versus copy.
    #[must_use]
    pub fn reloc_refs(&self) -> &HashMap<PathBuf, i64> {
        &self.reloc_refs
    }

    /// Destination file relpaths no source path claimed.
    #[must_use]
    pub fn unmatched_files(&self) -> &BTreeSet<PathBuf> {
        &self.dst_file_unmatch
    }

    /// Apply the commands in order. The first failure aborts and reports the
    /// offending command; staged temps are dropped, but relocated conflicts
    /// stay where they are. On success every relocated conflict is deleted.
    ///
    /// # Errors
    /// Returns the failed command and the underlying error.
    pub fn exec(&mut self) -> std::result::Result<(), ExecError> {
        let mut temps: HashMap<TempId, StagedTemp> = HashMap::new();
        let mut conflicts: Vec<PathBuf> = Vec::new();

        for i in 0..self.cmds.len() {
            let cmd = self.cmds[i].clone();
            debug!(%cmd, "exec");
            if let Err(source) = self.exec_cmd(&cmd, &mut temps, &mut conflicts) {
                return Err(ExecError { cmd, source });
            }
        }

        if let Some(&temp) = temps.keys().next() {
            let cmd = self
                .cmds
                .iter()
                .find(|c| matches!(c, PatchCmd::LocalTemp { temp: t, .. } if *t == temp))
                .cloned()
                .unwrap_or(PatchCmd::ReplaceWithTemp { temp });
            return Err(ExecError {
                cmd,
                source: Error::PlanMalformed("staged temp was never replaced".into()),
            });
        }

        for rel in conflicts {
            let reloc = self.dst_store.resolve(&rel);
            if let Err(e) = remove_any(&reloc) {
                return Err(ExecError {
                    cmd: PatchCmd::Conflict {
                        path: rel,
                        found: EntryKind::Other,
                    },
                    source: e,
                });
            }
            self.dst_store.clear_reloc(&rel);
        }

        info!(commands = self.cmds.len(), "patch applied");
        Ok(())
    }

    fn exec_cmd(
        &mut self,
        cmd: &PatchCmd,
        temps: &mut HashMap<TempId, StagedTemp>,
        conflicts: &mut Vec<PathBuf>,
    ) -> Result<()> {
        match cmd {
            PatchCmd::Keep { .. } => Ok(()),

            PatchCmd::Transfer { from, to } => {
                let count = self.reloc_refs.entry(from.clone()).or_insert(0);
                *count -= 1;
                let remaining = *count;
                if remaining < 0 {
                    return Err(Error::PlanMalformed(format!(
                        "reference count underflow for {}",
                        from.display()
                    )));
                }

                let from_abs = self.dst_store.resolve(from);
                let to_abs = self.dst_store.abs_path(to);
                mk_parent_dirs(&to_abs)?;
                // One path nested in the other rules out a rename; copy and
                // let Clean collect whatever the source did not claim.
                let nested =
                    to_abs.starts_with(&from_abs) || from_abs.starts_with(&to_abs);
                if remaining > 0 || nested {
                    copy_any(&from_abs, &to_abs)
                } else {
                    move_entry(&from_abs, &to_abs)
                }
            }

            PatchCmd::Conflict { path, .. } => {
                self.dst_store.relocate(path)?;
                conflicts.push(path.clone());
                Ok(())
            }

            PatchCmd::MakeDir { path } => {
                let abs = self.dst_store.abs_path(path);
                fs::create_dir_all(&abs).map_err(|e| Error::io("mkdir", &abs, e))
            }

            PatchCmd::SrcFileDownload {
                src_strong,
                path,
                size,
            } => {
                let abs = self.dst_store.abs_path(path);
                mk_parent_dirs(&abs)?;
                let mut out = File::create(&abs).map_err(|e| Error::io("create", &abs, e))?;
                self.src_store.read_into(src_strong, 0, *size, &mut out)?;
                Ok(())
            }

            PatchCmd::Resize { path, size } => {
                let abs = self.dst_store.abs_path(path);
                let file = OpenOptions::new()
                    .write(true)
                    .open(&abs)
                    .map_err(|e| Error::io("open", &abs, e))?;
                file.set_len(*size).map_err(|e| Error::io("truncate", &abs, e))
            }

            PatchCmd::LocalTemp { temp, path, size } => {
                let abs = self.dst_store.resolve(path);
                let local = File::open(&abs).map_err(|e| Error::io("open", &abs, e))?;

                let dir = abs.parent().unwrap_or(Path::new("."));
                let name = abs
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let staged = tempfile::Builder::new()
                    .prefix(&format!("{name}."))
                    .tempfile_in(dir)
                    .map_err(|e| Error::io("create", dir, e))?;
                staged
                    .as_file()
                    .set_len(*size)
                    .map_err(|e| Error::io("truncate", staged.path(), e))?;

                temps.insert(
                    *temp,
                    StagedTemp {
                        local,
                        local_path: abs,
                        staged,
                        dst_abs: self.dst_store.abs_path(path),
                    },
                );
                Ok(())
            }

            PatchCmd::LocalTempCopy {
                temp,
                local_offset,
                temp_offset,
                length,
            } => {
                let staged = temps.get_mut(temp).ok_or_else(|| {
                    Error::PlanMalformed("local copy into a temp that was never staged".into())
                })?;
                staged
                    .local
                    .seek(SeekFrom::Start(*local_offset))
                    .map_err(|e| Error::io("seek", &staged.local_path, e))?;
                staged
                    .staged
                    .as_file_mut()
                    .seek(SeekFrom::Start(*temp_offset))
                    .map_err(|e| Error::io("seek", staged.staged.path(), e))?;
                let n = std::io::copy(
                    &mut (&mut staged.local).take(*length),
                    staged.staged.as_file_mut(),
                )
                .map_err(|e| Error::io("copy", &staged.local_path, e))?;
                if n != *length {
                    return Err(Error::short_read(&staged.local_path, *length, n));
                }
                Ok(())
            }

            PatchCmd::SrcTempCopy {
                temp,
                src_strong,
                src_offset,
                temp_offset,
                length,
            } => {
                let staged = temps.get_mut(temp).ok_or_else(|| {
                    Error::PlanMalformed("source copy into a temp that was never staged".into())
                })?;
                staged
                    .staged
                    .as_file_mut()
                    .seek(SeekFrom::Start(*temp_offset))
                    .map_err(|e| Error::io("seek", staged.staged.path(), e))?;
                self.src_store.read_into(
                    src_strong,
                    *src_offset,
                    *length,
                    staged.staged.as_file_mut(),
                )?;
                Ok(())
            }

            PatchCmd::ReplaceWithTemp { temp } => {
                let staged = temps.remove(temp).ok_or_else(|| {
                    Error::PlanMalformed("replace with a temp that was never staged".into())
                })?;
                drop(staged.local);
                let dst = staged.dst_abs;
                match staged.staged.persist(&dst) {
                    Ok(file) => {
                        drop(file);
                        Ok(())
                    }
                    Err(persist) => {
                        // Rename-over-existing unsupported here: make room,
                        // then retry.
                        fs::remove_file(&dst).map_err(|e| Error::io("remove", &dst, e))?;
                        persist
                            .file
                            .persist(&dst)
                            .map(drop)
                            .map_err(|e| Error::io("rename", &dst, e.error))
                    }
                }
            }
        }
    }

    /// Replay source mode bits onto every resolved destination path.
    /// Per-path failures are collected, never fatal.
    pub fn set_mode(&self) -> Vec<Error> {
        let mut errors = Vec::new();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt as _;

            self.src_store.repo().tree().walk(|tree, handle| {
                let (fs_ref, mode, descend) = match handle {
                    NodeHandle::Dir(id) => (FsRef::Dir(id), tree.dir(id).mode, true),
                    NodeHandle::File(id) => (FsRef::File(id), tree.file(id).mode, false),
                    NodeHandle::Block(..) => return false,
                };
                let abs = self.dst_store.resolve(&tree.rel_path(fs_ref));
                if let Err(e) = fs::set_permissions(&abs, fs::Permissions::from_mode(mode)) {
                    errors.push(Error::io("chmod", &abs, e));
                }
                descend
            });
        }

        errors
    }

    /// Remove every destination entry no source path claimed: files first,
    /// then directories deepest-first. An entry that is already gone (moved
    /// away by a `Transfer`) counts as removed.
    pub fn clean(&mut self) -> Vec<Error> {
        let mut errors = Vec::new();

        for rel in std::mem::take(&mut self.dst_file_unmatch) {
            let abs = self.dst_store.resolve(&rel);
            match fs::remove_file(&abs) {
                Ok(()) => debug!(path = %abs.display(), "cleaned leftover file"),
                Err(e) if already_gone(&e) => {}
                Err(e) => errors.push(Error::io("remove", &abs, e)),
            }
        }

        let mut dirs: Vec<PathBuf> = std::mem::take(&mut self.dst_dir_unmatch)
            .into_iter()
            .collect();
        dirs.sort_by_key(|p| std::cmp::Reverse(p.components().count()));
        for rel in dirs {
            let abs = self.dst_store.resolve(&rel);
            match fs::remove_dir(&abs) {
                Ok(()) => debug!(path = %abs.display(), "cleaned leftover directory"),
                Err(e) if already_gone(&e) => {}
                Err(e) => errors.push(Error::io("remove", &abs, e)),
            }
        }

        errors
    }
}

impl<S: BlockStore> fmt::Display for PatchPlan<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for cmd in &self.cmds {
            writeln!(f, "{cmd}")?;
        }
        Ok(())
    }
}

struct StagedTemp {
    local: File,
    local_path: PathBuf,
    staged: NamedTempFile,
    dst_abs: PathBuf,
}

/// Remove relpaths of an identical, transferred source subtree from the
/// leftover sets.
fn claim_subtree(
    tree: &Tree,
    start: NodeHandle,
    files: &mut BTreeSet<PathBuf>,
    dirs: &mut BTreeSet<PathBuf>,
) {
    tree.walk_from(start, |tree, handle| match handle {
        NodeHandle::File(id) => {
            files.remove(&tree.rel_path(FsRef::File(id)));
            false
        }
        NodeHandle::Dir(id) => {
            dirs.remove(&tree.rel_path(FsRef::Dir(id)));
            true
        }
        NodeHandle::Block(..) => false,
    });
}

/// Remove everything indexed under a conflicted destination path from the
/// leftover sets; the relocation takes the subtree away with it.
fn claim_dst_subtree(
    dst_store: &LocalStore,
    rel: &Path,
    files: &mut BTreeSet<PathBuf>,
    dirs: &mut BTreeSet<PathBuf>,
) {
    let tree = dst_store.repo().tree();
    let Some(found) = tree.lookup(rel) else {
        return;
    };
    let start = match found {
        FsRef::Dir(id) => NodeHandle::Dir(id),
        FsRef::File(id) => NodeHandle::File(id),
    };
    claim_subtree(tree, start, files, dirs);
}

/// Block-level staging commands for one destination file.
fn file_cmds(
    src: &FileNode,
    src_path: PathBuf,
    dst_abs: &Path,
    dst_size: u64,
    next_temp: &mut u32,
) -> Result<Vec<PatchCmd>> {
    let matched = match_file(src, dst_abs)?;
    let gaps: Vec<_> = matched
        .not_matched()
        .into_iter()
        .filter(|range| !range.is_empty())
        .collect();

    let in_place = matched
        .matches
        .iter()
        .all(|m| m.dst_offset == u64::from(m.src_position) * BLOCK_SIZE as u64);
    if src.size > 0 && gaps.is_empty() && in_place && dst_size > src.size {
        // Every needed byte is already where it belongs; only the tail goes.
        return Ok(vec![PatchCmd::Resize {
            path: src_path,
            size: src.size,
        }]);
    }

    let temp = TempId(*next_temp);
    *next_temp += 1;

    let mut cmds = vec![PatchCmd::LocalTemp {
        temp,
        path: src_path,
        size: src.size,
    }];
    for m in &matched.matches {
        cmds.push(PatchCmd::LocalTempCopy {
            temp,
            local_offset: m.dst_offset,
            temp_offset: u64::from(m.src_position) * BLOCK_SIZE as u64,
            length: src.block_len(m.src_position),
        });
    }
    for gap in gaps {
        cmds.push(PatchCmd::SrcTempCopy {
            temp,
            src_strong: src.strong,
            src_offset: gap.from,
            temp_offset: gap.from,
            length: gap.len(),
        });
    }
    cmds.push(PatchCmd::ReplaceWithTemp { temp });
    Ok(cmds)
}

fn entry_kind(meta: &fs::Metadata) -> EntryKind {
    if meta.is_dir() {
        EntryKind::Dir
    } else if meta.is_file() {
        EntryKind::File
    } else {
        EntryKind::Other
    }
}

fn mk_parent_dirs(abs: &Path) -> Result<()> {
    if let Some(parent) = abs.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::io("mkdir", parent, e))?;
    }
    Ok(())
}

fn already_gone(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::NotFound | std::io::ErrorKind::NotADirectory
    )
}

fn remove_any(path: &Path) -> Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if already_gone(&e) => return Ok(()),
        Err(e) => return Err(Error::io("stat", path, e)),
    };
    let removed = if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    removed.map_err(|e| Error::io("remove", path, e))
}

fn move_entry(from: &Path, to: &Path) -> Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(first) => {
            // An occupied target blocks directory renames; clear it and
            // retry once.
            if fs::symlink_metadata(to).is_ok() {
                remove_any(to)?;
                fs::rename(from, to).map_err(|e| Error::io("rename", from, e))
            } else {
                Err(Error::io("rename", from, first))
            }
        }
    }
}

fn copy_any(from: &Path, to: &Path) -> Result<()> {
    let meta = fs::metadata(from).map_err(|e| Error::io("stat", from, e))?;
    if let Ok(existing) = fs::symlink_metadata(to) {
        if existing.is_dir() != meta.is_dir() {
            remove_any(to)?;
        }
    }
    if meta.is_dir() {
        copy_dir(from, to)
    } else {
        fs::copy(from, to)
            .map(drop)
            .map_err(|e| Error::io("copy", from, e))
    }
}

fn copy_dir(from: &Path, to: &Path) -> Result<()> {
    // Snapshot the listing before creating `to`, which may live inside
    // `from`.
    let mut entries = Vec::new();
    for entry in fs::read_dir(from).map_err(|e| Error::io("read_dir", from, e))? {
        let entry = entry.map_err(|e| Error::io("read_dir", from, e))?;
        entries.push(entry.file_name());
    }

    fs::create_dir_all(to).map_err(|e| Error::io("mkdir", to, e))?;
    for name in entries {
        let src = from.join(&name);
        let dst = to.join(&name);
        let meta = fs::metadata(&src).map_err(|e| Error::io("stat", &src, e))?;
        if meta.is_dir() {
            copy_dir(&src, &dst)?;
        } else {
            fs::copy(&src, &dst)
                .map(drop)
                .map_err(|e| Error::io("copy", &src, e))?;
        }
    }
    let perms = fs::metadata(from)
        .map_err(|e| Error::io("stat", from, e))?
        .permissions();
    fs::set_permissions(to, perms).map_err(|e| Error::io("chmod", to, e))
}
