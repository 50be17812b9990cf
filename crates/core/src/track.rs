//! Tracking a destination tree: a worker that re-indexes it periodically
//! and serves index/patch requests over a channel.

use std::path::PathBuf;
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::Result;
use crate::hash::StrongHash;
use crate::patch::{ExecError, PatchPlan};
use crate::scan::IndexAll;
use crate::store::{BlockStore, LocalStore};

/// A request to a running tracker. Replies travel over the per-request
/// channel the caller provides.
pub enum TrackerRequest {
    /// Report the tracked tree's current index state.
    Index { resp: Sender<IndexSummary> },
    /// Apply a prepared patch plan (exec, then set-mode and clean), then
    /// re-index the tracked tree.
    PatchBlocks {
        plan: PatchPlan<LocalStore>,
        resp: Sender<std::result::Result<PatchSummary, ExecError>>,
    },
    /// Stop the tracker.
    Shutdown,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IndexSummary {
    pub root_strong: StrongHash,
    pub dirs: usize,
    pub files: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PatchSummary {
    pub commands: usize,
    pub mode_errors: usize,
    pub clean_errors: usize,
}

/// Index `path` and spawn a tracker thread for it. Between requests the
/// tracker re-indexes every `interval` and reports root checksum changes.
///
/// The tracker stops on [`TrackerRequest::Shutdown`] or when every sender is
/// dropped.
///
/// # Errors
/// Returns an error if the initial index fails.
pub fn start_tracker(
    path: impl Into<PathBuf>,
    requests: Receiver<TrackerRequest>,
    interval: Duration,
) -> Result<JoinHandle<()>> {
    let path = path.into();
    let mut store = LocalStore::open(&path)?;

    Ok(std::thread::spawn(move || {
        let mut last_strong = store.repo().tree().root_strong();
        info!(root = %path.display(), strong = %last_strong, "tracker started");

        loop {
            match requests.recv_timeout(interval) {
                Ok(TrackerRequest::Index { resp }) => {
                    let tree = store.repo().tree();
                    let _ = resp.send(IndexSummary {
                        root_strong: tree.root_strong(),
                        dirs: tree.dir_count(),
                        files: tree.file_count(),
                    });
                }
                Ok(TrackerRequest::PatchBlocks { mut plan, resp }) => {
                    let _ = resp.send(apply(&mut plan));
                    match store.reindex(&IndexAll) {
                        Ok(()) => last_strong = store.repo().tree().root_strong(),
                        Err(e) => warn!(error = %e, "re-index after patch failed"),
                    }
                }
                Ok(TrackerRequest::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => match store.reindex(&IndexAll) {
                    Ok(()) => {
                        let strong = store.repo().tree().root_strong();
                        if strong != last_strong {
                            info!(old = %last_strong, new = %strong, "tracked tree changed");
                            last_strong = strong;
                        }
                    }
                    Err(e) => warn!(error = %e, "periodic re-index failed"),
                },
            }
        }

        info!(root = %path.display(), "tracker stopped");
    }))
}

fn apply(plan: &mut PatchPlan<LocalStore>) -> std::result::Result<PatchSummary, ExecError> {
    plan.exec()?;
    let mode_errors = plan.set_mode();
    for e in &mode_errors {
        warn!(error = %e, "set-mode");
    }
    let clean_errors = plan.clean();
    for e in &clean_errors {
        warn!(error = %e, "clean");
    }
    Ok(PatchSummary {
        commands: plan.cmds.len(),
        mode_errors: mode_errors.len(),
        clean_errors: clean_errors.len(),
    })
}
