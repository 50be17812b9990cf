//! Block matching: find source content already present in a destination
//! file, rsync-style.

use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tracing::trace;

use crate::error::{Error, Result};
use crate::hash::{StrongHash, WeakChecksum};
use crate::node::{Block, FileNode, BLOCK_SIZE};

/// One source block located in the destination file, possibly at a shifted
/// offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMatch {
    /// Block position within the source file.
    pub src_position: u32,
    /// Byte offset of the matching data in the destination file.
    pub dst_offset: u64,
}

/// A half-open byte range `[from, to)` in source coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub from: u64,
    pub to: u64,
}

impl ByteRange {
    #[must_use]
    pub fn len(&self) -> u64 {
        self.to - self.from
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.from == self.to
    }
}

/// Which destination byte ranges supply which source block positions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMatch {
    /// Size of the source file in bytes.
    pub src_size: u64,
    /// Matches in destination scan order.
    pub matches: Vec<BlockMatch>,
}

impl FileMatch {
    /// The complement of the matched source ranges within `[0, src_size)`:
    /// everything that still has to come from the source store, as an
    /// ordered list of disjoint half-open ranges.
    ///
    /// An empty source yields the single no-op range `[0, 0)`.
    #[must_use]
    pub fn not_matched(&self) -> Vec<ByteRange> {
        if self.src_size == 0 {
            return vec![ByteRange { from: 0, to: 0 }];
        }

        let mut starts: Vec<u64> = self
            .matches
            .iter()
            .map(|m| u64::from(m.src_position) * BLOCK_SIZE as u64)
            .collect();
        starts.sort_unstable();

        let mut gaps = Vec::new();
        let mut cursor = 0u64;
        for start in starts {
            if start > cursor {
                gaps.push(ByteRange {
                    from: cursor,
                    to: start,
                });
            }
            cursor = (start + BLOCK_SIZE as u64).min(self.src_size);
        }
        if cursor < self.src_size {
            gaps.push(ByteRange {
                from: cursor,
                to: self.src_size,
            });
        }
        gaps
    }
}

/// Scan the file at `dst_path` for blocks of the already-indexed source
/// file `src`.
///
/// A rolling window of [`BLOCK_SIZE`] bytes slides over the destination one
/// byte at a time; wherever its weak checksum hits a source block, the
/// strong checksums decide. Matched regions are consumed whole (the window
/// jumps a full block and re-seeds), so no destination byte backs more than
/// one source block. The first candidate in block order wins a weak tie;
/// a source position that already matched is never matched again.
///
/// # Errors
/// Returns an error if the destination file cannot be read.
pub fn match_file(src: &FileNode, dst_path: &Path) -> Result<FileMatch> {
    let mut lookup: HashMap<u32, Vec<&Block>> = HashMap::new();
    for block in &src.blocks {
        lookup.entry(block.weak).or_default().push(block);
    }

    let file = File::open(dst_path).map_err(|e| Error::io("open", dst_path, e))?;
    let mut reader = BufReader::with_capacity(64 * 1024, file);

    let mut claimed = vec![false; src.blocks.len()];
    let mut matches = Vec::new();

    let mut window: VecDeque<u8> = VecDeque::with_capacity(BLOCK_SIZE);
    fill_window(&mut reader, &mut window).map_err(|e| Error::io("read", dst_path, e))?;

    let mut weak = WeakChecksum::new();
    seed(&mut weak, &window);
    let mut offset = 0u64;

    'scan: while !window.is_empty() {
        if let Some(candidates) = lookup.get(&weak.value()) {
            let strong = window_strong(&window);
            for candidate in candidates {
                let position = candidate.position as usize;
                if claimed[position] || candidate.strong != strong {
                    continue;
                }

                claimed[position] = true;
                matches.push(BlockMatch {
                    src_position: candidate.position,
                    dst_offset: offset,
                });
                trace!(position, offset, "block match");

                // Consume the matched region and re-seed over a fresh window.
                offset += window.len() as u64;
                window.clear();
                fill_window(&mut reader, &mut window)
                    .map_err(|e| Error::io("read", dst_path, e))?;
                weak.reset();
                seed(&mut weak, &window);
                continue 'scan;
            }
        }

        // A partial window (short destination or short tail) cannot roll;
        // it gets its one probe above and the scan ends.
        if window.len() < BLOCK_SIZE {
            break;
        }

        let mut incoming = [0u8; 1];
        let n = reader
            .read(&mut incoming)
            .map_err(|e| Error::io("read", dst_path, e))?;
        if n == 0 {
            break;
        }
        let Some(removed) = window.pop_front() else {
            break;
        };
        window.push_back(incoming[0]);
        weak.roll(removed, incoming[0]);
        offset += 1;
    }

    Ok(FileMatch {
        src_size: src.size,
        matches,
    })
}

fn fill_window(reader: &mut impl Read, window: &mut VecDeque<u8>) -> std::io::Result<()> {
    let mut chunk = [0u8; BLOCK_SIZE];
    while window.len() < BLOCK_SIZE {
        let want = BLOCK_SIZE - window.len();
        let n = reader.read(&mut chunk[..want])?;
        if n == 0 {
            break;
        }
        window.extend(&chunk[..n]);
    }
    Ok(())
}

fn seed(weak: &mut WeakChecksum, window: &VecDeque<u8>) {
    let (front, back) = window.as_slices();
    weak.update(front);
    weak.update(back);
}

fn window_strong(window: &VecDeque<u8>) -> StrongHash {
    let (front, back) = window.as_slices();
    let mut hasher = Sha1::new();
    hasher.update(front);
    hasher.update(back);
    StrongHash::from_digest(hasher)
}
