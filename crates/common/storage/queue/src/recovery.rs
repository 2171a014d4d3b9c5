// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Crash recovery for the persistent queue.
//!
//! Recovery starts from the checkpoint and rebuilds the true state from the
//! segment files:
//! 1. Validate the checkpoint against the segments present on disk
//! 2. Delete segments older than the acknowledgment position (an interrupted
//!    cleanup)
//! 3. Scan every frame from the acknowledgment position to the end of data
//! 4. Resume reading at the acknowledgment position so unacknowledged frames
//!    are delivered again
//!
//! A directory with neither a checkpoint nor segments is a fresh queue. So is
//! one whose only segments hold no frame and no checkpoint: a first open that
//! stopped before its checkpoint became durable.

use snafu::ensure;
use tracing::{info, warn};

use crate::{
    Result,
    checkpoint::{Checkpoint, CheckpointFile},
    error::CorruptStateSnafu,
    position::{Position, SegmentId},
    segment::{SEGMENT_HEADER_SIZE, SegmentInfo, SegmentStore, SegmentTable},
};

/// State handed to the worker threads after a successful recovery.
#[derive(Debug)]
pub(crate) struct RecoveryState {
    /// Recovered positions. `read_pos` equals `ack_pos`; `write_pos` is the
    /// start of the segment the writer will allocate next.
    pub checkpoint:      Checkpoint,
    /// Every live segment, all sealed.
    pub segments:        SegmentTable,
    pub next_sequence:   u64,
    pub next_segment_id: SegmentId,
    /// Bytes of unacknowledged frames.
    pub buffered_bytes:  u64,
    pub fresh:           bool,
}

impl RecoveryState {
    fn fresh() -> Self {
        Self {
            checkpoint:      Checkpoint::default(),
            segments:        SegmentTable::default(),
            next_sequence:   0,
            next_segment_id: 0,
            buffered_bytes:  0,
            fresh:           true,
        }
    }
}

/// Rebuild queue state from the checkpoint and segment files.
pub(crate) fn recover(store: &SegmentStore, checkpoint_file: &CheckpointFile) -> Result<RecoveryState> {
    info!(path = ?store.dir(), "Starting queue recovery");

    let ids = store.list_existing()?;
    let checkpoint = match checkpoint_file.load()? {
        Some(checkpoint) => checkpoint,
        None if ids.is_empty() => {
            info!("No checkpoint or segments found, starting fresh");
            return Ok(RecoveryState::fresh());
        }
        None => return discard_unused_segments(store, &ids),
    };

    ensure!(
        checkpoint.is_consistent(),
        CorruptStateSnafu {
            reason: format!(
                "checkpoint positions out of order: ack {} read {} write {}",
                checkpoint.ack_pos, checkpoint.read_pos, checkpoint.write_pos
            ),
        }
    );

    let ack = checkpoint.ack_pos;
    let write = checkpoint.write_pos;

    let (stale, live): (Vec<_>, Vec<_>) = ids.into_iter().partition(|&id| id < ack.segment);
    for id in stale {
        warn!(segment = id, "Removing fully acknowledged segment left behind");
        store.delete(id)?;
    }

    let mut expected = ack.segment;
    for &id in &live {
        ensure!(
            id == expected,
            CorruptStateSnafu {
                reason: format!("segment {expected} is missing"),
            }
        );
        expected += 1;
    }
    // The write segment may not exist yet if nothing was appended to it.
    ensure!(
        expected > write.segment || (expected == write.segment && write.is_segment_start()),
        CorruptStateSnafu {
            reason: format!("segment {expected} is missing, checkpoint writes at {write}"),
        }
    );

    let mut segments = SegmentTable::default();
    let mut buffered_bytes = 0u64;
    let mut last_sequence: Option<u64> = None;

    for &id in &live {
        let from = if id == ack.segment {
            ack.offset
        } else {
            SEGMENT_HEADER_SIZE
        };
        let scan = store.scan(id, from)?;

        if let Some(reason) = &scan.corruption {
            warn!(
                segment = id,
                offset = scan.end,
                reason = %reason,
                "Segment data ends early, ignoring the rest of the file"
            );
        }
        if let (Some(first), Some(last)) = (scan.first_sequence, last_sequence)
            && first <= last
        {
            warn!(segment = id, first, previous = last, "Sequence numbers overlap across segments");
        }

        buffered_bytes += scan.bytes();
        last_sequence = scan.last_sequence.max(last_sequence);
        segments.push(SegmentInfo::sealed(id, scan.end));
    }

    let next_sequence = last_sequence.map_or(write.sequence, |last| write.sequence.max(last + 1));
    let next_segment_id = expected.max(write.segment);

    let recovered = Checkpoint {
        write_pos: Position::segment_start(next_segment_id, next_sequence),
        read_pos:  ack,
        ack_pos:   ack,
    };

    info!(
        segments = segments.len(),
        next_sequence,
        next_segment_id,
        buffered_bytes,
        ack = %ack,
        "Recovery complete"
    );

    Ok(RecoveryState {
        checkpoint: recovered,
        segments,
        next_sequence,
        next_segment_id,
        buffered_bytes,
        fresh: false,
    })
}

/// Without a checkpoint, segments that never received a frame are dropped and
/// the queue starts fresh. Any frame byte makes the directory unrecoverable.
fn discard_unused_segments(store: &SegmentStore, ids: &[SegmentId]) -> Result<RecoveryState> {
    for &id in ids {
        let len = store.file_len(id)?;
        ensure!(
            len <= SEGMENT_HEADER_SIZE,
            CorruptStateSnafu {
                reason: format!(
                    "{} segment file(s) present but no checkpoint, segment {id} holds {len} bytes",
                    ids.len()
                ),
            }
        );
    }
    for &id in ids {
        warn!(segment = id, "Removing empty segment without checkpoint");
        store.delete(id)?;
    }
    Ok(RecoveryState::fresh())
}
