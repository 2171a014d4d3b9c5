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

//! Position bookkeeping for the reader thread.
//!
//! Tracks the three positions, the batches handed out but not yet
//! acknowledged, and the last checkpoint made durable. Acknowledgments are
//! strictly in delivery order: a batch can only be acknowledged once every
//! batch delivered before it has been.

use std::collections::VecDeque;

use crate::{
    Result,
    checkpoint::{Checkpoint, CheckpointFile},
    error::ProtocolSnafu,
    position::{Position, SegmentId},
    segment::SegmentTable,
};

/// A delivered, unacknowledged batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct IssuedBatch {
    id:    u64,
    /// Position just past the batch's last frame.
    end:   Position,
    /// Disk bytes covered by the batch, released on acknowledgment.
    bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AckOutcome {
    /// Carries the buffered bytes freed by this acknowledgment.
    Advanced { released: u64 },
    /// The batch was acknowledged before. Nothing changed.
    Duplicate,
}

pub(crate) struct Tracker {
    write_pos:     Position,
    read_pos:      Position,
    ack_pos:       Position,
    outstanding:   VecDeque<IssuedBatch>,
    next_batch_id: u64,
    file:          CheckpointFile,
    durable:       Checkpoint,
}

impl Tracker {
    /// `durable` must be the checkpoint currently on disk.
    pub(crate) fn new(file: CheckpointFile, durable: Checkpoint) -> Self {
        Self {
            write_pos: durable.write_pos,
            read_pos: durable.read_pos,
            ack_pos: durable.ack_pos,
            outstanding: VecDeque::new(),
            next_batch_id: 0,
            file,
            durable,
        }
    }

    #[must_use]
    pub(crate) const fn write_pos(&self) -> Position { self.write_pos }

    #[must_use]
    pub(crate) const fn read_pos(&self) -> Position { self.read_pos }

    #[must_use]
    pub(crate) const fn ack_pos(&self) -> Position { self.ack_pos }

    #[must_use]
    pub(crate) fn outstanding(&self) -> usize { self.outstanding.len() }

    /// Segment of the acknowledgment position last made durable. Segments
    /// before it may be deleted.
    #[must_use]
    pub(crate) const fn durable_ack_segment(&self) -> SegmentId { self.durable.ack_pos.segment }

    pub(crate) fn set_write_pos(&mut self, pos: Position) { self.write_pos = pos; }

    /// Record a delivered batch ending at `end` and return its id.
    pub(crate) fn issue(&mut self, end: Position, bytes: u64) -> u64 {
        let id = self.next_batch_id;
        self.next_batch_id += 1;
        self.read_pos = end;
        self.outstanding.push_back(IssuedBatch { id, end, bytes });
        id
    }

    /// Move the read position past unreadable data.
    ///
    /// The skipped bytes are released together with the last outstanding
    /// batch, or right away when nothing is outstanding. Returns the bytes
    /// released now.
    pub(crate) fn skip(&mut self, to: Position, bytes: u64) -> u64 {
        self.read_pos = to;
        match self.outstanding.back_mut() {
            Some(last) => {
                last.end = to;
                last.bytes += bytes;
                0
            }
            None => {
                self.ack_pos = to;
                bytes
            }
        }
    }

    pub(crate) fn acknowledge(&mut self, batch_id: u64) -> Result<AckOutcome> {
        let Some(front) = self.outstanding.front().copied() else {
            if batch_id < self.next_batch_id {
                return Ok(AckOutcome::Duplicate);
            }
            return ProtocolSnafu {
                reason: format!("unknown batch {batch_id}"),
            }
            .fail();
        };

        if batch_id < front.id {
            return Ok(AckOutcome::Duplicate);
        }
        if batch_id >= self.next_batch_id {
            return ProtocolSnafu {
                reason: format!("unknown batch {batch_id}"),
            }
            .fail();
        }
        if batch_id > front.id {
            return ProtocolSnafu {
                reason: format!(
                    "batch {batch_id} acknowledged before batch {}",
                    front.id
                ),
            }
            .fail();
        }

        self.outstanding.pop_front();
        self.ack_pos = front.end;
        Ok(AckOutcome::Advanced {
            released: front.bytes,
        })
    }

    /// The acknowledgment position moved past the segment of the durable
    /// checkpoint, so persisting now lets segment files be deleted.
    #[must_use]
    pub(crate) const fn ack_crossed_segment(&self) -> bool {
        self.ack_pos.segment > self.durable.ack_pos.segment
    }

    /// Moves every position sitting at the end of a sealed segment to the
    /// start of the next one.
    pub(crate) fn normalize(&mut self, segments: &SegmentTable) {
        self.write_pos = normalize(self.write_pos, segments);
        self.read_pos = normalize(self.read_pos, segments);
        self.ack_pos = normalize(self.ack_pos, segments);
        for batch in &mut self.outstanding {
            batch.end = normalize(batch.end, segments);
        }
    }

    #[must_use]
    pub(crate) fn current(&self) -> Checkpoint {
        Checkpoint {
            write_pos: self.write_pos,
            read_pos:  self.read_pos,
            ack_pos:   self.ack_pos,
        }
    }

    /// Positions changed since the last persist.
    #[must_use]
    pub(crate) fn is_dirty(&self) -> bool { self.current() != self.durable }

    pub(crate) fn persist(&mut self) -> Result<()> {
        let checkpoint = self.current();
        debug_assert!(checkpoint.is_consistent(), "{checkpoint:?}");
        self.file.persist(&checkpoint)?;
        self.durable = checkpoint;
        Ok(())
    }
}

/// Canonical form of `pos`: the end of a sealed segment is the start of the
/// next segment.
pub(crate) fn normalize(mut pos: Position, segments: &SegmentTable) -> Position {
    while let Some(info) = segments.get(pos.segment) {
        if !info.sealed || pos.offset < info.end {
            break;
        }
        pos = Position::segment_start(pos.segment + 1, pos.sequence);
    }
    pos
}
