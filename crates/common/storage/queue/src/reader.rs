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

//! Background reader thread.
//!
//! The reader owns everything on the consuming side:
//! - batch assembly from the read position, never past the end announced by
//!   the writer and never across a segment boundary
//! - the FIFO list of consumers waiting for data
//! - acknowledgments, through the [`Tracker`]
//! - checkpoint persistence on the flush interval and whenever the
//!   acknowledgment position enters a new segment
//! - garbage collection after each persist
//!
//! A corrupt frame ends the readable data of its segment. If the segment is
//! still being written the writer is asked to rotate; once it is sealed the
//! reader skips the rest of it.

use std::{collections::VecDeque, sync::Arc, time::Instant};

use crossbeam::channel::{self, Receiver, Sender};
use tracing::{debug, error, info, warn};

use crate::{
    Result, Settings,
    error::QueueError,
    frame::Entry,
    gc::collect_garbage,
    metrics::QueueMetrics,
    position::{Position, SegmentId},
    queue::QueueState,
    segment::{SEGMENT_HEADER_SIZE, SegmentInfo, SegmentReader, SegmentStore, SegmentTable},
    tracker::{AckOutcome, Tracker},
    wait::{TICK_INTERVAL, Ticket, Wait},
    writer::WriterCommand,
};

/// Frames handed to one consumer under one batch id.
#[derive(Debug)]
pub(crate) struct Delivery {
    pub batch_id: u64,
    pub entries:  Vec<Entry>,
}

/// A consumer waiting for a batch.
pub(crate) struct GetRequest {
    /// 0 means the configured default batch size.
    pub max_items: usize,
    pub wait:      Wait,
    pub ticket:    Ticket,
    pub reply:     Sender<Result<Delivery>>,
}

impl GetRequest {
    fn answer(self, result: Result<Delivery>) {
        if self.ticket.claim() {
            let _ = self.reply.send(result);
        }
    }
}

pub(crate) enum ReaderCommand {
    Get(GetRequest),
    Ack {
        batch_id: u64,
        reply:    Sender<Result<()>>,
    },
    Positions {
        reply: Sender<QueueState>,
    },
    /// The writer created `segment` and will append to it next.
    Allocated { segment: SegmentId },
    /// A frame with `sequence` was written; data now ends at `end`.
    Appended {
        segment:  SegmentId,
        end:      u64,
        sequence: u64,
    },
    /// Nothing will be appended to `segment` past `end` any more.
    Sealed { segment: SegmentId, end: u64 },
    WriterStopped,
    /// Serve what can be served, fail the remaining waiters, persist a final
    /// checkpoint and stop. The thread's return value carries the persist
    /// result.
    Close,
}

pub(crate) struct Reader {
    settings:       Arc<Settings>,
    store:          SegmentStore,
    rx:             Receiver<ReaderCommand>,
    writer_tx:      Sender<WriterCommand>,
    segments:       SegmentTable,
    tracker:        Tracker,
    /// Open cursor, valid only while it sits exactly at the read position.
    cursor:         Option<SegmentReader>,
    waiting:        VecDeque<GetRequest>,
    last_persist:   Instant,
    writer_stopped: bool,
    metrics:        QueueMetrics,
}

impl Reader {
    /// `segments` must already contain the writer's active segment.
    pub(crate) fn new(
        settings: Arc<Settings>,
        store: SegmentStore,
        segments: SegmentTable,
        tracker: Tracker,
        rx: Receiver<ReaderCommand>,
        writer_tx: Sender<WriterCommand>,
        metrics: QueueMetrics,
    ) -> Self {
        let mut reader = Self {
            settings,
            store,
            rx,
            writer_tx,
            segments,
            tracker,
            cursor: None,
            waiting: VecDeque::new(),
            last_persist: Instant::now(),
            writer_stopped: false,
            metrics,
        };
        reader.tracker.normalize(&reader.segments);
        reader
    }

    /// Persist the checkpoint, then delete what it made unreachable.
    pub(crate) fn checkpoint(&mut self) -> Result<()> {
        self.tracker.normalize(&self.segments);
        let result = self.tracker.persist();
        self.last_persist = Instant::now();
        match &result {
            Ok(()) => self.metrics.checkpoint_persists.inc(),
            Err(e) => error!(error = %e, "Failed to persist checkpoint"),
        }
        collect_garbage(
            &self.store,
            &mut self.segments,
            self.tracker.durable_ack_segment(),
            &self.metrics,
        );
        result
    }

    pub(crate) fn run(mut self) -> Result<()> {
        info!(
            read = %self.tracker.read_pos(),
            ack = %self.tracker.ack_pos(),
            segments = self.segments.len(),
            "Reader starting"
        );

        let ticker = channel::tick(TICK_INTERVAL);
        let result = loop {
            let cmd = crossbeam::select! {
                recv(self.rx) -> cmd => Some(cmd),
                recv(ticker) -> _ => None,
            };
            match cmd {
                None => self.on_tick(),
                Some(Ok(ReaderCommand::Close)) => break self.close(),
                Some(Ok(cmd)) => self.handle(cmd),
                Some(Err(_)) => {
                    info!("Reader channel disconnected");
                    break self.close();
                }
            }
        };

        for cmd in self.rx.try_iter() {
            match cmd {
                ReaderCommand::Get(req) => req.answer(Err(QueueError::QueueClosed)),
                ReaderCommand::Ack { reply, .. } => {
                    let _ = reply.send(Err(QueueError::QueueClosed));
                }
                _ => {}
            }
        }

        info!(ack = %self.tracker.ack_pos(), "Reader stopped");
        result
    }

    fn handle(&mut self, cmd: ReaderCommand) {
        match cmd {
            ReaderCommand::Get(req) => self.handle_get(req),
            ReaderCommand::Ack { batch_id, reply } => {
                let result = self.acknowledge(batch_id);
                let _ = reply.send(result);
            }
            ReaderCommand::Positions { reply } => {
                let _ = reply.send(self.state());
            }
            ReaderCommand::Allocated { segment } => {
                self.segments.push(SegmentInfo::active(segment));
                let write = self.tracker.write_pos();
                self.tracker
                    .set_write_pos(write.max(Position::segment_start(segment, write.sequence)));
            }
            ReaderCommand::Appended {
                segment,
                end,
                sequence,
            } => {
                if let Some(info) = self.segments.get_mut(segment) {
                    info.end = end;
                }
                self.tracker
                    .set_write_pos(Position::new(segment, end, sequence + 1));
                self.serve_waiting();
            }
            ReaderCommand::Sealed { segment, end } => {
                if let Some(info) = self.segments.get_mut(segment) {
                    info.end = end;
                    info.sealed = true;
                }
                self.tracker.normalize(&self.segments);
                self.serve_waiting();
                collect_garbage(
                    &self.store,
                    &mut self.segments,
                    self.tracker.durable_ack_segment(),
                    &self.metrics,
                );
            }
            ReaderCommand::WriterStopped => {
                debug!("Writer stopped, no more data will arrive");
                self.writer_stopped = true;
            }
            ReaderCommand::Close => {}
        }
    }

    fn handle_get(&mut self, req: GetRequest) {
        if req.ticket.is_abandoned() {
            return;
        }
        self.waiting.push_back(req);
        self.serve_waiting();

        // Only a request that just arrived can be non-blocking and still wait.
        if self
            .waiting
            .back()
            .is_some_and(|req| req.wait.is_non_blocking())
            && let Some(req) = self.waiting.pop_back()
        {
            req.answer(Err(QueueError::Timeout));
        }
    }

    /// Hand batches to waiting consumers, oldest first, while data lasts.
    fn serve_waiting(&mut self) {
        while let Some(front) = self.waiting.front() {
            if front.ticket.is_abandoned() {
                self.waiting.pop_front();
                continue;
            }
            if !self.has_data() {
                break;
            }
            let Some(req) = self.waiting.pop_front() else {
                break;
            };
            // Claimed before a batch is issued: an issued batch must reach
            // its consumer or the acknowledgment order would stall.
            if !req.ticket.claim() {
                continue;
            }

            let max = self.batch_limit(req.max_items);
            match self.next_batch(max) {
                Ok(Some(delivery)) => {
                    let _ = req.reply.send(Ok(delivery));
                }
                Ok(None) => {
                    self.waiting.push_front(req);
                    break;
                }
                Err(e) => {
                    let _ = req.reply.send(Err(e));
                }
            }
        }
    }

    fn batch_limit(&self, max_items: usize) -> usize {
        if max_items == 0 {
            self.settings.default_batch_size
        } else {
            max_items
        }
    }

    /// Whether a batch could be assembled or unreadable data skipped.
    fn has_data(&mut self) -> bool {
        self.tracker.normalize(&self.segments);
        let pos = self.tracker.read_pos();
        self.segments.get(pos.segment).is_some_and(|info| {
            pos.offset < readable_end(info) || (info.sealed && info.unreadable_from.is_some())
        })
    }

    /// Assemble the next batch of at most `max` frames from one segment.
    ///
    /// `Ok(None)` when nothing is readable right now. An I/O error is only
    /// returned if no frame was read; the read position does not move.
    fn next_batch(&mut self, max: usize) -> Result<Option<Delivery>> {
        loop {
            self.tracker.normalize(&self.segments);
            let start = self.tracker.read_pos();
            let Some(info) = self.segments.get(start.segment).cloned() else {
                return Ok(None);
            };
            let limit = readable_end(&info);

            if start.offset >= limit {
                if info.sealed && info.unreadable_from.is_some() {
                    self.skip_unreadable(&info, start);
                    continue;
                }
                return Ok(None);
            }

            let mut cursor = match self.cursor.take() {
                Some(cursor) if cursor.id() == start.segment && cursor.offset() == start.offset => {
                    cursor
                }
                _ => match self.store.open_for_read(start.segment, start.offset) {
                    Ok(cursor) => cursor,
                    Err(QueueError::CorruptFrame { reason, .. }) => {
                        self.mark_unreadable(info.id, start.offset, &reason);
                        continue;
                    }
                    Err(e) => return Err(e),
                },
            };

            let mut entries = Vec::with_capacity(max.min(1024));
            let mut end = start;
            let mut failure = None;
            while entries.len() < max {
                let frame_start = cursor.offset();
                match cursor.read_frame(limit) {
                    Ok(Some(entry)) if entry.sequence < end.sequence => {
                        self.mark_unreadable(
                            info.id,
                            frame_start,
                            &format!(
                                "sequence {} follows {}",
                                entry.sequence,
                                end.sequence.saturating_sub(1)
                            ),
                        );
                        break;
                    }
                    Ok(Some(entry)) => {
                        end = Position::new(info.id, cursor.offset(), entry.sequence + 1);
                        entries.push(entry);
                    }
                    Ok(None) => break,
                    Err(QueueError::CorruptFrame { offset, reason, .. }) => {
                        self.mark_unreadable(info.id, offset, &reason);
                        break;
                    }
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }

            if entries.is_empty() {
                if let Some(e) = failure {
                    return Err(e);
                }
                // Corruption right at the read position.
                continue;
            }
            if failure.is_none() && cursor.offset() == end.offset {
                self.cursor = Some(cursor);
            }

            let bytes = end.offset - start.offset;
            let batch_id = self.tracker.issue(end, bytes);
            self.tracker.normalize(&self.segments);
            self.metrics.frames_delivered.inc_by(entries.len() as u64);
            debug!(
                batch_id,
                frames = entries.len(),
                from = %start,
                to = %end,
                "Batch delivered"
            );
            return Ok(Some(Delivery { batch_id, entries }));
        }
    }

    fn mark_unreadable(&mut self, segment: SegmentId, offset: u64, reason: &str) {
        self.cursor = None;
        let Some(info) = self.segments.get_mut(segment) else {
            return;
        };
        if info.unreadable_from.is_some_and(|from| from <= offset) {
            return;
        }
        info.unreadable_from = Some(offset);
        warn!(segment, offset, reason, "Corrupt frame, rest of segment is unreadable");
        self.metrics.corrupt_frames.inc();
        if !info.sealed {
            let _ = self.writer_tx.send(WriterCommand::Rotate { segment });
        }
    }

    /// Move the read position past the unreadable tail of a sealed segment.
    fn skip_unreadable(&mut self, info: &SegmentInfo, from: Position) {
        let to = Position::segment_start(info.id + 1, from.sequence);
        let bytes = info.end.saturating_sub(from.offset);
        warn!(segment = info.id, offset = from.offset, bytes, "Skipping unreadable data");

        self.cursor = None;
        let released = self.tracker.skip(to, bytes);
        if released > 0 {
            let _ = self.writer_tx.send(WriterCommand::Release { bytes: released });
        }
        self.persist_if_crossed();
    }

    fn acknowledge(&mut self, batch_id: u64) -> Result<()> {
        match self.tracker.acknowledge(batch_id)? {
            AckOutcome::Duplicate => {
                debug!(batch_id, "Duplicate acknowledgment ignored");
            }
            AckOutcome::Advanced { released } => {
                self.metrics.batches_acked.inc();
                if released > 0 {
                    let _ = self.writer_tx.send(WriterCommand::Release { bytes: released });
                }
                self.persist_if_crossed();
            }
        }
        Ok(())
    }

    /// Persist as soon as the acknowledgment enters a new segment so the
    /// segments behind it can go. A failed persist is logged and retried on
    /// the flush interval.
    fn persist_if_crossed(&mut self) {
        self.tracker.normalize(&self.segments);
        if self.tracker.ack_crossed_segment() {
            let _ = self.checkpoint();
        }
    }

    fn on_tick(&mut self) {
        if !self.waiting.is_empty() {
            let now = Instant::now();
            let mut kept = VecDeque::with_capacity(self.waiting.len());
            for req in self.waiting.drain(..) {
                if req.ticket.is_abandoned() {
                    continue;
                }
                match req.wait.expired(now) {
                    Some(err) => req.answer(Err(err)),
                    None => kept.push_back(req),
                }
            }
            self.waiting = kept;
            self.serve_waiting();
        }

        if self.tracker.is_dirty() && self.last_persist.elapsed() >= self.settings.flush_interval {
            let _ = self.checkpoint();
        }
    }

    fn close(&mut self) -> Result<()> {
        self.serve_waiting();
        if !self.waiting.is_empty() {
            debug!(
                waiting = self.waiting.len(),
                writer_stopped = self.writer_stopped,
                "Failing consumers waiting at close"
            );
        }
        for req in self.waiting.drain(..) {
            req.answer(Err(QueueError::QueueClosed));
        }
        self.checkpoint()
    }

    fn state(&self) -> QueueState {
        let ack = self.tracker.ack_pos();
        let unacknowledged_bytes = self
            .segments
            .iter()
            .filter(|info| info.id >= ack.segment)
            .map(|info| {
                let from = if info.id == ack.segment {
                    ack.offset
                } else {
                    SEGMENT_HEADER_SIZE
                };
                info.end.saturating_sub(from)
            })
            .sum();

        QueueState {
            write_pos: self.tracker.write_pos(),
            read_pos: self.tracker.read_pos(),
            ack_pos: ack,
            segments: self.segments.len(),
            outstanding_batches: self.tracker.outstanding(),
            unacknowledged_bytes,
        }
    }
}

/// End of the data a reader may consume in this segment.
fn readable_end(info: &SegmentInfo) -> u64 {
    info.unreadable_from
        .map_or(info.end, |from| from.min(info.end))
}
