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

//! Background writer thread.
//!
//! ## Architecture
//!
//! The writer owns the active segment. Producers send [`WriterCommand`]s over
//! a crossbeam channel and block on a per-request reply channel; the writer
//! appends, applies the flush policy and tells the reader thread how far the
//! readable data now extends.
//!
//! ```text
//! ┌──────────────┐   WriterCommand   ┌──────────────┐   append   ┌──────────────┐
//! │   Producer   │ ───────────────►  │    Writer    │ ─────────► │  <id>.seg    │
//! │  (caller)    │ ◄─── reply ────── │ (bg thread)  │            └──────────────┘
//! └──────────────┘                   └──────┬───────┘
//!                                           │ Appended / Sealed / Allocated
//!                                           ▼
//!                                    ┌──────────────┐
//!                                    │    Reader    │
//!                                    └──────────────┘
//! ```
//!
//! ## Responsibilities
//!
//! - **Sequencing**: assign sequence numbers in file order
//! - **Rotation**: seal the active segment once the next frame would not fit
//! - **Flush management**: fsync per [`FlushMode`]
//! - **Backpressure**: park publishes in a FIFO while unacknowledged bytes
//!   exceed the configured ceiling

use std::{collections::VecDeque, sync::Arc, time::Instant};

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, Sender};
use tracing::{debug, error, info, warn};

use crate::{
    FlushMode, Result, Settings,
    error::{InternalSnafu, QueueError},
    frame::frame_disk_size,
    metrics::QueueMetrics,
    position::SegmentId,
    reader::ReaderCommand,
    segment::{SegmentStore, SegmentWriter},
    wait::{TICK_INTERVAL, Ticket, Wait},
};

/// A publish waiting for the writer.
pub(crate) struct PublishRequest {
    pub payload: Bytes,
    pub wait:    Wait,
    pub ticket:  Ticket,
    pub reply:   Sender<Result<u64>>,
}

impl PublishRequest {
    /// Claim the request and send `result`. Dropped silently if the caller
    /// gave up.
    fn answer(self, result: Result<u64>) {
        if self.ticket.claim() {
            let _ = self.reply.send(result);
        }
    }
}

pub(crate) enum WriterCommand {
    Publish(PublishRequest),
    /// Acknowledged bytes no longer count against the ceiling.
    Release { bytes: u64 },
    /// The reader found corruption in `segment`; stop appending to it.
    Rotate { segment: SegmentId },
    /// Fail parked publishes, flush and stop. The thread's return value
    /// carries the flush result.
    Shutdown,
}

/// State needed to start the writer, produced by recovery.
pub(crate) struct WriterState {
    pub active:         SegmentWriter,
    pub next_sequence:  u64,
    pub buffered_bytes: u64,
}

pub(crate) struct Writer {
    settings:        Arc<Settings>,
    store:           SegmentStore,
    rx:              Receiver<WriterCommand>,
    reader_tx:       Sender<ReaderCommand>,
    /// `None` after a seal until the next publish allocates a segment.
    active:          Option<SegmentWriter>,
    next_segment_id: SegmentId,
    next_sequence:   u64,
    /// Written but unacknowledged bytes.
    buffered:        u64,
    /// Publishes parked by backpressure, oldest first.
    waiting:         VecDeque<PublishRequest>,
    /// Bytes appended since the last fsync.
    pending_bytes:   u64,
    last_sync:       Instant,
    metrics:         QueueMetrics,
}

impl Writer {
    pub(crate) fn new(
        settings: Arc<Settings>,
        store: SegmentStore,
        state: WriterState,
        rx: Receiver<WriterCommand>,
        reader_tx: Sender<ReaderCommand>,
        metrics: QueueMetrics,
    ) -> Self {
        metrics.set_buffered(state.buffered_bytes);
        Self {
            settings,
            store,
            rx,
            reader_tx,
            next_segment_id: state.active.id() + 1,
            active: Some(state.active),
            next_sequence: state.next_sequence,
            buffered: state.buffered_bytes,
            waiting: VecDeque::new(),
            pending_bytes: 0,
            last_sync: Instant::now(),
            metrics,
        }
    }

    /// Process commands until shutdown. Returns the result of the final
    /// flush.
    pub(crate) fn run(mut self) -> Result<()> {
        info!(
            segment = self.active.as_ref().map(SegmentWriter::id),
            next_sequence = self.next_sequence,
            buffered = self.buffered,
            "Writer starting"
        );

        let ticker = channel::tick(TICK_INTERVAL);
        let result = loop {
            let cmd = crossbeam::select! {
                recv(self.rx) -> cmd => Some(cmd),
                recv(ticker) -> _ => None,
            };
            match cmd {
                None => self.on_tick(),
                Some(Ok(WriterCommand::Publish(req))) => self.handle_publish(req),
                Some(Ok(WriterCommand::Release { bytes })) => {
                    self.buffered = self.buffered.saturating_sub(bytes);
                    self.metrics.set_buffered(self.buffered);
                    self.drain_waiting();
                }
                Some(Ok(WriterCommand::Rotate { segment })) => self.handle_rotate(segment),
                Some(Ok(WriterCommand::Shutdown)) => break self.shutdown(),
                Some(Err(_)) => {
                    info!("Writer channel disconnected");
                    break self.shutdown();
                }
            }
        };

        for cmd in self.rx.try_iter() {
            match cmd {
                WriterCommand::Publish(req) => req.answer(Err(QueueError::QueueClosed)),
                WriterCommand::Release { .. }
                | WriterCommand::Rotate { .. }
                | WriterCommand::Shutdown => {}
            }
        }

        info!(next_sequence = self.next_sequence, "Writer stopped");
        result
    }

    fn handle_publish(&mut self, req: PublishRequest) {
        if req.ticket.is_abandoned() {
            return;
        }
        if self.waiting.is_empty() && self.admits(req.payload.len()) {
            self.execute(req);
            return;
        }

        if req.wait.is_non_blocking() {
            self.metrics.publish_rejected.inc();
            req.answer(Err(QueueError::QueueFull));
            return;
        }
        if let Some(err) = req.wait.expired(Instant::now()) {
            req.answer(Err(err));
            return;
        }

        debug!(
            buffered = self.buffered,
            waiting = self.waiting.len() + 1,
            "Publish waiting for acknowledgments"
        );
        self.waiting.push_back(req);
    }

    /// A frame fits under the ceiling, or nothing is buffered so it could
    /// never fit any better.
    fn admits(&self, payload_len: usize) -> bool {
        let max = self.settings.max_buffered_bytes;
        max == 0 || self.buffered == 0 || self.buffered + frame_disk_size(payload_len) <= max
    }

    fn drain_waiting(&mut self) {
        while let Some(front) = self.waiting.front() {
            if front.ticket.is_abandoned() {
                self.waiting.pop_front();
                continue;
            }
            if !self.admits(front.payload.len()) {
                break;
            }
            if let Some(req) = self.waiting.pop_front() {
                self.execute(req);
            }
        }
    }

    fn execute(&mut self, req: PublishRequest) {
        if !req.ticket.claim() {
            return;
        }
        let result = self.append(&req.payload);
        let _ = req.reply.send(result);
    }

    fn append(&mut self, payload: &[u8]) -> Result<u64> {
        let max_segment = self.settings.max_segment_bytes;
        if self
            .active
            .as_ref()
            .is_some_and(|active| !active.fits(payload.len(), max_segment))
        {
            self.seal_active()?;
        }

        self.ensure_active()?;
        let Some(active) = self.active.as_mut() else {
            return InternalSnafu {
                message: "no active segment after allocation",
            }
            .fail();
        };
        let segment = active.id();
        let good_end = active.size();
        let sequence = self.next_sequence;
        // Burned even if the append fails: the frame may have reached disk.
        self.next_sequence += 1;

        if let Err(e) = active.append_frame(sequence, payload) {
            self.abandon_active(good_end, &e);
            return Err(e);
        }
        let size = frame_disk_size(payload.len());
        self.pending_bytes += size;
        if let Err(e) = self.sync_per_mode() {
            self.abandon_active(good_end, &e);
            return Err(e);
        }

        let end = good_end + size;
        self.buffered += size;
        self.metrics.frames_written.inc();
        self.metrics.bytes_written.inc_by(size);
        self.metrics.set_buffered(self.buffered);
        let _ = self.reader_tx.send(ReaderCommand::Appended {
            segment,
            end,
            sequence,
        });

        Ok(sequence)
    }

    fn ensure_active(&mut self) -> Result<()> {
        if self.active.is_some() {
            return Ok(());
        }
        let id = self.next_segment_id;
        let writer = self.store.allocate(id)?;
        self.next_segment_id += 1;
        info!(segment = id, "Opened new segment");
        let _ = self.reader_tx.send(ReaderCommand::Allocated { segment: id });
        self.active = Some(writer);
        Ok(())
    }

    /// Sync and seal the active segment. The segment is sealed even when the
    /// sync fails; the error is returned.
    fn seal_active(&mut self) -> Result<()> {
        let Some(active) = self.active.take() else {
            return Ok(());
        };
        let synced = active.sync();
        self.pending_bytes = 0;
        self.last_sync = Instant::now();

        info!(
            segment = active.id(),
            size = active.size(),
            frames = active.frames(),
            "Sealed segment"
        );
        let _ = self.reader_tx.send(ReaderCommand::Sealed {
            segment: active.id(),
            end:     active.size(),
        });
        synced
    }

    /// Stop using the active segment after a failed append or sync. Data
    /// past `good_end` is never announced to the reader.
    fn abandon_active(&mut self, good_end: u64, cause: &QueueError) {
        let Some(active) = self.active.take() else {
            return;
        };
        warn!(
            segment = active.id(),
            end = good_end,
            error = %cause,
            "Write failed, sealing segment"
        );
        self.pending_bytes = 0;
        let _ = self.reader_tx.send(ReaderCommand::Sealed {
            segment: active.id(),
            end:     good_end,
        });
    }

    fn handle_rotate(&mut self, segment: SegmentId) {
        if self.active.as_ref().map(SegmentWriter::id) != Some(segment) {
            return;
        }
        warn!(segment, "Rotating away from corrupt segment");
        if let Err(e) = self.seal_active() {
            error!(segment, error = %e, "Failed to sync segment while sealing");
        }
    }

    fn sync_per_mode(&mut self) -> Result<()> {
        let due = match &self.settings.flush_mode {
            FlushMode::Sync => true,
            FlushMode::Batch { bytes, interval } => {
                self.pending_bytes >= *bytes || self.last_sync.elapsed() >= *interval
            }
            FlushMode::Async => false,
        };
        if due { self.sync_active() } else { Ok(()) }
    }

    fn sync_active(&mut self) -> Result<()> {
        if let Some(active) = &self.active {
            active.sync()?;
        }
        self.pending_bytes = 0;
        self.last_sync = Instant::now();
        Ok(())
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
            self.drain_waiting();
        }

        if let FlushMode::Batch { interval, .. } = &self.settings.flush_mode
            && self.pending_bytes > 0
            && self.last_sync.elapsed() >= *interval
            && let Err(e) = self.sync_active()
        {
            error!(error = %e, "Failed to flush active segment");
        }
    }

    fn shutdown(&mut self) -> Result<()> {
        for req in self.waiting.drain(..) {
            req.answer(Err(QueueError::QueueClosed));
        }

        let result = self.sync_active();
        if let Err(e) = &result {
            error!(error = %e, "Final flush failed");
        }

        let _ = self.reader_tx.send(ReaderCommand::WriterStopped);
        result
    }
}
