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

//! Queue handle and lifecycle management.
//!
//! The [`Queue`] is the entry point of the library. Opening it:
//! - recovers positions and segments from an existing directory
//! - allocates the segment the writer appends to
//! - persists the recovered checkpoint
//! - spawns the `telespool-writer` and `telespool-reader` threads
//!
//! ## Usage
//!
//! ```ignore
//! let queue = QueueBuilder::new("/var/lib/telespool").open()?;
//!
//! let producer = queue.producer();
//! producer.publish(&b"event"[..])?;
//!
//! let consumer = queue.consumer();
//! let batch = consumer.get(64)?;
//! for entry in batch.entries() {
//!     println!("{} {:?}", entry.sequence, entry.payload);
//! }
//! batch.ack()?;
//!
//! queue.close()?;
//! ```

use std::{
    ops::RangeInclusive,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
};

use bytes::Bytes;
use crossbeam::channel::{self, Sender};
use parking_lot::Mutex;
use snafu::ensure;
use tracing::{error, info};

use crate::{
    Result, Settings,
    checkpoint::CheckpointFile,
    error::{InternalSnafu, PayloadTooLargeSnafu, QueueError},
    frame::{Entry, MAX_PAYLOAD_SIZE},
    metrics::QueueMetrics,
    position::Position,
    reader::{Delivery, GetRequest, Reader, ReaderCommand},
    recovery::recover,
    segment::{SegmentInfo, SegmentStore},
    tracker::Tracker,
    wait::{Ticket, Wait, await_reply},
    writer::{PublishRequest, Writer, WriterCommand, WriterState},
};

/// Snapshot of the in-memory positions, taken by the reader thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueState {
    pub write_pos:            Position,
    pub read_pos:             Position,
    pub ack_pos:              Position,
    /// Live segment files, the active one included.
    pub segments:             usize,
    pub outstanding_batches:  usize,
    /// Disk bytes of frames from `ack_pos` to the end of written data.
    pub unacknowledged_bytes: u64,
}

/// Channels into the worker threads, shared by every handle.
struct Shared {
    writer_tx: Sender<WriterCommand>,
    reader_tx: Sender<ReaderCommand>,
    closed:    AtomicBool,
}

impl Shared {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::QueueClosed);
        }
        Ok(())
    }
}

struct Workers {
    writer: JoinHandle<Result<()>>,
    reader: JoinHandle<Result<()>>,
}

/// A disk-backed FIFO queue of opaque payloads with at-least-once delivery.
///
/// Any number of [`Producer`]s and [`Consumer`]s may be used from any thread.
/// Frames are delivered in sequence order, in batches that must be
/// acknowledged in delivery order. Unacknowledged frames are delivered again
/// after a restart.
pub struct Queue {
    settings: Arc<Settings>,
    shared:   Arc<Shared>,
    /// `None` once closed.
    workers:  Mutex<Option<Workers>>,
}

impl Queue {
    /// Open or create the queue at `settings.path`.
    ///
    /// # Errors
    ///
    /// `InvalidSettings` if the settings are rejected, `CorruptState` if the
    /// checkpoint and segment files disagree, `Io` on filesystem failures.
    pub fn open(settings: Settings) -> Result<Self> {
        settings.validate()?;
        let settings = Arc::new(settings);

        let store = SegmentStore::open(&settings.path)?;
        let checkpoint_file = CheckpointFile::new(store.dir());
        let recovered = recover(&store, &checkpoint_file)?;

        // The checkpoint must name the active segment before its file exists,
        // or a crash in between leaves a segment no checkpoint accounts for.
        checkpoint_file.persist(&recovered.checkpoint)?;
        let active = store.allocate(recovered.next_segment_id)?;
        let mut segments = recovered.segments;
        segments.push(SegmentInfo::active(active.id()));

        let metrics = QueueMetrics::new(&settings.path.display().to_string());
        let (writer_tx, writer_rx) = channel::unbounded();
        let (reader_tx, reader_rx) = channel::unbounded();

        let mut reader = Reader::new(
            settings.clone(),
            store.clone(),
            segments,
            Tracker::new(checkpoint_file, recovered.checkpoint),
            reader_rx,
            writer_tx.clone(),
            metrics.clone(),
        );
        // Normalizes the positions and collects segments acknowledged in full.
        reader.checkpoint()?;

        let writer = Writer::new(
            settings.clone(),
            store,
            WriterState {
                active,
                next_sequence: recovered.next_sequence,
                buffered_bytes: recovered.buffered_bytes,
            },
            writer_rx,
            reader_tx.clone(),
            metrics,
        );

        let writer = spawn("telespool-writer", move || writer.run())?;
        let reader = match spawn("telespool-reader", move || reader.run()) {
            Ok(handle) => handle,
            Err(e) => {
                let _ = writer_tx.send(WriterCommand::Shutdown);
                let _ = writer.join();
                return Err(e);
            }
        };

        info!(
            path = ?settings.path,
            fresh = recovered.fresh,
            next_sequence = recovered.next_sequence,
            buffered = recovered.buffered_bytes,
            "Queue opened"
        );

        Ok(Self {
            settings,
            shared: Arc::new(Shared {
                writer_tx,
                reader_tx,
                closed: AtomicBool::new(false),
            }),
            workers: Mutex::new(Some(Workers { writer, reader })),
        })
    }

    /// A cheap, cloneable handle for publishing.
    #[must_use]
    pub fn producer(&self) -> Producer {
        Producer {
            shared: self.shared.clone(),
        }
    }

    /// A cheap, cloneable handle for consuming.
    #[must_use]
    pub fn consumer(&self) -> Consumer {
        Consumer {
            shared: self.shared.clone(),
        }
    }

    /// Current in-memory positions and unacknowledged bytes.
    ///
    /// # Errors
    ///
    /// `QueueClosed` once the queue is closed.
    pub fn positions(&self) -> Result<QueueState> {
        self.shared.ensure_open()?;
        let (reply, reply_rx) = channel::bounded(1);
        self.shared
            .reader_tx
            .send(ReaderCommand::Positions { reply })
            .map_err(|_| QueueError::QueueClosed)?;
        reply_rx.recv().map_err(|_| QueueError::QueueClosed)
    }

    #[must_use]
    pub fn settings(&self) -> &Settings { &self.settings }

    #[must_use]
    pub fn is_closed(&self) -> bool { self.shared.closed.load(Ordering::Acquire) }

    /// Stop both worker threads.
    ///
    /// Publishes stop first. Consumers still waiting are served from data
    /// already written, the rest get `QueueClosed`. A final checkpoint is
    /// persisted. Idempotent and safe to call from several threads; only the
    /// first call does the work.
    ///
    /// # Errors
    ///
    /// The first failure among the writer's final flush and the final
    /// checkpoint, or `Internal` if a worker thread panicked.
    pub fn close(&self) -> Result<()> {
        // Held until both threads are joined so concurrent callers return
        // only after the queue is fully closed.
        let mut guard = self.workers.lock();
        let Some(workers) = guard.take() else {
            return Ok(());
        };
        self.shared.closed.store(true, Ordering::Release);
        info!(path = ?self.settings.path, "Closing queue");

        let _ = self.shared.writer_tx.send(WriterCommand::Shutdown);
        let writer = join(workers.writer, "writer");
        let _ = self.shared.reader_tx.send(ReaderCommand::Close);
        let reader = join(workers.reader, "reader");

        let result = writer.and(reader);
        match &result {
            Ok(()) => info!(path = ?self.settings.path, "Queue closed"),
            Err(e) => error!(path = ?self.settings.path, error = %e, "Queue closed with error"),
        }
        result
    }
}

impl Drop for Queue {
    fn drop(&mut self) { let _ = self.close(); }
}

fn spawn<F>(name: &str, f: F) -> Result<JoinHandle<Result<()>>>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    thread::Builder::new()
        .name(name.into())
        .spawn(f)
        .map_err(|e| {
            InternalSnafu {
                message: format!("failed to spawn {name} thread: {e}"),
            }
            .build()
        })
}

fn join(handle: JoinHandle<Result<()>>, name: &str) -> Result<()> {
    handle.join().unwrap_or_else(|_| {
        InternalSnafu {
            message: format!("{name} thread panicked"),
        }
        .fail()
    })
}

/// Publishing handle. Clones share the queue.
#[derive(Clone)]
pub struct Producer {
    shared: Arc<Shared>,
}

impl Producer {
    /// Append `payload`, blocking until it is written.
    ///
    /// # Errors
    ///
    /// See [`Self::publish_with`].
    pub fn publish(&self, payload: impl Into<Bytes>) -> Result<u64> {
        self.publish_with(payload, &Wait::forever())
    }

    /// Append `payload` under `wait` and return its sequence number.
    ///
    /// When this returns `Ok` the frame is written and visible to consumers;
    /// it is on stable storage according to the flush mode. Outside
    /// [`crate::FlushMode::Sync`] a crash may lose it and its sequence number is
    /// then reused.
    ///
    /// # Errors
    ///
    /// `QueueFull` when non-blocking and over the buffered-bytes ceiling,
    /// `Timeout` or `Canceled` per `wait`, `PayloadTooLarge`, `QueueClosed`,
    /// and `Io` if the write failed.
    pub fn publish_with(&self, payload: impl Into<Bytes>, wait: &Wait) -> Result<u64> {
        self.shared.ensure_open()?;
        let payload = payload.into();
        ensure!(
            payload.len() <= MAX_PAYLOAD_SIZE,
            PayloadTooLargeSnafu {
                size: payload.len(),
                max:  MAX_PAYLOAD_SIZE,
            }
        );

        let (reply, reply_rx) = channel::bounded(1);
        let ticket = Ticket::new();
        self.shared
            .writer_tx
            .send(WriterCommand::Publish(PublishRequest {
                payload,
                wait: wait.clone(),
                ticket: ticket.clone(),
                reply,
            }))
            .map_err(|_| QueueError::QueueClosed)?;
        await_reply(&reply_rx, &ticket, wait)
    }
}

/// Consuming handle. Clones share the queue and its read position.
#[derive(Clone)]
pub struct Consumer {
    shared: Arc<Shared>,
}

impl Consumer {
    /// Wait for the next batch of at most `max_items` frames. 0 means the
    /// configured default batch size.
    ///
    /// # Errors
    ///
    /// See [`Self::get_with`].
    pub fn get(&self, max_items: usize) -> Result<Batch> { self.get_with(max_items, &Wait::forever()) }

    /// Next batch under `wait`. A batch never spans two segments, so it may
    /// hold fewer than `max_items` frames even when more are written.
    ///
    /// # Errors
    ///
    /// `Timeout` when nothing arrives in time (immediately when
    /// non-blocking), `Canceled`, `QueueClosed`, and `Io` if reading failed
    /// before any frame was read.
    pub fn get_with(&self, max_items: usize, wait: &Wait) -> Result<Batch> {
        self.shared.ensure_open()?;
        let (reply, reply_rx) = channel::bounded(1);
        let ticket = Ticket::new();
        self.shared
            .reader_tx
            .send(ReaderCommand::Get(GetRequest {
                max_items,
                wait: wait.clone(),
                ticket: ticket.clone(),
                reply,
            }))
            .map_err(|_| QueueError::QueueClosed)?;

        let Delivery { batch_id, entries } = await_reply(&reply_rx, &ticket, wait)?;
        Ok(Batch {
            id: batch_id,
            entries,
            reader_tx: self.shared.reader_tx.clone(),
            acked: AtomicBool::new(false),
        })
    }
}

/// Frames delivered together. Must be acknowledged in delivery order.
///
/// Dropping a batch without acknowledging it leaves it outstanding: every
/// later batch then fails to acknowledge, and its frames come back after the
/// next restart.
pub struct Batch {
    id:        u64,
    entries:   Vec<Entry>,
    reader_tx: Sender<ReaderCommand>,
    acked:     AtomicBool,
}

impl std::fmt::Debug for Batch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batch")
            .field("id", &self.id)
            .field("frames", &self.entries.len())
            .field("sequences", &self.sequence_range())
            .finish()
    }
}

impl Batch {
    #[must_use]
    pub const fn id(&self) -> u64 { self.id }

    #[must_use]
    pub fn entries(&self) -> &[Entry] { &self.entries }

    pub fn payloads(&self) -> impl Iterator<Item = &Bytes> { self.entries.iter().map(|e| &e.payload) }

    /// First and last sequence number in the batch.
    #[must_use]
    pub fn sequence_range(&self) -> Option<RangeInclusive<u64>> {
        let first = self.entries.first()?.sequence;
        let last = self.entries.last()?.sequence;
        Some(first..=last)
    }

    #[must_use]
    pub fn len(&self) -> usize { self.entries.len() }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    /// Acknowledge every frame in the batch. Acknowledging twice is a no-op.
    ///
    /// The acknowledgment takes effect in memory right away; it survives a
    /// crash only after the next checkpoint persist, which happens on the
    /// flush interval or as soon as the acknowledgment enters a new segment.
    ///
    /// # Errors
    ///
    /// `Protocol` if an earlier batch is still unacknowledged, `QueueClosed`
    /// once the queue is closed.
    pub fn ack(&self) -> Result<()> {
        if self.acked.load(Ordering::Acquire) {
            return Ok(());
        }
        let (reply, reply_rx) = channel::bounded(1);
        self.reader_tx
            .send(ReaderCommand::Ack {
                batch_id: self.id,
                reply,
            })
            .map_err(|_| QueueError::QueueClosed)?;
        reply_rx.recv().map_err(|_| QueueError::QueueClosed)??;
        self.acked.store(true, Ordering::Release);
        Ok(())
    }
}
