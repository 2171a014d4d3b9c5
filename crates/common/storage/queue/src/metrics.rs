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

use std::sync::LazyLock;

use prometheus::{
    IntCounter, IntCounterVec, IntGauge, IntGaugeVec, register_int_counter_vec,
    register_int_gauge_vec,
};

/// Label carrying the queue directory.
pub const QUEUE_LABEL: &str = "queue";

pub static QUEUE_FRAMES_WRITTEN: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "queue_frames_written_total",
        "Total number of frames appended to segments",
        &[QUEUE_LABEL]
    )
    .unwrap()
});

pub static QUEUE_BYTES_WRITTEN: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "queue_bytes_written_total",
        "Total number of bytes appended to segments, framing included",
        &[QUEUE_LABEL]
    )
    .unwrap()
});

pub static QUEUE_FRAMES_DELIVERED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "queue_frames_delivered_total",
        "Total number of frames handed to consumers, redeliveries included",
        &[QUEUE_LABEL]
    )
    .unwrap()
});

pub static QUEUE_BATCHES_ACKED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "queue_batches_acked_total",
        "Total number of batches acknowledged",
        &[QUEUE_LABEL]
    )
    .unwrap()
});

pub static QUEUE_SEGMENTS_DELETED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "queue_segments_deleted_total",
        "Total number of fully acknowledged segments deleted",
        &[QUEUE_LABEL]
    )
    .unwrap()
});

pub static QUEUE_CORRUPT_FRAMES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "queue_corrupt_frames_total",
        "Total number of corrupt frames found while reading",
        &[QUEUE_LABEL]
    )
    .unwrap()
});

pub static QUEUE_PUBLISH_REJECTED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "queue_publish_rejected_total",
        "Total number of publishes refused because the queue was full",
        &[QUEUE_LABEL]
    )
    .unwrap()
});

pub static QUEUE_CHECKPOINT_PERSISTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "queue_checkpoint_persists_total",
        "Total number of checkpoints made durable",
        &[QUEUE_LABEL]
    )
    .unwrap()
});

pub static QUEUE_BUFFERED_BYTES: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    register_int_gauge_vec!(
        "queue_buffered_bytes",
        "Bytes written but not yet acknowledged",
        &[QUEUE_LABEL]
    )
    .unwrap()
});

/// Handles bound to one queue's label, resolved once at open.
#[derive(Debug, Clone)]
pub(crate) struct QueueMetrics {
    pub frames_written:      IntCounter,
    pub bytes_written:       IntCounter,
    pub frames_delivered:    IntCounter,
    pub batches_acked:       IntCounter,
    pub segments_deleted:    IntCounter,
    pub corrupt_frames:      IntCounter,
    pub publish_rejected:    IntCounter,
    pub checkpoint_persists: IntCounter,
    pub buffered_bytes:      IntGauge,
}

impl QueueMetrics {
    pub(crate) fn new(queue: &str) -> Self {
        let labels = &[queue];
        Self {
            frames_written:      QUEUE_FRAMES_WRITTEN.with_label_values(labels),
            bytes_written:       QUEUE_BYTES_WRITTEN.with_label_values(labels),
            frames_delivered:    QUEUE_FRAMES_DELIVERED.with_label_values(labels),
            batches_acked:       QUEUE_BATCHES_ACKED.with_label_values(labels),
            segments_deleted:    QUEUE_SEGMENTS_DELETED.with_label_values(labels),
            corrupt_frames:      QUEUE_CORRUPT_FRAMES.with_label_values(labels),
            publish_rejected:    QUEUE_PUBLISH_REJECTED.with_label_values(labels),
            checkpoint_persists: QUEUE_CHECKPOINT_PERSISTS.with_label_values(labels),
            buffered_bytes:      QUEUE_BUFFERED_BYTES.with_label_values(labels),
        }
    }

    #[allow(clippy::cast_possible_wrap)]
    pub(crate) fn set_buffered(&self, bytes: u64) { self.buffered_bytes.set(bytes as i64); }
}
