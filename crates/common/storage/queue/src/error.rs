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

use std::io;

use snafu::Snafu;

use crate::position::SegmentId;

/// Queue operation errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum QueueError {
    /// Filesystem I/O failure. Returned to the immediate caller; the queue
    /// stays usable.
    #[snafu(display("IO error while {context}"))]
    Io {
        context: String,
        source:  io::Error,
    },

    /// Checksum or length mismatch while reading a frame. The rest of the
    /// segment is treated as unreadable.
    #[snafu(display("Corrupt frame in segment {segment} at offset {offset}: {reason}"))]
    CorruptFrame {
        segment: SegmentId,
        offset:  u64,
        reason:  String,
    },

    /// Checkpoint and segment files disagree. The queue refuses to open.
    #[snafu(display("Corrupt queue state: {reason}"))]
    CorruptState { reason: String },

    /// The buffered-bytes ceiling was reached and the caller asked not to
    /// wait.
    #[snafu(display("Queue is full"))]
    QueueFull,

    /// The queue is closed or closing.
    #[snafu(display("Queue is closed"))]
    QueueClosed,

    /// Acknowledgment out of order or for an unknown batch.
    #[snafu(display("Acknowledgment protocol violation: {reason}"))]
    Protocol { reason: String },

    /// The caller's deadline passed before the operation completed.
    #[snafu(display("Operation timed out"))]
    Timeout,

    /// The caller's cancellation token fired.
    #[snafu(display("Operation canceled"))]
    Canceled,

    #[snafu(display("Payload of {size} bytes exceeds the frame limit of {max} bytes"))]
    PayloadTooLarge { size: usize, max: usize },

    #[snafu(display("Invalid settings: {reason}"))]
    InvalidSettings { reason: String },

    /// Worker thread failure.
    #[snafu(display("Internal error: {message}"))]
    Internal { message: String },
}

impl QueueError {
    /// Whether retrying the same call later may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Io { .. } | Self::QueueFull | Self::Timeout)
    }

    /// Whether the error means the queue no longer accepts operations.
    #[must_use]
    pub const fn is_closed(&self) -> bool { matches!(self, Self::QueueClosed) }
}

/// Result type for queue operations.
pub type Result<T, E = QueueError> = std::result::Result<T, E>;
