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

//! Disk-backed FIFO queue for buffering telemetry events between collection
//! and export.
//!
//! Producers append opaque payloads to segment files; consumers read them
//! back in batches and acknowledge them in order. Delivery is at-least-once:
//! anything not acknowledged before a crash or restart is delivered again.

pub mod api;
pub mod builder;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod frame;
pub mod path;
pub mod position;
pub mod queue;
pub mod segment;

mod crc;
mod gc;
mod metrics;
mod reader;
mod recovery;
mod tracker;
mod wait;
mod writer;

pub use api::{EventBatch, EventConsumer, EventProducer, EventQueue};
pub use builder::QueueBuilder;
pub use checkpoint::Checkpoint;
pub use config::{FlushMode, Settings};
pub use error::{QueueError, Result};
pub use frame::{Entry, MAX_PAYLOAD_SIZE};
pub use position::{Position, SegmentId};
pub use queue::{Batch, Consumer, Producer, Queue, QueueState};
pub use wait::{CancelToken, Wait};
