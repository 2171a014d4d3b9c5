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

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;
use snafu::ensure;

use crate::{
    Result, error::InvalidSettingsSnafu, frame::frame_disk_size, segment::SEGMENT_HEADER_SIZE,
};

pub const DEFAULT_MAX_SEGMENT_BYTES: u64 = 64 * 1024 * 1024;
pub const DEFAULT_MAX_BUFFERED_BYTES: u64 = 1024 * 1024 * 1024;
pub const DEFAULT_BATCH_SIZE: usize = 64;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Queue settings. Read once when the queue opens.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, SmartDefault)]
#[serde(default)]
pub struct Settings {
    /// Directory holding segment files and the checkpoint.
    #[default(_code = "PathBuf::from(\"./queue_data\")")]
    pub path:               PathBuf,
    /// Soft size limit of a segment file. A frame larger than this still gets
    /// a segment of its own.
    #[default(DEFAULT_MAX_SEGMENT_BYTES)]
    pub max_segment_bytes:  u64,
    /// Ceiling on written but unacknowledged bytes. 0 disables backpressure.
    #[default(DEFAULT_MAX_BUFFERED_BYTES)]
    pub max_buffered_bytes: u64,
    /// Batch size used when a consumer asks for 0 items.
    #[default(DEFAULT_BATCH_SIZE)]
    pub default_batch_size: usize,
    /// How often the checkpoint is persisted.
    #[default(DEFAULT_FLUSH_INTERVAL)]
    #[serde(with = "humantime_serde")]
    pub flush_interval:     Duration,
    pub flush_mode:         FlushMode,
}

impl Settings {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.default_batch_size > 0,
            InvalidSettingsSnafu {
                reason: "default_batch_size must be positive",
            }
        );
        ensure!(
            !self.flush_interval.is_zero(),
            InvalidSettingsSnafu {
                reason: "flush_interval must be positive",
            }
        );
        let min_segment = SEGMENT_HEADER_SIZE + frame_disk_size(0);
        ensure!(
            self.max_segment_bytes > min_segment,
            InvalidSettingsSnafu {
                reason: format!(
                    "max_segment_bytes must exceed {min_segment}, got {}",
                    self.max_segment_bytes
                ),
            }
        );
        if let FlushMode::Batch { interval, .. } = &self.flush_mode {
            ensure!(
                !interval.is_zero(),
                InvalidSettingsSnafu {
                    reason: "flush_mode batch interval must be positive",
                }
            );
        }
        Ok(())
    }
}

/// When appended frames are fsynced.
///
/// Only `Sync` makes a frame durable before its sequence number is returned.
/// With `Async` and `Batch` a crash loses the frames written since the last
/// fsync, and recovery hands their sequence numbers out again: it resumes
/// after the last frame that survived.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FlushMode {
    /// fsync before every publish returns.
    Sync,
    /// Leave it to the OS; fsync only when a segment is sealed and on close.
    Async,
    /// fsync once `bytes` are pending or `interval` has passed since the last
    /// fsync.
    Batch {
        bytes:    u64,
        #[serde(with = "humantime_serde")]
        interval: Duration,
    },
}

impl Default for FlushMode {
    fn default() -> Self {
        Self::Batch {
            bytes:    1024 * 1024,
            interval: DEFAULT_FLUSH_INTERVAL,
        }
    }
}
