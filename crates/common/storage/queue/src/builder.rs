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

use crate::{FlushMode, Queue, Result, Settings};

pub struct QueueBuilder {
    settings: Settings,
}

impl QueueBuilder {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            settings: Settings::new(path),
        }
    }

    #[must_use]
    pub fn max_segment_bytes(mut self, bytes: u64) -> Self {
        self.settings.max_segment_bytes = bytes;
        self
    }

    /// 0 disables backpressure.
    #[must_use]
    pub fn max_buffered_bytes(mut self, bytes: u64) -> Self {
        self.settings.max_buffered_bytes = bytes;
        self
    }

    #[must_use]
    pub fn default_batch_size(mut self, size: usize) -> Self {
        self.settings.default_batch_size = size;
        self
    }

    #[must_use]
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.settings.flush_interval = interval;
        self
    }

    #[must_use]
    pub fn flush_mode(mut self, mode: FlushMode) -> Self {
        self.settings.flush_mode = mode;
        self
    }

    #[must_use]
    pub fn settings(self) -> Settings { self.settings }

    /// # Errors
    ///
    /// See [`Queue::open`].
    pub fn open(self) -> Result<Queue> { Queue::open(self.settings) }
}
