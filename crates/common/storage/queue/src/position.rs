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

//! Locations in the logical frame stream.

use std::fmt;

use crate::segment::SEGMENT_HEADER_SIZE;

/// Numeric segment identifier. Ids are allocated consecutively.
pub type SegmentId = u64;

/// A location in the logical stream: segment, byte offset inside the segment,
/// and the sequence number of the frame stored at that location.
///
/// Field order matters: positions compare by segment, then offset, then
/// sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Position {
    pub segment:  SegmentId,
    pub offset:   u64,
    pub sequence: u64,
}

impl Position {
    #[must_use]
    pub const fn new(segment: SegmentId, offset: u64, sequence: u64) -> Self {
        Self {
            segment,
            offset,
            sequence,
        }
    }

    /// The first frame slot of `segment`.
    #[must_use]
    pub const fn segment_start(segment: SegmentId, sequence: u64) -> Self {
        Self::new(segment, SEGMENT_HEADER_SIZE, sequence)
    }

    #[must_use]
    pub const fn is_segment_start(&self) -> bool { self.offset == SEGMENT_HEADER_SIZE }
}

impl Default for Position {
    fn default() -> Self { Self::segment_start(0, 0) }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}#{}", self.segment, self.offset, self.sequence)
    }
}
