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

//! Deletion of fully acknowledged segments.

use tracing::{info, warn};

use crate::{
    metrics::QueueMetrics,
    position::SegmentId,
    segment::{SegmentStore, SegmentTable},
};

/// Deletes sealed segments older than `durable_ack_segment`, oldest first.
///
/// Only the acknowledgment position of a persisted checkpoint may be passed
/// in: after a crash, recovery must find every segment that checkpoint
/// references. Stops at the first failure; the segment stays in the table
/// and is retried on the next call. Returns the number deleted.
pub(crate) fn collect_garbage(
    store: &SegmentStore,
    segments: &mut SegmentTable,
    durable_ack_segment: SegmentId,
    metrics: &QueueMetrics,
) -> usize {
    let mut deleted = 0;
    while let Some(front) = segments.front() {
        if !front.sealed || front.id >= durable_ack_segment {
            break;
        }
        let id = front.id;
        if let Err(e) = store.delete(id) {
            warn!(segment = id, error = %e, "Failed to delete acknowledged segment");
            break;
        }
        segments.pop_front();
        metrics.segments_deleted.inc();
        deleted += 1;
    }

    if deleted > 0 {
        info!(deleted, live = segments.len(), "Deleted acknowledged segments");
    }
    deleted
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::segment::SegmentInfo;

    fn setup(ids: &[SegmentId]) -> (TempDir, SegmentStore, SegmentTable) {
        let temp_dir = TempDir::new().unwrap();
        let store = SegmentStore::open(temp_dir.path()).unwrap();
        let mut table = SegmentTable::default();
        for &id in ids {
            store.allocate(id).unwrap();
            table.push(SegmentInfo::sealed(id, 16));
        }
        (temp_dir, store, table)
    }

    #[test]
    fn test_deletes_only_before_ack_segment() {
        let (_dir, store, mut table) = setup(&[3, 4, 5, 6]);
        let metrics = QueueMetrics::new("gc_test_partial");

        assert_eq!(collect_garbage(&store, &mut table, 5, &metrics), 2);
        assert_eq!(store.list_existing().unwrap(), vec![5, 6]);
        assert_eq!(table.front().unwrap().id, 5);
        assert_eq!(metrics.segments_deleted.get(), 2);
    }

    #[test]
    fn test_keeps_unsealed_segment() {
        let (_dir, store, mut table) = setup(&[0]);
        store.allocate(1).unwrap();
        table.push(SegmentInfo::active(1));
        let metrics = QueueMetrics::new("gc_test_unsealed");

        assert_eq!(collect_garbage(&store, &mut table, 9, &metrics), 1);
        assert_eq!(table.len(), 1);
        assert_eq!(store.list_existing().unwrap(), vec![1]);
    }

    #[test]
    fn test_already_removed_file_is_not_an_error() {
        let (_dir, store, mut table) = setup(&[0, 1]);
        std::fs::remove_file(store.path(0)).unwrap();
        let metrics = QueueMetrics::new("gc_test_missing");

        assert_eq!(collect_garbage(&store, &mut table, 1, &metrics), 1);
        assert_eq!(table.front().unwrap().id, 1);
    }
}
