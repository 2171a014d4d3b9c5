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

use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::Path,
    thread,
    time::Duration,
};

use bytes::Bytes;
use telespool_queue::{
    CancelToken, FlushMode, Queue, QueueBuilder, QueueError, Wait, path::SEGMENT_EXTENSION,
    segment::SegmentStore,
};
use tempfile::TempDir;

/// Frame size of a 16 byte payload.
const SMALL_FRAME: u64 = 32;

fn open_sync(path: &Path) -> Queue {
    QueueBuilder::new(path)
        .max_segment_bytes(1024)
        .flush_mode(FlushMode::Sync)
        .open()
        .unwrap()
}

fn segment_files(path: &Path) -> usize {
    fs::read_dir(path)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry.path().extension().and_then(|ext| ext.to_str()) == Some(SEGMENT_EXTENSION)
        })
        .count()
}

/// Drain everything currently readable, acknowledging each batch.
fn drain(queue: &Queue) -> Vec<(u64, Bytes)> {
    let consumer = queue.consumer();
    let mut out = Vec::new();
    while let Ok(batch) = consumer.get_with(0, &Wait::non_blocking()) {
        out.extend(
            batch
                .entries()
                .iter()
                .map(|e| (e.sequence, e.payload.clone())),
        );
        batch.ack().unwrap();
    }
    out
}

/// Copy the files of a running queue the way a crash would leave them.
///
/// The checkpoint goes first: segments it names only grow afterwards, and
/// none is deleted while the checkpoint still names it.
fn copy_files(from: &Path, to: &Path) {
    let checkpoint = "checkpoint.dat";
    fs::copy(from.join(checkpoint), to.join(checkpoint)).unwrap();
    for entry in fs::read_dir(from).unwrap() {
        let path = entry.unwrap().path();
        if path.extension().and_then(|ext| ext.to_str()) == Some(SEGMENT_EXTENSION) {
            fs::copy(&path, to.join(path.file_name().unwrap())).unwrap();
        }
    }
}

#[test]
fn test_queue_write_and_read() {
    let temp_dir = TempDir::new().unwrap();
    let queue = open_sync(temp_dir.path());
    let producer = queue.producer();

    for i in 0..100 {
        let msg = format!("message-{i:04}");
        assert_eq!(producer.publish(msg).unwrap(), i);
    }
    assert!(segment_files(temp_dir.path()) > 1);

    let messages = drain(&queue);
    assert_eq!(messages.len(), 100);
    for (i, (sequence, payload)) in messages.iter().enumerate() {
        assert_eq!(*sequence, i as u64);
        assert_eq!(
            std::str::from_utf8(payload).unwrap(),
            format!("message-{i:04}")
        );
    }

    queue.close().unwrap();
}

#[test]
fn test_batches_stay_within_one_segment() {
    let temp_dir = TempDir::new().unwrap();
    let queue = open_sync(temp_dir.path());
    let producer = queue.producer();
    for _ in 0..40 {
        producer.publish(vec![7u8; 100]).unwrap();
    }

    let consumer = queue.consumer();
    let batch = consumer.get(1000).unwrap();
    // 116 byte frames after a 16 byte header in 1 KiB segments.
    assert_eq!(batch.len(), 8);
    assert_eq!(batch.sequence_range(), Some(0..=7));
    batch.ack().unwrap();
    queue.close().unwrap();
}

#[test]
fn test_queue_recovery() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path();

    {
        let queue = open_sync(path);
        let producer = queue.producer();
        for i in 0..50 {
            producer.publish(format!("msg-{i}")).unwrap();
        }
        let batch = queue.consumer().get(20).unwrap();
        assert_eq!(batch.len(), 20);
        batch.ack().unwrap();
        queue.close().unwrap();
    }

    {
        let queue = open_sync(path);
        let producer = queue.producer();
        for i in 50..100 {
            assert_eq!(producer.publish(format!("msg-{i}")).unwrap(), i);
        }

        let sequences: Vec<u64> = drain(&queue).into_iter().map(|(seq, _)| seq).collect();
        assert_eq!(sequences, (20..100).collect::<Vec<_>>());
        queue.close().unwrap();
    }
}

#[test]
fn test_unacknowledged_batch_is_redelivered() {
    let temp_dir = TempDir::new().unwrap();

    {
        let queue = open_sync(temp_dir.path());
        let producer = queue.producer();
        for i in 0..10u8 {
            producer.publish(vec![i; 4]).unwrap();
        }
        let batch = queue.consumer().get(0).unwrap();
        assert_eq!(batch.len(), 10);
        // Dropped without acknowledging.
    }

    let queue = open_sync(temp_dir.path());
    let messages = drain(&queue);
    assert_eq!(messages.len(), 10);
    assert_eq!(messages[3], (3, Bytes::from(vec![3u8; 4])));
    queue.close().unwrap();
}

#[test]
fn test_acknowledged_segments_are_deleted() {
    let temp_dir = TempDir::new().unwrap();
    let queue = open_sync(temp_dir.path());
    let producer = queue.producer();
    for _ in 0..100 {
        producer.publish(vec![1u8; 100]).unwrap();
    }
    let before = segment_files(temp_dir.path());
    assert!(before >= 10, "{before} segments");

    assert_eq!(drain(&queue).len(), 100);
    assert_eq!(segment_files(temp_dir.path()), 1);
    assert_eq!(queue.positions().unwrap().segments, 1);
    queue.close().unwrap();
}

#[test]
fn test_unacknowledged_segments_are_kept() {
    let temp_dir = TempDir::new().unwrap();
    let queue = open_sync(temp_dir.path());
    let producer = queue.producer();
    for _ in 0..100 {
        producer.publish(vec![1u8; 100]).unwrap();
    }
    let before = segment_files(temp_dir.path());

    let consumer = queue.consumer();
    let first = consumer.get(0).unwrap();
    let second = consumer.get(0).unwrap();
    assert!(matches!(second.ack(), Err(QueueError::Protocol { .. })));
    thread::sleep(Duration::from_millis(100));
    assert_eq!(segment_files(temp_dir.path()), before);

    first.ack().unwrap();
    second.ack().unwrap();
    queue.close().unwrap();
}

#[test]
fn test_backpressure() {
    let temp_dir = TempDir::new().unwrap();
    let queue = QueueBuilder::new(temp_dir.path())
        .max_buffered_bytes(3 * SMALL_FRAME)
        .flush_mode(FlushMode::Async)
        .open()
        .unwrap();
    let producer = queue.producer();
    for _ in 0..3 {
        producer.publish(vec![0u8; 16]).unwrap();
    }

    assert!(matches!(
        producer.publish_with(vec![0u8; 16], &Wait::non_blocking()),
        Err(QueueError::QueueFull)
    ));
    assert!(matches!(
        producer.publish_with(vec![0u8; 16], &Wait::timeout(Duration::from_millis(30))),
        Err(QueueError::Timeout)
    ));

    let blocked = {
        let producer = producer.clone();
        thread::spawn(move || producer.publish(vec![9u8; 16]))
    };
    thread::sleep(Duration::from_millis(50));
    assert!(!blocked.is_finished());

    let batch = queue.consumer().get(1).unwrap();
    batch.ack().unwrap();
    assert_eq!(blocked.join().unwrap().unwrap(), 3);

    // Nothing rejected was written.
    let sequences: Vec<u64> = drain(&queue).into_iter().map(|(seq, _)| seq).collect();
    assert_eq!(sequences, vec![1, 2, 3]);
    queue.close().unwrap();
}

#[test]
fn test_cancel_blocked_publish_and_get() {
    let temp_dir = TempDir::new().unwrap();
    let queue = QueueBuilder::new(temp_dir.path())
        .max_buffered_bytes(SMALL_FRAME)
        .open()
        .unwrap();
    let producer = queue.producer();
    producer.publish(vec![0u8; 16]).unwrap();

    let token = CancelToken::new();
    let wait = Wait::forever().cancel_on(&token);
    let publisher = {
        let producer = producer.clone();
        let wait = wait.clone();
        thread::spawn(move || producer.publish_with(vec![1u8; 16], &wait))
    };
    thread::sleep(Duration::from_millis(30));
    token.cancel();
    assert!(matches!(
        publisher.join().unwrap(),
        Err(QueueError::Canceled)
    ));

    let consumer = queue.consumer();
    consumer.get(0).unwrap().ack().unwrap();
    let token = CancelToken::new();
    token.cancel();
    assert!(matches!(
        consumer.get_with(0, &Wait::forever().cancel_on(&token)),
        Err(QueueError::Canceled)
    ));
    queue.close().unwrap();
}

#[test]
fn test_close_fails_pending_operations() {
    let temp_dir = TempDir::new().unwrap();
    let queue = open_sync(temp_dir.path());
    let producer = queue.producer();
    producer.publish(&b"only"[..]).unwrap();

    let consumer = queue.consumer();
    let batch = consumer.get(0).unwrap();
    let waiting = {
        let consumer = consumer.clone();
        thread::spawn(move || consumer.get(0).map(|batch| batch.len()))
    };
    thread::sleep(Duration::from_millis(30));

    queue.close().unwrap();
    queue.close().unwrap();

    assert!(matches!(
        waiting.join().unwrap(),
        Err(QueueError::QueueClosed)
    ));
    assert!(matches!(batch.ack(), Err(QueueError::QueueClosed)));
    assert!(matches!(
        producer.publish(&b"late"[..]),
        Err(QueueError::QueueClosed)
    ));
    assert!(matches!(consumer.get(0), Err(QueueError::QueueClosed)));
}

#[test]
fn test_corrupt_tail_is_dropped_on_recovery() {
    let temp_dir = TempDir::new().unwrap();

    {
        let queue = open_sync(temp_dir.path());
        let producer = queue.producer();
        for i in 0..5 {
            producer.publish(format!("event-{i}")).unwrap();
        }
        queue.close().unwrap();
    }

    // A torn write at the end of the last segment.
    let segment = temp_dir.path().join(format!("0.{SEGMENT_EXTENSION}"));
    let mut file = OpenOptions::new().append(true).open(&segment).unwrap();
    file.write_all(&[0xAB; 11]).unwrap();
    drop(file);

    let queue = open_sync(temp_dir.path());
    assert_eq!(queue.producer().publish(&b"after"[..]).unwrap(), 5);
    let messages = drain(&queue);
    assert_eq!(messages.len(), 6);
    assert_eq!(messages[5], (5, Bytes::from_static(b"after")));
    queue.close().unwrap();
}

#[test]
fn test_crash_snapshot_recovers_published_frames() {
    let temp_dir = TempDir::new().unwrap();
    let snapshot = TempDir::new().unwrap();
    let queue = open_sync(temp_dir.path());
    let producer = queue.producer();
    for i in 0..60 {
        producer.publish(format!("durable-{i}")).unwrap();
    }

    copy_files(temp_dir.path(), snapshot.path());

    let recovered = open_sync(snapshot.path());
    assert_eq!(recovered.producer().publish(&b"next"[..]).unwrap(), 60);
    let messages = drain(&recovered);
    assert_eq!(messages.len(), 61);
    assert_eq!(messages[59].1, Bytes::from("durable-59"));
    recovered.close().unwrap();
    queue.close().unwrap();
}

#[test]
fn test_unpersisted_ack_is_redelivered_after_crash() {
    let temp_dir = TempDir::new().unwrap();
    let snapshot = TempDir::new().unwrap();
    let queue = QueueBuilder::new(temp_dir.path())
        .flush_mode(FlushMode::Sync)
        .flush_interval(Duration::from_secs(3600))
        .open()
        .unwrap();
    let producer = queue.producer();
    for i in 0..10 {
        producer.publish(format!("pending-{i}")).unwrap();
    }

    let batch = queue.consumer().get(5).unwrap();
    assert_eq!(batch.sequence_range(), Some(0..=4));
    batch.ack().unwrap();
    let state = queue.positions().unwrap();
    assert_eq!(state.ack_pos.sequence, 5);
    assert_eq!(state.ack_pos.segment, 0);

    copy_files(temp_dir.path(), snapshot.path());

    let recovered = open_sync(snapshot.path());
    let state = recovered.positions().unwrap();
    assert_eq!(state.ack_pos.sequence, 0);
    let messages = drain(&recovered);
    let sequences: Vec<u64> = messages.iter().map(|(sequence, _)| *sequence).collect();
    assert_eq!(sequences, (0..10).collect::<Vec<_>>());
    assert_eq!(messages[0].1, Bytes::from("pending-0"));
    recovered.close().unwrap();
    queue.close().unwrap();
}

#[test]
fn test_open_after_interrupted_first_open() {
    let temp_dir = TempDir::new().unwrap();
    SegmentStore::open(temp_dir.path())
        .unwrap()
        .allocate(0)
        .unwrap();
    assert!(!temp_dir.path().join("checkpoint.dat").exists());

    let queue = open_sync(temp_dir.path());
    assert_eq!(queue.producer().publish(&b"first"[..]).unwrap(), 0);
    let messages = drain(&queue);
    assert_eq!(messages, vec![(0, Bytes::from_static(b"first"))]);
    queue.close().unwrap();

    let queue = open_sync(temp_dir.path());
    assert_eq!(queue.producer().publish(&b"second"[..]).unwrap(), 1);
    queue.close().unwrap();
}

#[test]
fn test_settings_from_json() {
    let temp_dir = TempDir::new().unwrap();
    let json = format!(
        r#"{{"path": {:?}, "max_segment_bytes": 2048, "flush_interval": "250ms", "flush_mode": "sync"}}"#,
        temp_dir.path()
    );
    let settings: telespool_queue::Settings = serde_json::from_str(&json).unwrap();
    assert_eq!(settings.flush_interval, Duration::from_millis(250));

    let queue = Queue::open(settings).unwrap();
    assert_eq!(queue.settings().max_segment_bytes, 2048);
    queue.close().unwrap();
}
