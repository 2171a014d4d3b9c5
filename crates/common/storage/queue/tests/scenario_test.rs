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

mod common;

use std::{sync::atomic::AtomicUsize, thread, time::Duration};

use common::{AckSequencer, Outcome, ScenarioConfig, consume, decode_event, produce};
use telespool_queue::{FlushMode, Queue, QueueBuilder, Wait};
use tempfile::TempDir;
use test_case::test_case;

fn open(temp_dir: &TempDir, config: &ScenarioConfig) -> Queue {
    common::init_tracing();
    QueueBuilder::new(temp_dir.path())
        .max_segment_bytes(16 * 1024)
        .max_buffered_bytes(config.max_buffered_bytes())
        .default_batch_size(config.batch_size)
        .flush_interval(Duration::from_millis(50))
        .flush_mode(FlushMode::Async)
        .open()
        .unwrap()
}

#[test_case(1, 1 ; "single producer single consumer")]
#[test_case(8, 1 ; "many producers single consumer")]
#[test_case(1, 4 ; "single producer many consumers")]
#[test_case(8, 4 ; "many producers many consumers")]
fn test_standard_scenario(producers: usize, consumers: usize) {
    let temp_dir = TempDir::new().unwrap();
    let config = ScenarioConfig::standard(0x7e1e_5b001, producers, consumers);
    let queue = open(&temp_dir, &config);

    let outcome = common::run_scenario(&queue, &config);
    assert_eq!(outcome.published.len(), config.events);
    outcome.assert_exactly_once();

    let state = queue.positions().unwrap();
    assert_eq!(state.ack_pos, state.write_pos);
    assert_eq!(state.unacknowledged_bytes, 0);
    queue.close().unwrap();
}

#[test_case(11 ; "seed 11")]
#[test_case(42 ; "seed 42")]
#[test_case(20_251_019 ; "seed 20251019")]
fn test_random_scenario(seed: u64) {
    let temp_dir = TempDir::new().unwrap();
    let config = ScenarioConfig::random(seed, 4, 2);
    let queue = open(&temp_dir, &config);

    common::run_scenario(&queue, &config).assert_exactly_once();
    queue.close().unwrap();
}

/// Half the events are acknowledged, one batch is delivered but never
/// acknowledged, then the queue restarts. Only frames at or after the
/// acknowledgment position may come back.
#[test]
fn test_restart_redelivers_only_unacknowledged() {
    let temp_dir = TempDir::new().unwrap();
    let config = ScenarioConfig {
        buffer_frames: 0,
        ..ScenarioConfig::standard(7, 8, 1)
    };

    let (published, first_run, ack_sequence) = {
        let queue = open(&temp_dir, &config);
        let producer = queue.producer();
        let published: Vec<_> = (0..config.producers)
            .flat_map(|id| produce(&producer, &config, id))
            .collect();

        let consumer = queue.consumer();
        let delivered = consume(
            &consumer,
            &config,
            &AckSequencer::default(),
            &AtomicUsize::new(0),
            config.events / 2,
        );
        let dropped = consumer.get(config.batch_size).unwrap();
        assert!(!dropped.is_empty());

        let ack_sequence = queue.positions().unwrap().ack_pos.sequence;
        queue.close().unwrap();
        (published, delivered, ack_sequence)
    };

    let queue = open(&temp_dir, &config);
    let remaining = config.events - first_run.len();
    let second_run = consume(
        &queue.consumer(),
        &config,
        &AckSequencer::default(),
        &AtomicUsize::new(0),
        remaining,
    );
    assert_eq!(second_run.first().unwrap().sequence, ack_sequence);

    let mut outcome = Outcome {
        published,
        delivered: first_run,
    };
    outcome.assert_producer_order();
    outcome.delivered.extend(second_run);
    outcome.delivered.sort_by_key(|d| d.sequence);
    outcome.assert_exactly_once();

    assert!(matches!(
        queue.consumer().get_with(1, &Wait::non_blocking()),
        Err(telespool_queue::QueueError::Timeout)
    ));
    queue.close().unwrap();
}

/// Several consumers block in `get` on an empty queue at the same time; each
/// is served one frame as frames arrive and acknowledgments still line up.
#[test]
fn test_concurrently_waiting_consumers() {
    let temp_dir = TempDir::new().unwrap();
    let config = ScenarioConfig::standard(5, 1, 4);
    let queue = open(&temp_dir, &config);
    let sequencer = AckSequencer::default();

    let mut sequences: Vec<u64> = thread::scope(|s| {
        let waiters: Vec<_> = (0..config.consumers)
            .map(|_| {
                let consumer = queue.consumer();
                let sequencer = &sequencer;
                s.spawn(move || {
                    let batch = consumer.get(1).unwrap();
                    assert_eq!(batch.len(), 1);
                    sequencer.ack(&batch).unwrap();
                    batch.entries()[0].sequence
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(100));
        assert_eq!(queue.positions().unwrap().outstanding_batches, 0);
        let producer = queue.producer();
        for i in 0..config.consumers {
            producer.publish(format!("wake-{i}")).unwrap();
        }

        waiters.into_iter().map(|h| h.join().unwrap()).collect()
    });

    sequences.sort_unstable();
    assert_eq!(sequences, vec![0, 1, 2, 3]);
    let state = queue.positions().unwrap();
    assert_eq!(state.ack_pos, state.write_pos);
    queue.close().unwrap();
}

#[test]
fn test_payloads_carry_their_identity() {
    let mut rng = <rand::rngs::StdRng as rand::SeedableRng>::seed_from_u64(3);
    let id = common::EventId {
        producer: 5,
        index:    77,
    };
    let payload = common::encode_event(id, &mut rng, 64);
    assert!(payload.len() <= 64);
    assert_eq!(decode_event(&payload), id);
}
