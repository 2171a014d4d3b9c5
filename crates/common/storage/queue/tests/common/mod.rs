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

//! Producer/consumer scenario harness, generic over [`EventQueue`].

#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::atomic::{AtomicUsize, Ordering},
    thread,
    time::Duration,
};

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::{Condvar, Mutex};
use rand::{Rng, SeedableRng, rngs::StdRng};
use telespool_queue::{
    EventBatch, EventConsumer, EventProducer, EventQueue, QueueError, Result, Wait,
};

/// Route queue logs to the test output. `RUST_LOG` picks the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Length, sequence and checksum around every payload.
pub const FRAME_OVERHEAD: u64 = 16;

/// Producer id and per-producer index at the start of every payload.
const PAYLOAD_HEADER: usize = 8;

const POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy)]
pub struct ScenarioConfig {
    pub seed:          u64,
    pub producers:     usize,
    pub consumers:     usize,
    pub events:        usize,
    pub batch_size:    usize,
    /// Backpressure bound in frames of the largest payload. 0 is unbounded.
    pub buffer_frames: u64,
    pub max_payload:   usize,
}

impl ScenarioConfig {
    /// 1024 events of random size in batches of 64 with a 16 frame buffer.
    pub const fn standard(seed: u64, producers: usize, consumers: usize) -> Self {
        Self {
            seed,
            producers,
            consumers,
            events: 1024,
            batch_size: 64,
            buffer_frames: 16,
            max_payload: 512,
        }
    }

    /// Event count, batch size and buffer bound drawn from `seed`.
    pub fn random(seed: u64, producers: usize, consumers: usize) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        Self {
            seed,
            producers,
            consumers,
            events: rng.random_range(64..=2048),
            batch_size: rng.random_range(1..=128),
            buffer_frames: rng.random_range(4..=64),
            max_payload: rng.random_range(PAYLOAD_HEADER..=1024),
        }
    }

    pub const fn max_buffered_bytes(&self) -> u64 {
        self.buffer_frames * (FRAME_OVERHEAD + self.max_payload as u64)
    }

    /// Events published by producer `id`.
    pub const fn events_for(&self, id: usize) -> usize {
        self.events / self.producers + if id < self.events % self.producers { 1 } else { 0 }
    }
}

/// Identity of a published event, recovered from its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId {
    pub producer: u32,
    pub index:    u32,
}

pub fn encode_event(id: EventId, rng: &mut StdRng, max_payload: usize) -> Bytes {
    let filler = rng.random_range(0..=max_payload - PAYLOAD_HEADER);
    let mut buf = BytesMut::with_capacity(PAYLOAD_HEADER + filler);
    buf.put_u32_le(id.producer);
    buf.put_u32_le(id.index);
    let mut noise = vec![0u8; filler];
    rng.fill(&mut noise[..]);
    buf.put_slice(&noise);
    buf.freeze()
}

pub fn decode_event(payload: &[u8]) -> EventId {
    let producer = u32::from_le_bytes(payload[0..4].try_into().unwrap());
    let index = u32::from_le_bytes(payload[4..8].try_into().unwrap());
    EventId { producer, index }
}

/// Makes concurrent consumers acknowledge in delivery order. Batch ids are
/// handed out in delivery order, so a batch waits until every lower id has
/// been acknowledged.
#[derive(Default)]
pub struct AckSequencer {
    acked: Mutex<u64>,
    turn:  Condvar,
}

impl AckSequencer {
    pub fn ack<B: EventBatch>(&self, batch: &B) -> Result<()> {
        let mut acked = self.acked.lock();
        while *acked != batch.id() {
            self.turn.wait(&mut acked);
        }
        let result = batch.ack();
        *acked += 1;
        self.turn.notify_all();
        result
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Published {
    pub id:       EventId,
    pub sequence: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivered {
    pub id:       EventId,
    pub sequence: u64,
    /// Delivery order: batch id, then position in the batch.
    pub order:    (u64, usize),
}

#[derive(Debug, Default)]
pub struct Outcome {
    pub published: Vec<Published>,
    /// Sorted by delivery order.
    pub delivered: Vec<Delivered>,
}

impl Outcome {
    /// Panics unless every published event was delivered exactly once with
    /// its sequence number and each producer's events arrived in order.
    pub fn assert_exactly_once(&self) {
        let published: HashMap<EventId, u64> =
            self.published.iter().map(|p| (p.id, p.sequence)).collect();
        assert_eq!(published.len(), self.published.len(), "sequence reused");

        let mut seen = HashMap::new();
        for d in &self.delivered {
            assert_eq!(published.get(&d.id), Some(&d.sequence), "unknown event {d:?}");
            assert!(seen.insert(d.id, d.sequence).is_none(), "duplicate {d:?}");
        }
        assert_eq!(seen.len(), published.len(), "events lost");
        self.assert_producer_order();
    }

    pub fn assert_producer_order(&self) {
        let mut last: HashMap<u32, u32> = HashMap::new();
        for d in &self.delivered {
            if let Some(prev) = last.insert(d.id.producer, d.id.index) {
                assert!(
                    d.id.index > prev,
                    "producer {} delivered {} after {prev}",
                    d.id.producer,
                    d.id.index
                );
            }
        }
        let sequences: Vec<u64> = self.delivered.iter().map(|d| d.sequence).collect();
        assert!(sequences.is_sorted(), "delivery out of sequence order");
    }
}

/// Publish `config.events` from producer threads while consumer threads
/// drain and acknowledge them.
pub fn run_scenario<Q: EventQueue>(queue: &Q, config: &ScenarioConfig) -> Outcome {
    let sequencer = AckSequencer::default();
    let delivered_count = AtomicUsize::new(0);

    let (published, mut delivered) = thread::scope(|s| {
        let producers: Vec<_> = (0..config.producers)
            .map(|id| {
                let producer = queue.producer();
                s.spawn(move || produce(&producer, config, id))
            })
            .collect();
        let consumers: Vec<_> = (0..config.consumers)
            .map(|_| {
                let consumer = queue.consumer();
                let sequencer = &sequencer;
                let delivered_count = &delivered_count;
                s.spawn(move || {
                    consume(&consumer, config, sequencer, delivered_count, config.events)
                })
            })
            .collect();

        let published: Vec<Published> = producers
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let delivered: Vec<Delivered> = consumers
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        (published, delivered)
    });

    delivered.sort_by_key(|d| d.order);
    Outcome {
        published,
        delivered,
    }
}

pub fn produce<P: EventProducer>(producer: &P, config: &ScenarioConfig, id: usize) -> Vec<Published> {
    let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(id as u64 + 1));
    (0..config.events_for(id))
        .map(|index| {
            let event = EventId {
                producer: u32::try_from(id).unwrap(),
                index:    u32::try_from(index).unwrap(),
            };
            let sequence = producer
                .publish(encode_event(event, &mut rng, config.max_payload))
                .unwrap();
            Published {
                id: event,
                sequence,
            }
        })
        .collect()
}

/// Consume and acknowledge until `target` events were delivered in total.
pub fn consume<C: EventConsumer>(
    consumer: &C,
    config: &ScenarioConfig,
    sequencer: &AckSequencer,
    delivered_count: &AtomicUsize,
    target: usize,
) -> Vec<Delivered> {
    let mut delivered = Vec::new();
    while delivered_count.load(Ordering::Acquire) < target {
        let batch = match consumer.get_with(config.batch_size, &Wait::timeout(POLL)) {
            Ok(batch) => batch,
            Err(QueueError::Timeout) => continue,
            Err(e) => panic!("get failed: {e}"),
        };
        for (i, entry) in batch.entries().iter().enumerate() {
            delivered.push(Delivered {
                id:       decode_event(&entry.payload),
                sequence: entry.sequence,
                order:    (batch.id(), i),
            });
        }
        delivered_count.fetch_add(batch.entries().len(), Ordering::AcqRel);
        sequencer.ack(&batch).unwrap();
    }
    delivered
}
