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

//! Capability traits over the queue surface.
//!
//! Code that only needs to publish, consume and acknowledge can be written
//! against these traits and driven by any conforming implementation.

use bytes::Bytes;

use crate::{Batch, Consumer, Producer, Queue, Result, frame::Entry, wait::Wait};

pub trait EventQueue: Send + Sync {
    type Producer: EventProducer;
    type Consumer: EventConsumer;

    fn producer(&self) -> Self::Producer;

    fn consumer(&self) -> Self::Consumer;

    /// Stop the queue. Idempotent.
    ///
    /// # Errors
    ///
    /// The first failure met while shutting down.
    fn close(&self) -> Result<()>;
}

pub trait EventProducer: Clone + Send + 'static {
    /// Append `payload` and return its sequence number.
    ///
    /// # Errors
    ///
    /// Backpressure, deadline, cancellation, close or write failures.
    fn publish_with(&self, payload: Bytes, wait: &Wait) -> Result<u64>;

    /// # Errors
    ///
    /// See [`Self::publish_with`].
    fn publish(&self, payload: Bytes) -> Result<u64> { self.publish_with(payload, &Wait::forever()) }
}

pub trait EventConsumer: Clone + Send + 'static {
    type Batch: EventBatch;

    /// Next batch of at most `max_items` frames, 0 for the default size.
    ///
    /// # Errors
    ///
    /// Deadline, cancellation, close or read failures.
    fn get_with(&self, max_items: usize, wait: &Wait) -> Result<Self::Batch>;

    /// # Errors
    ///
    /// See [`Self::get_with`].
    fn get(&self, max_items: usize) -> Result<Self::Batch> { self.get_with(max_items, &Wait::forever()) }
}

pub trait EventBatch: Send {
    /// Delivery-order id: consecutive from 0 for each opened queue.
    fn id(&self) -> u64;

    fn entries(&self) -> &[Entry];

    /// # Errors
    ///
    /// Out-of-order acknowledgment or a closed queue.
    fn ack(&self) -> Result<()>;
}

impl EventQueue for Queue {
    type Consumer = Consumer;
    type Producer = Producer;

    fn producer(&self) -> Producer { Self::producer(self) }

    fn consumer(&self) -> Consumer { Self::consumer(self) }

    fn close(&self) -> Result<()> { Self::close(self) }
}

impl EventProducer for Producer {
    fn publish_with(&self, payload: Bytes, wait: &Wait) -> Result<u64> { Self::publish_with(self, payload, wait) }
}

impl EventConsumer for Consumer {
    type Batch = Batch;

    fn get_with(&self, max_items: usize, wait: &Wait) -> Result<Batch> { Self::get_with(self, max_items, wait) }
}

impl EventBatch for Batch {
    fn id(&self) -> u64 { Self::id(self) }

    fn entries(&self) -> &[Entry] { Self::entries(self) }

    fn ack(&self) -> Result<()> { Self::ack(self) }
}
