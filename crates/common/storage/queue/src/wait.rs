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

//! How long a caller is willing to wait for the writer or reader thread.
//!
//! A caller sends its request with a [`Ticket`] and blocks on the reply.
//! When its deadline passes or its [`CancelToken`] fires, the caller tries to
//! abandon the ticket. The worker thread claims the ticket before acting on
//! the request, so exactly one side wins: either the request is abandoned and
//! never executed, or it is claimed and the caller waits for its outcome.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
    time::{Duration, Instant},
};

use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use parking_lot::Mutex;

use crate::{Result, error::QueueError};

/// How often worker threads sweep expired waiters and check timers.
pub(crate) const TICK_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitMode {
    Forever,
    Until(Instant),
    NonBlocking,
}

/// Wait policy for a publish or get.
#[derive(Debug, Clone)]
pub struct Wait {
    mode:   WaitMode,
    cancel: Option<CancelToken>,
}

impl Default for Wait {
    fn default() -> Self { Self::forever() }
}

impl Wait {
    /// Block until the operation completes or the queue closes.
    #[must_use]
    pub const fn forever() -> Self {
        Self {
            mode:   WaitMode::Forever,
            cancel: None,
        }
    }

    /// Fail right away instead of waiting: `QueueFull` for publish,
    /// `Timeout` for get.
    #[must_use]
    pub const fn non_blocking() -> Self {
        Self {
            mode:   WaitMode::NonBlocking,
            cancel: None,
        }
    }

    #[must_use]
    pub fn timeout(timeout: Duration) -> Self {
        Instant::now()
            .checked_add(timeout)
            .map_or_else(Self::forever, Self::until)
    }

    #[must_use]
    pub const fn until(deadline: Instant) -> Self {
        Self {
            mode:   WaitMode::Until(deadline),
            cancel: None,
        }
    }

    /// Also give up when `token` is canceled.
    #[must_use]
    pub fn cancel_on(mut self, token: &CancelToken) -> Self {
        self.cancel = Some(token.clone());
        self
    }

    #[must_use]
    pub const fn is_non_blocking(&self) -> bool { matches!(self.mode, WaitMode::NonBlocking) }

    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        match self.mode {
            WaitMode::Until(deadline) => Some(deadline),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_canceled(&self) -> bool { self.cancel.as_ref().is_some_and(CancelToken::is_canceled) }

    /// The error a waiter gets when its wait ends without a result, or `None`
    /// while it may keep waiting.
    pub(crate) fn expired(&self, now: Instant) -> Option<QueueError> {
        if self.is_canceled() {
            return Some(QueueError::Canceled);
        }
        match self.mode {
            WaitMode::Until(deadline) if now >= deadline => Some(QueueError::Timeout),
            _ => None,
        }
    }
}

/// Cooperative cancellation shared between a caller and whoever cancels it.
///
/// Canceling drops the only sender of an internal channel; every clone of
/// the token observes the disconnect.
#[derive(Debug, Clone)]
pub struct CancelToken {
    trigger: Arc<Mutex<Option<Sender<()>>>>,
    signal:  Receiver<()>,
}

impl Default for CancelToken {
    fn default() -> Self { Self::new() }
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = channel::bounded(0);
        Self {
            trigger: Arc::new(Mutex::new(Some(tx))),
            signal:  rx,
        }
    }

    /// Cancel every wait using this token. Idempotent.
    pub fn cancel(&self) { self.trigger.lock().take(); }

    #[must_use]
    pub fn is_canceled(&self) -> bool {
        matches!(self.signal.try_recv(), Err(TryRecvError::Disconnected))
    }

    pub(crate) const fn signal(&self) -> &Receiver<()> { &self.signal }
}

const PENDING: u8 = 0;
const CLAIMED: u8 = 1;
const ABANDONED: u8 = 2;

/// Claim/abandon handshake between a waiting caller and a worker thread.
#[derive(Debug, Clone, Default)]
pub(crate) struct Ticket {
    state: Arc<AtomicU8>,
}

impl Ticket {
    pub(crate) fn new() -> Self { Self::default() }

    /// Worker side: take ownership of the request. `false` if the caller
    /// already gave up. Claiming an owned request again succeeds.
    pub(crate) fn claim(&self) -> bool {
        match self
            .state
            .compare_exchange(PENDING, CLAIMED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(current) => current == CLAIMED,
        }
    }

    /// Caller side: give up on the request. `false` if the worker already
    /// claimed it.
    pub(crate) fn abandon(&self) -> bool {
        self.state
            .compare_exchange(PENDING, ABANDONED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn is_abandoned(&self) -> bool { self.state.load(Ordering::Acquire) == ABANDONED }
}

/// Block on `reply` under `wait`.
///
/// On timeout or cancellation the ticket is abandoned; if the worker already
/// claimed it, the caller keeps waiting for the real outcome. A dropped reply
/// sender means the worker stopped.
pub(crate) fn await_reply<T>(
    reply: &Receiver<Result<T>>,
    ticket: &Ticket,
    wait: &Wait,
) -> Result<T> {
    let deadline = match wait.mode {
        WaitMode::Until(deadline) => channel::at(deadline),
        WaitMode::Forever | WaitMode::NonBlocking => channel::never(),
    };
    let never = channel::never();
    let cancel = wait.cancel.as_ref().map_or(&never, CancelToken::signal);

    let gave_up = crossbeam::select! {
        recv(reply) -> msg => return msg.unwrap_or(Err(QueueError::QueueClosed)),
        recv(cancel) -> _ => QueueError::Canceled,
        recv(deadline) -> _ => QueueError::Timeout,
    };

    if ticket.abandon() {
        return Err(gave_up);
    }
    reply.recv().unwrap_or(Err(QueueError::QueueClosed))
}
