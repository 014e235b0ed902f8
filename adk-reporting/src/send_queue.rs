// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded FIFO of events waiting to be sent. Enqueueing into a full
//! queue evicts the oldest event; flushing detaches the whole list at
//! once unless the queue is paused by a rate-limit deadline.

use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushMode {
    /// Return nothing while the queue is paused.
    RegardPause,
    /// Detach regardless of any pause deadline.
    DisregardPause,
}

struct Inner {
    events: VecDeque<Value>,
    pause_until_epoch_secs: u64,
}

pub struct SendQueue {
    inner: Mutex<Inner>,
    max_events: usize,
}

pub(crate) fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl SendQueue {
    pub fn new(max_events: usize) -> Self {
        assert!(max_events > 0);
        Self {
            inner: Mutex::new(Inner {
                events: VecDeque::with_capacity(max_events),
                pause_until_epoch_secs: 0,
            }),
            max_events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends `event`, evicting (and returning) the oldest event when
    /// the queue is already full.
    pub fn enqueue(&self, event: Value) -> Option<Value> {
        let mut inner = self.lock();
        let evicted = if inner.events.len() == self.max_events {
            inner.events.pop_front()
        } else {
            None
        };
        inner.events.push_back(event);
        evicted
    }

    /// Detaches and returns the entire queue, oldest first. Returns an
    /// empty vec when there is nothing queued, or when the queue is
    /// paused and `mode` honors the pause.
    pub fn flush(&self, mode: FlushMode) -> Vec<Value> {
        let mut inner = self.lock();
        if mode == FlushMode::RegardPause && epoch_secs() <= inner.pause_until_epoch_secs {
            return Vec::new();
        }
        inner.events.drain(..).collect()
    }

    /// Blocks flushing for `delay_secs` from now. Deadlines only ever
    /// move forward.
    pub fn pause_for(&self, delay_secs: u64) {
        let mut inner = self.lock();
        let deadline = epoch_secs() + delay_secs;
        inner.pause_until_epoch_secs = inner.pause_until_epoch_secs.max(deadline);
    }

    pub fn is_empty(&self) -> bool {
        self.lock().events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().events.len()
    }
}
