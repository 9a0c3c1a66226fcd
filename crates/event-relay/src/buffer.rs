// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Accumulates mapped payloads and hands them off in batches, either when their
//! cumulative serialized size reaches a limit or when the flush interval elapses.

use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::batch::Batch;

/// Receives every batch produced by a flush. Must not block.
pub type FlushCallback = Arc<dyn Fn(Batch) + Send + Sync>;

/// 0.1 MiB
pub const DEFAULT_LIMIT_BYTES: usize = 1024 * 1024 / 10;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferConfig {
    pub limit_bytes: usize,
    pub flush_interval: Duration,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            limit_bytes: DEFAULT_LIMIT_BYTES,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    Size,
    Interval,
    Manual,
    Shutdown,
}

#[derive(Debug, Default)]
struct Pending {
    items: Vec<Value>,
    size_bytes: usize,
}

impl Pending {
    fn take(&mut self) -> Option<Batch> {
        if self.items.is_empty() {
            return None;
        }
        let items = std::mem::take(&mut self.items);
        let size_bytes = std::mem::take(&mut self.size_bytes);
        Some(Batch::new(items, size_bytes))
    }
}

pub struct EventBuffer {
    config: BufferConfig,
    pending: Mutex<Pending>,
    on_flush: FlushCallback,
}

impl EventBuffer {
    #[must_use]
    pub fn new(config: BufferConfig, on_flush: FlushCallback) -> Self {
        Self {
            config,
            pending: Mutex::new(Pending::default()),
            on_flush,
        }
    }

    #[must_use]
    pub fn config(&self) -> BufferConfig {
        self.config
    }

    fn lock(&self) -> MutexGuard<'_, Pending> {
        // The pending state is always left consistent, so a poisoned lock is still usable.
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends `payload`. When the running total reaches the limit the whole pending
    /// sequence is snapshotted in the same critical section and flushed.
    pub fn add(&self, payload: Value, size_bytes: usize) {
        let batch = {
            let mut pending = self.lock();
            pending.items.push(payload);
            pending.size_bytes = pending.size_bytes.saturating_add(size_bytes);
            if pending.size_bytes >= self.config.limit_bytes {
                pending.take()
            } else {
                None
            }
        };

        if let Some(batch) = batch {
            self.dispatch(batch, FlushReason::Size);
        }
    }

    /// Flushes whatever is pending. Returns `false` when there was nothing to flush.
    pub fn flush(&self) -> bool {
        self.flush_with_reason(FlushReason::Manual)
    }

    pub fn flush_with_reason(&self, reason: FlushReason) -> bool {
        let batch = self.lock().take();
        match batch {
            Some(batch) => {
                self.dispatch(batch, reason);
                true
            }
            None => false,
        }
    }

    fn dispatch(&self, batch: Batch, reason: FlushReason) {
        debug!(
            "Flushing batch {} ({} items, {} bytes, reason: {:?})",
            batch.id(),
            batch.len(),
            batch.size_bytes(),
            reason
        );
        (self.on_flush)(batch);
    }

    /// Spawns a task flushing the buffer every `flush_interval` until `cancel` fires.
    pub fn start_flush_timer(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let buffer = Arc::clone(self);
        let period = self.config.flush_interval.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // discard first tick
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        buffer.flush_with_reason(FlushReason::Interval);
                    }
                    () = cancel.cancelled() => {
                        debug!("Flush timer stopped");
                        break;
                    }
                }
            }
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.lock().size_bytes
    }
}
