// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Identifier shared by every delivery attempt of the same batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BatchId(Uuid);

impl BatchId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// An ordered, immutable group of mapped events flushed from the buffer together.
///
/// Cloning is cheap: the items are shared between every retry of the batch.
#[derive(Debug, Clone)]
pub struct Batch {
    id: BatchId,
    items: Arc<[Value]>,
    size_bytes: usize,
    attempt: u32,
}

impl Batch {
    #[must_use]
    pub fn new(items: Vec<Value>, size_bytes: usize) -> Self {
        Self {
            id: BatchId::new(),
            items: items.into(),
            size_bytes,
            attempt: 0,
        }
    }

    #[must_use]
    pub fn id(&self) -> BatchId {
        self.id
    }

    #[must_use]
    pub fn items(&self) -> &[Value] {
        &self.items
    }

    /// Sum of the serialized sizes of the items, as accounted by the buffer.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    /// Zero on the first delivery.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// The same batch, scheduled for its next delivery attempt.
    #[must_use]
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt.saturating_add(1),
            ..self.clone()
        }
    }
}
