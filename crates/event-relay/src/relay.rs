// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wiring of mapper, buffer, flush timer and dispatcher into a running relay.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::batch::Batch;
use crate::buffer::{EventBuffer, FlushCallback, FlushReason};
use crate::config::RelayConfig;
use crate::dispatcher::{DispatcherConfig, DispatcherHandle, DispatcherService};
use crate::errors::RelayError;
use crate::http_utils::build_client;
use crate::mapping::PayloadMapper;
use crate::rudderstack;
use crate::write_key::WriteKey;

/// Per-event entry point. Cheap to clone and safe to share between producers.
#[derive(Clone)]
pub struct EventRelay {
    mapper: Arc<PayloadMapper>,
    buffer: Arc<EventBuffer>,
}

impl EventRelay {
    #[must_use]
    pub fn new(mapper: Arc<PayloadMapper>, buffer: Arc<EventBuffer>) -> Self {
        Self { mapper, buffer }
    }

    /// Maps `event` and buffers the payload. Delivery happens in the background and its
    /// outcome is never reported back to the caller.
    pub fn process_event(&self, event: &Value) {
        let payload = self.mapper.map_event(event);
        let size_bytes = serde_json::to_vec(&payload).map_or(0, |bytes| bytes.len());
        self.buffer.add(payload, size_bytes);
    }

    #[must_use]
    pub fn buffer(&self) -> &Arc<EventBuffer> {
        &self.buffer
    }
}

/// Loads the mapping rules named by the configuration, or the built-in RudderStack tables.
pub fn mapper_from_config(config: &RelayConfig) -> Result<PayloadMapper, RelayError> {
    match &config.rules_path {
        Some(path) => {
            let json = std::fs::read_to_string(path)?;
            let mapper = PayloadMapper::from_json(&json)?;
            info!("Loaded mapping rules from {}", path.display());
            Ok(mapper)
        }
        None => Ok(rudderstack::default_mapper()),
    }
}

pub struct RunningRelay {
    relay: EventRelay,
    dispatcher: DispatcherHandle,
    dispatcher_task: JoinHandle<()>,
    timer_task: JoinHandle<()>,
    cancel: CancellationToken,
}

impl RunningRelay {
    /// Spawns the dispatcher service and the flush timer. Must be called from within a
    /// tokio runtime.
    pub fn start(config: &RelayConfig, mapper: PayloadMapper) -> Result<Self, RelayError> {
        let client = build_client(config.https_proxy.as_deref(), config.request_timeout())?;
        let (service, dispatcher) = DispatcherService::new(DispatcherConfig {
            endpoint: config.data_plane_url.clone(),
            write_key: WriteKey::new(config.write_key.as_str()),
            retry_policy: config.retry_policy(),
            client,
        });
        let dispatcher_task = tokio::spawn(service.run());

        let submit_handle = dispatcher.clone();
        let on_flush: FlushCallback = Arc::new(move |batch: Batch| {
            let id = batch.id();
            if submit_handle.submit(batch).is_err() {
                error!("Dispatcher stopped, dropping batch {}", id);
            }
        });
        let buffer = Arc::new(EventBuffer::new(config.buffer_config(), on_flush));

        let cancel = CancellationToken::new();
        let timer_task = buffer.start_flush_timer(cancel.clone());

        debug!(
            "Relay started: flush at {} bytes or every {} s, up to {} attempts",
            config.buffer_limit_bytes, config.flush_interval_secs, config.max_attempts
        );

        Ok(Self {
            relay: EventRelay::new(Arc::new(mapper), buffer),
            dispatcher,
            dispatcher_task,
            timer_task,
            cancel,
        })
    }

    #[must_use]
    pub fn relay(&self) -> EventRelay {
        self.relay.clone()
    }

    /// Flushes pending events and waits up to `grace` for in-flight deliveries. Retries
    /// still waiting for their backoff delay are dropped.
    pub async fn shutdown(self, grace: Duration) {
        self.cancel.cancel();
        if let Err(e) = self.timer_task.await {
            error!("Flush timer failed: {}", e);
        }

        self.relay.buffer.flush_with_reason(FlushReason::Shutdown);
        if self.dispatcher.shutdown().is_err() {
            debug!("Dispatcher already stopped");
        }

        let mut dispatcher_task = self.dispatcher_task;
        match tokio::time::timeout(grace, &mut dispatcher_task).await {
            Ok(Ok(())) => debug!("Relay stopped"),
            Ok(Err(e)) => error!("Dispatcher task failed: {}", e),
            Err(_) => {
                warn!(
                    "In-flight deliveries did not finish within {} ms, aborting",
                    grace.as_millis()
                );
                dispatcher_task.abort();
            }
        }
    }
}
