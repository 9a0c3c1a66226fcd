// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delivery of flushed batches to the collector with exponential backoff.
//!
//! Every batch goes through the same state machine:
//!
//! ```text
//!   PENDING ──success──> DELIVERED
//!      │
//!      ├──failure, attempt < cap──> SCHEDULED ──delay──> PENDING (attempt + 1)
//!      │
//!      └──failure, attempt >= cap──> ABANDONED
//! ```
//!
//! [`RetryDispatcher`] performs one attempt and decides the transition. The
//! [`DispatcherService`] runs each attempt on its own task so a slow collector never holds
//! up other batches, and [`TokioRetryScheduler`] feeds scheduled retries back to it.

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::batch::Batch;
use crate::errors::DeliveryError;
use crate::write_key::WriteKey;

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(3000);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl RetryPolicy {
    /// `base_delay * 2^attempt`, saturating.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    #[must_use]
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}

/// Result of a single [`RetryDispatcher::deliver`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// Redelivery of the batch as `attempt` after `delay`.
    Scheduled { attempt: u32, delay: Duration },
    /// Dropped after `attempts` failed deliveries.
    Abandoned { attempts: u32 },
}

/// Deferred redelivery. Implementations hand `batch` back to a dispatcher once `delay`
/// has elapsed, without blocking the caller.
pub trait RetryScheduler: Send + Sync {
    fn schedule(&self, batch: Batch, delay: Duration);
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub endpoint: String,
    pub write_key: WriteKey,
    pub retry_policy: RetryPolicy,
    pub client: reqwest::Client,
}

#[derive(Serialize)]
struct BatchRequest<'a> {
    batch: &'a [Value],
    #[serde(rename = "sentAt")]
    sent_at: String,
}

pub struct RetryDispatcher {
    client: reqwest::Client,
    endpoint: String,
    write_key: WriteKey,
    retry_policy: RetryPolicy,
    scheduler: Arc<dyn RetryScheduler>,
}

impl RetryDispatcher {
    #[must_use]
    pub fn new(config: DispatcherConfig, scheduler: Arc<dyn RetryScheduler>) -> Self {
        Self {
            client: config.client,
            endpoint: config.endpoint,
            write_key: config.write_key,
            retry_policy: config.retry_policy,
            scheduler,
        }
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry_policy
    }

    /// Sends `batch` once. On failure either schedules the next attempt or abandons the
    /// batch when the attempt cap is reached. Never blocks on the retry delay.
    pub async fn deliver(&self, batch: Batch) -> DeliveryOutcome {
        let attempt = batch.attempt();
        let err = match self.send(&batch).await {
            Ok(()) => {
                debug!(
                    "Delivered batch {} ({} items, attempt {})",
                    batch.id(),
                    batch.len(),
                    attempt
                );
                return DeliveryOutcome::Delivered;
            }
            Err(err) => err,
        };

        if self.retry_policy.is_exhausted(attempt) {
            let attempts = attempt.saturating_add(1);
            error!(
                "Abandoning batch {} ({} items) after {} attempts: {}",
                batch.id(),
                batch.len(),
                attempts,
                err
            );
            return DeliveryOutcome::Abandoned { attempts };
        }

        let delay = self.retry_policy.delay_for(attempt);
        let next = batch.next_attempt();
        let next_attempt = next.attempt();
        warn!(
            "Failed to deliver batch {} (attempt {}): {}. Retrying in {} ms",
            batch.id(),
            attempt,
            err,
            delay.as_millis()
        );
        self.scheduler.schedule(next, delay);
        DeliveryOutcome::Scheduled {
            attempt: next_attempt,
            delay,
        }
    }

    fn headers(&self) -> Result<HeaderMap, DeliveryError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(AUTHORIZATION, self.write_key.authorization()?);
        Ok(headers)
    }

    async fn send(&self, batch: &Batch) -> Result<(), DeliveryError> {
        let headers = self.headers()?;
        let body = serde_json::to_vec(&BatchRequest {
            batch: batch.items(),
            sent_at: OffsetDateTime::now_utc().format(&Rfc3339)?,
        })?;

        let resp = self
            .client
            .post(&self.endpoint)
            .headers(headers)
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(DeliveryError::Status { status, body })
    }
}

#[derive(Debug)]
pub enum DispatcherCommand {
    Deliver(Batch),
    Shutdown,
}

#[derive(Clone, Debug)]
pub struct DispatcherHandle {
    tx: mpsc::UnboundedSender<DispatcherCommand>,
}

impl DispatcherHandle {
    pub fn submit(&self, batch: Batch) -> Result<(), mpsc::error::SendError<DispatcherCommand>> {
        self.tx.send(DispatcherCommand::Deliver(batch))
    }

    pub fn shutdown(&self) -> Result<(), mpsc::error::SendError<DispatcherCommand>> {
        self.tx.send(DispatcherCommand::Shutdown)
    }
}

/// Sleeps on a spawned task, then resubmits the batch to the dispatcher service.
pub struct TokioRetryScheduler {
    handle: DispatcherHandle,
}

impl TokioRetryScheduler {
    #[must_use]
    pub fn new(handle: DispatcherHandle) -> Self {
        Self { handle }
    }
}

impl RetryScheduler for TokioRetryScheduler {
    fn schedule(&self, batch: Batch, delay: Duration) {
        let handle = self.handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let id = batch.id();
            if handle.submit(batch).is_err() {
                warn!("Dispatcher stopped, dropping scheduled retry of batch {}", id);
            }
        });
    }
}

pub struct DispatcherService {
    dispatcher: Arc<RetryDispatcher>,
    rx: mpsc::UnboundedReceiver<DispatcherCommand>,
}

impl DispatcherService {
    #[must_use]
    pub fn new(config: DispatcherConfig) -> (Self, DispatcherHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = DispatcherHandle { tx };

        let scheduler = Arc::new(TokioRetryScheduler::new(handle.clone()));
        let dispatcher = Arc::new(RetryDispatcher::new(config, scheduler));

        (Self { dispatcher, rx }, handle)
    }

    pub async fn run(mut self) {
        debug!("Dispatcher service started");
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                command = self.rx.recv() => match command {
                    Some(DispatcherCommand::Deliver(batch)) => {
                        let dispatcher = Arc::clone(&self.dispatcher);
                        in_flight.spawn(async move { dispatcher.deliver(batch).await });
                    }
                    Some(DispatcherCommand::Shutdown) | None => {
                        debug!("Dispatcher service shutting down");
                        break;
                    }
                },
                Some(result) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = result {
                        error!("Delivery task failed: {}", e);
                    }
                }
            }
        }

        // Stop accepting work so retries scheduled from here on are dropped.
        self.rx.close();
        while let Some(result) = in_flight.join_next().await {
            if let Err(e) = result {
                error!("Delivery task failed: {}", e);
            }
        }

        debug!("Dispatcher service stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};
    use serde_json::json;
    use std::sync::Mutex;
    use tracing_test::traced_test;

    const WRITE_KEY: &str = "mock-write-key";
    // base64("mock-write-key:")
    const AUTHORIZATION_VALUE: &str = "Basic bW9jay13cml0ZS1rZXk6";

    #[derive(Default)]
    struct RecordingScheduler {
        scheduled: Mutex<Vec<(Batch, Duration)>>,
    }

    impl RetryScheduler for RecordingScheduler {
        fn schedule(&self, batch: Batch, delay: Duration) {
            self.scheduled.lock().unwrap().push((batch, delay));
        }
    }

    fn dispatcher_config(endpoint: String) -> DispatcherConfig {
        DispatcherConfig {
            endpoint,
            write_key: WriteKey::new(WRITE_KEY),
            retry_policy: RetryPolicy::default(),
            client: reqwest::Client::new(),
        }
    }

    fn recording_dispatcher(endpoint: String) -> (RetryDispatcher, Arc<RecordingScheduler>) {
        let scheduler = Arc::new(RecordingScheduler::default());
        let dispatcher = RetryDispatcher::new(dispatcher_config(endpoint), scheduler.clone());
        (dispatcher, scheduler)
    }

    fn batch_at_attempt(attempt: u32) -> Batch {
        let mut batch = Batch::new(vec![json!({"type": "track", "event": "a"})], 32);
        for _ in 0..attempt {
            batch = batch.next_attempt();
        }
        batch
    }

    #[test]
    fn test_delay_doubles_per_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_millis(3000));
        assert_eq!(policy.delay_for(1), Duration::from_millis(6000));
        assert_eq!(policy.delay_for(9), Duration::from_millis(1_536_000));
        assert_eq!(policy.delay_for(14), Duration::from_millis(49_152_000));
    }

    #[test]
    fn test_delay_saturates() {
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(u64::MAX / 2),
            max_attempts: 100,
        };
        assert_eq!(policy.delay_for(40), Duration::MAX);
    }

    #[tokio::test]
    async fn test_deliver_success() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/batch")
            .match_header("Content-Type", "application/json")
            .match_header("Authorization", AUTHORIZATION_VALUE)
            .match_body(Matcher::AllOf(vec![
                Matcher::PartialJson(json!({
                    "batch": [{"type": "track", "event": "a"}]
                })),
                Matcher::Regex(r#""sentAt":"\d{4}-\d{2}-\d{2}T"#.to_string()),
            ]))
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let (dispatcher, scheduler) = recording_dispatcher(format!("{}/v1/batch", server.url()));
        let outcome = dispatcher.deliver(batch_at_attempt(0)).await;

        assert_eq!(outcome, DeliveryOutcome::Delivered);
        assert!(scheduler.scheduled.lock().unwrap().is_empty());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_failed_first_attempt_schedules_retry() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/batch")
            .with_status(500)
            .with_body("Internal Server Error")
            .expect(1)
            .create_async()
            .await;

        let (dispatcher, scheduler) = recording_dispatcher(format!("{}/v1/batch", server.url()));
        let batch = batch_at_attempt(0);
        let id = batch.id();
        let outcome = dispatcher.deliver(batch).await;

        assert_eq!(
            outcome,
            DeliveryOutcome::Scheduled {
                attempt: 1,
                delay: Duration::from_millis(3000)
            }
        );
        let scheduled = scheduler.scheduled.lock().unwrap();
        assert_eq!(scheduled.len(), 1);
        assert_eq!(scheduled[0].0.id(), id);
        assert_eq!(scheduled[0].0.attempt(), 1);
        assert_eq!(scheduled[0].1, Duration::from_millis(3000));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_backoff_grows_with_attempt() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/batch")
            .with_status(503)
            .create_async()
            .await;

        let (dispatcher, scheduler) = recording_dispatcher(format!("{}/v1/batch", server.url()));
        for attempt in [3, 9, 14] {
            dispatcher.deliver(batch_at_attempt(attempt)).await;
        }

        let delays: Vec<_> = scheduler
            .scheduled
            .lock()
            .unwrap()
            .iter()
            .map(|(batch, delay)| (batch.attempt(), *delay))
            .collect();
        assert_eq!(
            delays,
            vec![
                (4, Duration::from_millis(24_000)),
                (10, Duration::from_millis(1_536_000)),
                (15, Duration::from_millis(49_152_000)),
            ]
        );
    }

    #[tokio::test]
    #[traced_test]
    async fn test_attempt_at_cap_is_abandoned() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/batch")
            .with_status(500)
            .expect(1)
            .create_async()
            .await;

        let (dispatcher, scheduler) = recording_dispatcher(format!("{}/v1/batch", server.url()));
        let outcome = dispatcher.deliver(batch_at_attempt(15)).await;

        assert_eq!(outcome, DeliveryOutcome::Abandoned { attempts: 16 });
        assert!(scheduler.scheduled.lock().unwrap().is_empty());
        assert!(logs_contain("Abandoning batch"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_transport_error_schedules_retry() {
        // Nothing listens on port 1.
        let (dispatcher, scheduler) =
            recording_dispatcher("http://127.0.0.1:1/v1/batch".to_string());
        let outcome = dispatcher.deliver(batch_at_attempt(2)).await;

        assert_eq!(
            outcome,
            DeliveryOutcome::Scheduled {
                attempt: 3,
                delay: Duration::from_millis(12_000)
            }
        );
        assert_eq!(scheduler.scheduled.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_service_retries_until_delivered() {
        let mut server = Server::new_async().await;
        let failing = server
            .mock("POST", "/v1/batch")
            .with_status(500)
            .expect_at_least(1)
            .create_async()
            .await;

        let config = DispatcherConfig {
            retry_policy: RetryPolicy {
                base_delay: Duration::from_millis(1),
                max_attempts: 15,
            },
            ..dispatcher_config(format!("{}/v1/batch", server.url()))
        };
        let (service, handle) = DispatcherService::new(config);
        let service_task = tokio::spawn(service.run());

        handle.submit(batch_at_attempt(0)).unwrap();

        let wait = async {
            while !failing.matched_async().await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .expect("timed out waiting for first attempt");

        failing.remove_async().await;
        let succeeding = server
            .mock("POST", "/v1/batch")
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let wait = async {
            while !succeeding.matched_async().await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .expect("timed out waiting for retry");

        handle.shutdown().unwrap();
        service_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_service_stops_on_shutdown() {
        let (service, handle) =
            DispatcherService::new(dispatcher_config("http://127.0.0.1:1".to_string()));
        let service_task = tokio::spawn(service.run());

        handle.shutdown().unwrap();
        tokio::time::timeout(Duration::from_secs(1), service_task)
            .await
            .expect("service did not stop")
            .unwrap();
        assert!(handle.submit(batch_at_attempt(0)).is_err());
    }
}
