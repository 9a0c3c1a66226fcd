// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # Event Relay
//!
//! Reshapes product analytics events into a collector's event schema and delivers them in
//! batches, retrying failed deliveries with exponential backoff.
//!
//! ## Pipeline
//!
//! ```text
//!   event ──> PayloadMapper ──> EventBuffer ──(size | interval)──> Batch
//!                                                                  │
//!                                                                  v
//!                                        RetryDispatcher ──> POST collector
//!                                              ^                   │ failure
//!                                              └── retry scheduler ┘
//! ```
//!
//! - [`path`]: dotted path reads and writes over `serde_json::Value`
//! - [`mapping`]: declarative mapping tables and rule selection
//! - [`rudderstack`]: built-in tables for the RudderStack event spec
//! - [`buffer`]: size and time triggered batching
//! - [`dispatcher`]: HTTP delivery with backoff and the dispatcher service
//! - [`relay`]: wiring of all of the above and graceful shutdown

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod batch;
pub mod buffer;
pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod http_utils;
pub mod mapping;
pub mod path;
pub mod relay;
pub mod rudderstack;
pub mod write_key;
