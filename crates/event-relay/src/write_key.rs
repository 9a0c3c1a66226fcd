// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Collector credential. The write key travels as the user name of an HTTP Basic
//! credential with an empty password.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::header::{HeaderValue, InvalidHeaderValue};
use std::fmt;

#[derive(Clone, PartialEq, Eq)]
pub struct WriteKey(String);

impl WriteKey {
    #[must_use]
    pub fn new(write_key: impl Into<String>) -> Self {
        Self(write_key.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `Basic base64(<write key>:)`, marked sensitive so it is redacted from header dumps.
    pub fn authorization(&self) -> Result<HeaderValue, InvalidHeaderValue> {
        let credential = STANDARD.encode(format!("{}:", self.0));
        let mut value = HeaderValue::from_str(&format!("Basic {credential}"))?;
        value.set_sensitive(true);
        Ok(value)
    }
}

impl fmt::Debug for WriteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WriteKey(****)")
    }
}
