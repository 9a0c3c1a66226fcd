// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Builds a reqwest client with optional proxy configuration and a per-request timeout.
/// A request exceeding `timeout` fails with a transport error.
pub fn build_client(
    proxy_url: Option<&str>,
    timeout: Duration,
) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder = reqwest::Client::builder().timeout(timeout);
    if let Some(proxy) = proxy_url {
        builder = builder.proxy(reqwest::Proxy::https(proxy)?);
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_client_without_proxy() {
        assert!(build_client(None, Duration::from_secs(30)).is_ok());
    }

    #[test]
    fn test_build_client_with_proxy() {
        assert!(build_client(Some("http://proxy.internal:3128"), Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn test_build_client_rejects_invalid_proxy() {
        assert!(build_client(Some("not a url"), Duration::from_secs(5)).is_err());
    }
}
