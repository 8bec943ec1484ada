// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! emoncms input API adapter.
//!
//! Posts one form-encoded request per device to `{endpoint}/input/post` with
//! the fields `node`, `apikey` and `fulljson`.

use crate::config::EmoncmsConfig;
use crate::sink::{Sink, SinkError};
use crate::value::MetricMap;
use async_trait::async_trait;
use reqwest::Client;

/// Sink posting to an emoncms instance.
#[derive(Debug, Clone)]
pub struct EmoncmsSink {
    url: String,
    apikey: String,
    enabled: bool,
    client: Client,
}

impl EmoncmsSink {
    /// Build the sink and its HTTP client.
    pub fn new(config: &EmoncmsConfig) -> Result<Self, SinkError> {
        let client = Client::builder().timeout(config.timeout()).build()?;

        Ok(Self {
            url: input_url(&config.endpoint),
            apikey: config.apikey.clone(),
            enabled: config.enabled,
            client,
        })
    }

    /// Full URL of the input endpoint.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

fn input_url(endpoint: &str) -> String {
    format!("{}/input/post", endpoint.trim_end_matches('/'))
}

#[async_trait]
impl Sink for EmoncmsSink {
    async fn deliver(&self, device: &str, metrics: &MetricMap) -> Result<(), SinkError> {
        if !self.enabled {
            tracing::info!(device, "emoncms disabled, not posting");
            return Ok(());
        }

        let fulljson = serde_json::to_string(metrics)?;
        tracing::debug!(device, "POST {} {}", self.url, fulljson);

        let response = self
            .client
            .post(&self.url)
            .form(&[
                ("node", device),
                ("apikey", self.apikey.as_str()),
                ("fulljson", fulljson.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(())
    }
}
