//! HTTP JSON-RPC ledger client backed by `reqwest`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use chainplace_core::client::parse_hex_u64;
use chainplace_core::{ChainError, FilterQuery, Header, LedgerClient, Log};

use crate::error::TransportError;
use crate::request::{filter_params, JsonRpcRequest, JsonRpcResponse, RpcHeader, RpcLog};
use crate::retry::{RetryConfig, RetryPolicy};

/// Configuration for [`HttpLedgerClient`].
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub retry: RetryConfig,
    pub request_timeout: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Ledger client speaking Ethereum JSON-RPC over HTTP.
pub struct HttpLedgerClient {
    url: String,
    http: reqwest::Client,
    retry: RetryPolicy,
    request_timeout: Duration,
    next_id: AtomicU64,
}

impl HttpLedgerClient {
    pub fn new(url: impl Into<String>, config: HttpClientConfig) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            url: url.into(),
            http,
            retry: RetryPolicy::new(config.retry),
            request_timeout: config.request_timeout,
            next_id: AtomicU64::new(1),
        })
    }

    /// Create with default configuration.
    pub fn default_for(url: impl Into<String>) -> Result<Self, TransportError> {
        Self::new(url, HttpClientConfig::default())
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn send_once(&self, req: &JsonRpcRequest) -> Result<Value, TransportError> {
        let resp = self
            .http
            .post(&self.url)
            .json(req)
            .send()
            .await
            .map_err(|e| self.map_reqwest(e))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::Http(format!("HTTP {status}: {body}")));
        }

        let body: JsonRpcResponse = resp.json().await.map_err(|e| self.map_reqwest(e))?;
        if let Some(err) = body.error {
            return Err(TransportError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        Ok(body.result.unwrap_or(Value::Null))
    }

    fn map_reqwest(&self, e: reqwest::Error) -> TransportError {
        if e.is_timeout() {
            TransportError::Timeout {
                ms: self.request_timeout.as_millis() as u64,
            }
        } else {
            TransportError::from(e)
        }
    }

    /// Send `method` and decode the result, retrying transient failures.
    async fn call<T: DeserializeOwned>(
        &self,
        method: &'static str,
        params: Value,
    ) -> Result<T, TransportError> {
        let req = JsonRpcRequest::new(self.next_id.fetch_add(1, Ordering::Relaxed), method, params);

        let mut attempt = 0u32;
        let value = loop {
            attempt += 1;
            match self.send_once(&req).await {
                Ok(value) => break value,
                Err(e) if e.is_retryable() => match self.retry.next_delay(attempt) {
                    Some(delay) => {
                        tracing::debug!(
                            method,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "retrying request"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(e),
                },
                Err(e) => return Err(e),
            }
        };

        if value.is_null() {
            return Err(TransportError::InvalidResponse {
                method,
                reason: "null result".into(),
            });
        }
        Ok(serde_json::from_value(value)?)
    }
}

#[async_trait]
impl LedgerClient for HttpLedgerClient {
    async fn chain_id(&self) -> Result<u64, ChainError> {
        let hex: String = self.call("eth_chainId", json!([])).await?;
        parse_hex_u64(&hex)
    }

    async fn block_number(&self) -> Result<u64, ChainError> {
        let hex: String = self.call("eth_blockNumber", json!([])).await?;
        parse_hex_u64(&hex)
    }

    async fn latest_header(&self) -> Result<Header, ChainError> {
        let header: RpcHeader = self
            .call("eth_getBlockByNumber", json!(["latest", false]))
            .await?;
        header.try_into()
    }

    async fn filter_logs(&self, query: &FilterQuery) -> Result<Vec<Log>, ChainError> {
        let logs: Vec<RpcLog> = self.call("eth_getLogs", filter_params(query)).await?;
        logs.into_iter().map(Log::try_from).collect()
    }
}
