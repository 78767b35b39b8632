//! RPC client to the coordinator: register, heartbeat, fetch targets, submit
//! results. Register and fetch-targets are fatal at startup once retries are
//! exhausted; a failed submission is dropped and logged, never queued.

use anyhow::{bail, Context, Result};
use reqwest::StatusCode;
use shared::api::{
    self, headers, CheckUpdatesQuery, CheckUpdatesResponse, HeartbeatResponse, RegisterRequest,
    RegisterResponse, ResultsSubmission, SubmitResultsResponse, TargetsResponse,
};
use shared::defaults::{RPC_BACKOFF_BASE_MS, RPC_BACKOFF_MAX_MS, RPC_MAX_RETRIES, RPC_TIMEOUT};
use shared::model::CheckResult;
use shared::utils::calculate_backoff_delay;
use tracing::{info, warn};

pub struct RpcClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl RpcClient {
    pub fn new(base_url: String, api_key: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(RPC_TIMEOUT)
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Registers with the coordinator, retrying on transport/5xx failure.
    /// Exhausting retries is fatal — the caller should abort startup.
    pub async fn register(&self, name: &str, location: &str) -> Result<RegisterResponse> {
        let body = RegisterRequest {
            name: name.to_string(),
            location: location.to_string(),
        };
        self.with_retries("register", || {
            self.http
                .post(self.url(api::endpoints::REGISTER))
                .header(headers::API_KEY, &self.api_key)
                .json(&body)
                .send()
        })
        .await
    }

    pub async fn heartbeat(&self, agent_id: &str) -> Result<HeartbeatResponse> {
        self.with_retries("heartbeat", || {
            self.http
                .post(self.url(api::endpoints::HEARTBEAT))
                .header(headers::API_KEY, &self.api_key)
                .header(headers::AGENT_ID, agent_id)
                .send()
        })
        .await
    }

    pub async fn fetch_targets(&self) -> Result<TargetsResponse> {
        self.with_retries("fetch_targets", || {
            self.http
                .get(self.url(api::endpoints::TARGETS))
                .header(headers::API_KEY, &self.api_key)
                .send()
        })
        .await
    }

    pub async fn check_updates(&self, last_checked: u64) -> Result<CheckUpdatesResponse> {
        let query = CheckUpdatesQuery { last_checked };
        self.with_retries("check_updates", || {
            self.http
                .get(self.url(api::endpoints::TARGETS_CHECK_UPDATES))
                .header(headers::API_KEY, &self.api_key)
                .query(&query)
                .send()
        })
        .await
    }

    /// Submits a batch of results. On final failure the batch is dropped: the
    /// caller logs and moves on rather than buffering for a later retry.
    pub async fn submit_results(
        &self,
        agent_id: &str,
        results: Vec<CheckResult>,
    ) -> Result<SubmitResultsResponse> {
        let body = ResultsSubmission { results };
        self.with_retries("submit_results", || {
            self.http
                .post(self.url(api::endpoints::RESULTS))
                .header(headers::API_KEY, &self.api_key)
                .header(headers::AGENT_ID, agent_id)
                .json(&body)
                .send()
        })
        .await
    }

    async fn with_retries<T, F, Fut>(&self, op: &str, build_request: F) -> Result<T>
    where
        T: serde::de::DeserializeOwned,
        F: Fn() -> Fut,
        Fut: std::future::IntoFuture<Output = reqwest::Result<reqwest::Response>>,
    {
        let mut last_error = None;
        for attempt in 0..RPC_MAX_RETRIES {
            match build_request().into_future().await {
                Ok(response) if response.status().is_success() => {
                    return response
                        .json::<T>()
                        .await
                        .with_context(|| format!("decoding {op} response"));
                }
                Ok(response) => {
                    let status = response.status();
                    last_error = Some(format!("{op} returned status {status}"));
                    if status == StatusCode::UNAUTHORIZED || status == StatusCode::BAD_REQUEST {
                        bail!(last_error.unwrap());
                    }
                }
                Err(e) => {
                    last_error = Some(format!("{op} transport error: {e}"));
                }
            }

            if attempt + 1 < RPC_MAX_RETRIES {
                let delay = calculate_backoff_delay(attempt, RPC_BACKOFF_BASE_MS, RPC_BACKOFF_MAX_MS);
                warn!(op, attempt, delay_ms = delay, "retrying RPC after failure");
                tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
            }
        }

        bail!(last_error.unwrap_or_else(|| format!("{op} failed with no recorded error")))
    }
}

/// Logs and drops a failed submission rather than retrying indefinitely —
/// the next tick's results supersede it anyway.
pub fn log_dropped_submission(target_count: usize, error: &anyhow::Error) {
    warn!(
        target_count,
        error = %error,
        "dropping unsent check results after exhausting retries"
    );
}

pub fn log_registered(agent_id: &str, server_id: &str) {
    info!(agent_id, server_id, "registered with coordinator");
}
