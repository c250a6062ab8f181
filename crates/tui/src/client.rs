use std::time::Duration;

use mend_core::diagnostics::{ActionReport, Diagnostics};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// Actions block until the server finishes a full resolution run.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Error)]
pub enum ConsoleError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
}

#[derive(Debug, Serialize)]
struct OverrideRequest<'a> {
    url: &'a str,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Clone)]
pub struct ConsoleClient {
    base_url: String,
    http: Client,
}

impl ConsoleClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ConsoleError> {
        let http = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn diagnostics(&self) -> Result<Diagnostics, ConsoleError> {
        let response = self.http.get(self.endpoint("/api/debug/db")).send().await?;
        Ok(checked(response).await?.json().await?)
    }

    pub async fn submit_override(&self, url: &str) -> Result<ActionReport, ConsoleError> {
        let response = self
            .http
            .post(self.endpoint("/api/debug/config"))
            .json(&OverrideRequest { url })
            .send()
            .await?;
        Ok(checked(response).await?.json().await?)
    }

    pub async fn retry(&self) -> Result<ActionReport, ConsoleError> {
        let response = self.http.get(self.endpoint("/api/debug/fix")).send().await?;
        Ok(checked(response).await?.json().await?)
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

async fn checked(response: Response) -> Result<Response, ConsoleError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(rejection(status, &body))
}

fn rejection(status: StatusCode, body: &str) -> ConsoleError {
    let message = serde_json::from_str::<ErrorBody>(body)
        .map(|parsed| parsed.error)
        .unwrap_or_else(|_| {
            status
                .canonical_reason()
                .unwrap_or("unexpected status")
                .to_string()
        });
    ConsoleError::Rejected {
        status: status.as_u16(),
        message,
    }
}
