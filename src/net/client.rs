//! HTTP client for the backend REST API.

use color_eyre::{eyre::eyre, Result};
use std::time::Duration;
use url::Url;
use uuid::Uuid;

use crate::cache::FetchedResponse;
use crate::config::Config;

use super::types::{PushSubscription, SubmitReceipt};

/// How a failed exchange should be treated by retry machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
  /// Network unreachable, timeout, or a 5xx response. Worth retrying.
  Transient,
  /// The server rejected the request (4xx). Retrying cannot help.
  Permanent,
}

/// Outcome of submitting one queued action.
#[derive(Debug)]
pub enum SubmitOutcome {
  /// The server confirmed the action.
  Applied(Option<SubmitReceipt>),
  /// The submission failed; `kind` decides retry versus dead-letter.
  Failed { kind: FailureKind, error: String },
}

/// Thin client over the backend REST contract.
#[derive(Clone)]
pub struct ApiClient {
  http: reqwest::Client,
  base_url: Url,
  token: String,
  probe_timeout: Duration,
}

impl ApiClient {
  pub fn new(config: &Config) -> Result<Self> {
    let token = Config::api_token()?;
    Self::from_parts(
      &config.backend.url,
      token,
      Duration::from_secs(config.backend.request_timeout_secs),
      Duration::from_secs(config.backend.probe_timeout_secs),
    )
  }

  fn from_parts(
    base_url: &str,
    token: String,
    request_timeout: Duration,
    probe_timeout: Duration,
  ) -> Result<Self> {
    let base_url = Url::parse(base_url)
      .map_err(|e| eyre!("Invalid backend URL '{}': {}", base_url, e))?;

    let http = reqwest::Client::builder()
      .timeout(request_timeout)
      .build()
      .map_err(|e| eyre!("Failed to build HTTP client: {}", e))?;

    Ok(Self {
      http,
      base_url,
      token,
      probe_timeout,
    })
  }

  /// POST a mutation, carrying the action id as the idempotency key so
  /// a retry of the same id can never apply twice server-side. Errors
  /// only on transport failure.
  pub async fn submit(&self, id: Uuid, kind: &str, payload: &[u8]) -> Result<FetchedResponse> {
    let url = self.endpoint(&format!("api/v1/actions/{}", kind))?;

    let response = self
      .http
      .post(url)
      .bearer_auth(&self.token)
      .header("Idempotency-Key", id.to_string())
      .header(reqwest::header::CONTENT_TYPE, "application/json")
      .body(payload.to_vec())
      .send()
      .await
      .map_err(|e| eyre!("Failed to submit {}: {}", kind, e))?;

    let status = response.status().as_u16();
    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read submit response for {}: {}", kind, e))?;

    Ok(FetchedResponse {
      status,
      body: body.to_vec(),
    })
  }

  /// Submit one queued action and classify the outcome for the retry
  /// machinery.
  pub async fn submit_action(&self, id: Uuid, kind: &str, payload: &[u8]) -> SubmitOutcome {
    match self.submit(id, kind, payload).await {
      Ok(response) if response.is_success() => {
        let receipt = serde_json::from_slice::<SubmitReceipt>(&response.body).ok();
        SubmitOutcome::Applied(receipt)
      }
      Ok(response) => {
        let body = String::from_utf8_lossy(&response.body);
        SubmitOutcome::Failed {
          kind: classify_status(response.status),
          error: format!("HTTP {}: {}", response.status, truncate(&body)),
        }
      }
      Err(e) => SubmitOutcome::Failed {
        kind: FailureKind::Transient,
        error: e.to_string(),
      },
    }
  }

  /// Fetch a resource by path, returning status and raw body. Errors
  /// only on transport failure; HTTP error statuses come back as a
  /// normal response for the strategies to branch on.
  pub async fn fetch(&self, path: &str) -> Result<FetchedResponse> {
    let url = self.endpoint(path)?;

    let response = self
      .http
      .get(url)
      .bearer_auth(&self.token)
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", path, e))?;

    let status = response.status().as_u16();
    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read response body for {}: {}", path, e))?;

    Ok(FetchedResponse {
      status,
      body: body.to_vec(),
    })
  }

  /// Cheap reachability check. Any HTTP response counts as reachable,
  /// including server errors; only transport failures mean offline.
  pub async fn probe(&self) -> bool {
    let url = match self.endpoint("api/v1/health") {
      Ok(url) => url,
      Err(_) => return false,
    };

    self
      .http
      .head(url)
      .timeout(self.probe_timeout)
      .send()
      .await
      .is_ok()
  }

  /// Register a push subscription with the backend.
  pub async fn register_push_subscription(&self, subscription: &PushSubscription) -> Result<()> {
    let url = self.endpoint("api/v1/push/subscriptions")?;

    let response = self
      .http
      .post(url)
      .bearer_auth(&self.token)
      .json(subscription)
      .send()
      .await
      .map_err(|e| eyre!("Failed to register push subscription: {}", e))?;

    if !response.status().is_success() {
      return Err(eyre!(
        "Push subscription registration failed: HTTP {}",
        response.status().as_u16()
      ));
    }
    Ok(())
  }

  fn endpoint(&self, path: &str) -> Result<Url> {
    self
      .base_url
      .join(path)
      .map_err(|e| eyre!("Invalid endpoint path '{}': {}", path, e))
  }

  #[cfg(test)]
  pub(crate) fn test_client(base_url: &str) -> Self {
    Self::from_parts(
      base_url,
      "test-token".to_string(),
      Duration::from_secs(2),
      Duration::from_millis(500),
    )
    .expect("test client")
  }
}

fn classify_status(status: u16) -> FailureKind {
  if (400..500).contains(&status) {
    FailureKind::Permanent
  } else {
    FailureKind::Transient
  }
}

/// Keep stored error strings bounded.
fn truncate(body: &str) -> &str {
  let limit = 200.min(body.len());
  let mut end = limit;
  while !body.is_char_boundary(end) {
    end -= 1;
  }
  &body[..end]
}

#[cfg(test)]
mod tests {
  use super::*;

  fn client(base_url: &str) -> ApiClient {
    ApiClient::test_client(base_url)
  }

  #[tokio::test]
  async fn test_submit_action_applied_on_success() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
      .mock("POST", "/api/v1/actions/create_invoice")
      .match_header("idempotency-key", mockito::Matcher::Any)
      .with_status(200)
      .with_body(r#"{"id":"abc","resource_key":"invoices/1","resource":{"total":10}}"#)
      .create_async()
      .await;

    let client = client(&server.url());
    let outcome = client
      .submit_action(Uuid::new_v4(), "create_invoice", b"{}")
      .await;

    match outcome {
      SubmitOutcome::Applied(Some(receipt)) => {
        assert_eq!(receipt.resource_key.as_deref(), Some("invoices/1"));
      }
      other => panic!("expected Applied with receipt, got {:?}", other),
    }
    mock.assert_async().await;
  }

  #[tokio::test]
  async fn test_submit_action_4xx_is_permanent() {
    let mut server = mockito::Server::new_async().await;
    server
      .mock("POST", "/api/v1/actions/create_invoice")
      .with_status(422)
      .with_body("invalid amount")
      .create_async()
      .await;

    let client = client(&server.url());
    let outcome = client
      .submit_action(Uuid::new_v4(), "create_invoice", b"{}")
      .await;

    match outcome {
      SubmitOutcome::Failed { kind, error } => {
        assert_eq!(kind, FailureKind::Permanent);
        assert!(error.contains("422"));
      }
      other => panic!("expected Failed, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_submit_action_5xx_is_transient() {
    let mut server = mockito::Server::new_async().await;
    server
      .mock("POST", "/api/v1/actions/create_invoice")
      .with_status(503)
      .create_async()
      .await;

    let client = client(&server.url());
    let outcome = client
      .submit_action(Uuid::new_v4(), "create_invoice", b"{}")
      .await;

    match outcome {
      SubmitOutcome::Failed { kind, .. } => assert_eq!(kind, FailureKind::Transient),
      other => panic!("expected Failed, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_submit_action_unreachable_is_transient() {
    // Nothing listens on this port.
    let client = client("http://127.0.0.1:9");
    let outcome = client
      .submit_action(Uuid::new_v4(), "create_invoice", b"{}")
      .await;

    match outcome {
      SubmitOutcome::Failed { kind, .. } => assert_eq!(kind, FailureKind::Transient),
      other => panic!("expected Failed, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_fetch_returns_error_statuses_as_responses() {
    let mut server = mockito::Server::new_async().await;
    server
      .mock("GET", "/api/v1/invoices")
      .with_status(500)
      .with_body("boom")
      .create_async()
      .await;

    let client = client(&server.url());
    let response = client.fetch("api/v1/invoices").await.unwrap();
    assert_eq!(response.status, 500);
    assert_eq!(response.body, b"boom");
  }

  #[tokio::test]
  async fn test_probe_reports_reachability() {
    let mut server = mockito::Server::new_async().await;
    server
      .mock("HEAD", "/api/v1/health")
      .with_status(200)
      .create_async()
      .await;

    assert!(client(&server.url()).probe().await);
    assert!(!client("http://127.0.0.1:9").probe().await);
  }
}
