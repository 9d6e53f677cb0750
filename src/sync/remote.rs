//! Network boundary: fetching dashboard data and replaying queued mutations.

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use reqwest::Method;
use serde_json::Value;
use std::collections::BTreeMap;
use url::Url;

use crate::queue::Operation;

/// Fresh data for one domain, keyed by endpoint.
pub type DashboardData = BTreeMap<String, Value>;

/// The remote data source a [`SyncManager`](super::SyncManager) refreshes from.
///
/// Returned futures are `'static` so a sync can keep running after the
/// caller that started it has gone away.
pub trait RemoteSource: Send + Sync {
  /// Fetch every endpoint of `domain`.
  fn fetch_dashboard(&self, domain: &str) -> BoxFuture<'static, Result<DashboardData>>;

  /// Send one queued mutation.
  fn replay(&self, domain: &str, operation: &Operation) -> BoxFuture<'static, Result<()>>;
}

/// HTTP implementation of [`RemoteSource`].
///
/// `GET {base}/{domain}` must return a JSON object mapping endpoint names to
/// payloads. Mutations are sent with their own method to `{base}/{target}`.
#[derive(Clone)]
pub struct HttpRemote {
  client: reqwest::Client,
  base_url: Url,
}

impl HttpRemote {
  pub fn new(base_url: &str) -> Result<Self> {
    let mut base_url =
      Url::parse(base_url).map_err(|e| eyre!("Invalid remote URL '{}': {}", base_url, e))?;

    // Without a trailing slash `join` would replace the last path segment
    if !base_url.path().ends_with('/') {
      let path = format!("{}/", base_url.path());
      base_url.set_path(&path);
    }

    let client = reqwest::Client::builder()
      .user_agent(concat!("dashcache/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client, base_url })
  }

  pub fn dashboard_url(&self, domain: &str) -> Result<Url> {
    self
      .base_url
      .join(domain)
      .map_err(|e| eyre!("Invalid domain '{}': {}", domain, e))
  }

  pub fn target_url(&self, target: &str) -> Result<Url> {
    self
      .base_url
      .join(target.trim_start_matches('/'))
      .map_err(|e| eyre!("Invalid target '{}': {}", target, e))
  }
}

impl RemoteSource for HttpRemote {
  fn fetch_dashboard(&self, domain: &str) -> BoxFuture<'static, Result<DashboardData>> {
    let client = self.client.clone();
    let url = self.dashboard_url(domain);
    let domain = domain.to_string();

    Box::pin(async move {
      let url = url?;
      let response = client
        .get(url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| eyre!("Failed to fetch {} dashboard: {}", domain, e))?;

      response
        .json::<DashboardData>()
        .await
        .map_err(|e| eyre!("Failed to parse {} dashboard: {}", domain, e))
    })
  }

  fn replay(&self, domain: &str, operation: &Operation) -> BoxFuture<'static, Result<()>> {
    let client = self.client.clone();
    let url = self.target_url(&operation.target);
    let method = Method::from_bytes(operation.method.to_uppercase().as_bytes())
      .map_err(|e| eyre!("Invalid method '{}': {}", operation.method, e));
    let payload = operation.payload.clone();
    let domain = domain.to_string();

    Box::pin(async move {
      let (url, method) = (url?, method?);
      let mut request = client.request(method, url);
      if !payload.is_null() {
        request = request.json(&payload);
      }

      request
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| eyre!("Failed to replay {} mutation: {}", domain, e))?;

      Ok(())
    })
  }
}
