use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::time::Duration;
use tracing::debug;

use crate::config::Config;
use crate::error::FetchError;

use super::{Fetcher, HttpRequest, HttpResponse};

/// reqwest-backed fetcher with a hard per-request timeout.
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
  timeout: Duration,
  token: Option<String>,
}

impl HttpFetcher {
  pub fn new(config: &Config) -> Result<Self> {
    let timeout = config.request_timeout();
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .user_agent(concat!("fleetdesk/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      timeout,
      token: Config::get_api_token(),
    })
  }

  async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, FetchError> {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());

    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(token) = &self.token {
      builder = builder.bearer_auth(token);
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder.send().await.map_err(|e| self.classify(e))?;

    let status = response.status().as_u16();
    let url = response.url().clone();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(k, v)| {
        v.to_str()
          .ok()
          .map(|v| (k.as_str().to_string(), v.to_string()))
      })
      .collect();
    let body = response.bytes().await.map_err(|e| self.classify(e))?;

    Ok(HttpResponse {
      status,
      headers,
      body: body.to_vec(),
      url,
    })
  }

  fn classify(&self, e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
      FetchError::Timeout(self.timeout)
    } else if e.is_builder() {
      FetchError::Unsupported(e.to_string())
    } else {
      FetchError::Transport(e.to_string())
    }
  }
}

#[async_trait]
impl Fetcher for HttpFetcher {
  async fn fetch(&self, request: &HttpRequest) -> Result<HttpResponse, FetchError> {
    match request.url.scheme() {
      "http" | "https" => {}
      other => {
        return Err(FetchError::Unsupported(format!(
          "scheme '{}' cannot be fetched",
          other
        )))
      }
    }

    debug!(method = %request.method, url = %request.url, "fetch");

    // The client timeout covers the request; this also bounds reading the body.
    match tokio::time::timeout(self.timeout, self.send(request)).await {
      Ok(result) => result,
      Err(_) => Err(FetchError::Timeout(self.timeout)),
    }
  }
}
