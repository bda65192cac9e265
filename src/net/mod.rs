//! Request/response values and the network seam every other module fetches through.

mod client;

use async_trait::async_trait;
use reqwest::Method;
use url::Url;

use crate::error::FetchError;

pub use client::HttpFetcher;

/// Status of synthesized responses when no real response exists.
/// No server ever answers with status 0.
pub const TRANSPORT_ERROR_STATUS: u16 = 0;

/// What the request is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
  /// Top-level navigable document
  Document,
  /// Anything else: scripts, data, images, API calls
  Subresource,
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
  pub method: Method,
  pub url: Url,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
  pub destination: Destination,
}

impl HttpRequest {
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
      headers: Vec::new(),
      body: None,
      destination: Destination::Subresource,
    }
  }

  /// A top-level navigation to `url`.
  pub fn navigate(url: Url) -> Self {
    Self {
      destination: Destination::Document,
      ..Self::get(url)
    }
  }

  pub fn with_json(mut self, method: Method, body: &serde_json::Value) -> Self {
    self.method = method;
    self.body = Some(body.to_string().into_bytes());
    self
      .headers
      .push(("content-type".to_string(), "application/json".to_string()));
    self
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
  pub url: Url,
}

impl HttpResponse {
  pub fn new(url: Url, status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
      url,
    }
  }

  /// Minimal response standing in for a request that produced nothing.
  pub fn transport_error(url: Url, reason: &str) -> Self {
    Self {
      status: TRANSPORT_ERROR_STATUS,
      headers: vec![("content-type".to_string(), "text/plain".to_string())],
      body: reason.as_bytes().to_vec(),
      url,
    }
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn is_transport_error(&self) -> bool {
    self.status == TRANSPORT_ERROR_STATUS
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }
}

/// The platform fetch primitive.
///
/// Implementations must bound every request by a timeout and report expiry as
/// `FetchError::Timeout`.
#[async_trait]
pub trait Fetcher: Send + Sync {
  async fn fetch(&self, request: &HttpRequest) -> Result<HttpResponse, FetchError>;
}

#[cfg(test)]
pub mod testing {
  //! Scripted fetcher shared by the test modules.

  use super::*;
  use std::collections::{HashMap, VecDeque};
  use std::sync::Mutex;

  /// Answers from a per-URL script and records every request it sees.
  #[derive(Default)]
  pub struct ScriptedFetcher {
    routes: Mutex<HashMap<String, VecDeque<Result<HttpResponse, FetchError>>>>,
    fallback: Mutex<HashMap<String, Result<HttpResponse, FetchError>>>,
    requests: Mutex<Vec<(Method, String)>>,
  }

  impl ScriptedFetcher {
    pub fn new() -> Self {
      Self::default()
    }

    /// Always answer `url` with `status` and `body`.
    pub fn respond(&self, url: &str, status: u16, body: &str) {
      let response = HttpResponse::new(Url::parse(url).unwrap(), status, body);
      self
        .fallback
        .lock()
        .unwrap()
        .insert(url.to_string(), Ok(response));
    }

    /// Always fail `url`.
    pub fn fail(&self, url: &str) {
      self.fallback.lock().unwrap().insert(
        url.to_string(),
        Err(FetchError::Transport("connection refused".to_string())),
      );
    }

    /// Answer the next request for `url` with `result`, before any fixed answer.
    pub fn push(&self, url: &str, result: Result<HttpResponse, FetchError>) {
      self
        .routes
        .lock()
        .unwrap()
        .entry(url.to_string())
        .or_default()
        .push_back(result);
    }

    pub fn requests(&self) -> Vec<(Method, String)> {
      self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self, url: &str) -> usize {
      self
        .requests
        .lock()
        .unwrap()
        .iter()
        .filter(|(_, u)| u == url)
        .count()
    }
  }

  #[async_trait]
  impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, request: &HttpRequest) -> Result<HttpResponse, FetchError> {
      let url = request.url.to_string();
      self
        .requests
        .lock()
        .unwrap()
        .push((request.method.clone(), url.clone()));

      if let Some(result) = self
        .routes
        .lock()
        .unwrap()
        .get_mut(&url)
        .and_then(|q| q.pop_front())
      {
        return result;
      }

      match self.fallback.lock().unwrap().get(&url) {
        Some(result) => result.clone(),
        None => Err(FetchError::Transport(format!("no route for {}", url))),
      }
    }
  }
}
