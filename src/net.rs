//! Request/response model and the network fetch seam.
//!
//! The agent never talks to the network directly: it goes through the
//! [`Fetcher`] trait, so tests can script responses and failures without a
//! server. [`HttpFetcher`] is the production implementation backed by reqwest.

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use url::Url;

/// HTTP methods the agent routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  Get,
  Head,
  Post,
  Put,
  Delete,
}

impl Method {
  pub fn as_str(&self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Head => "HEAD",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Delete => "DELETE",
    }
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// How the response will be consumed.
///
/// Navigations (full-page loads) are the only requests eligible for the
/// offline-shell fallback when nothing else is cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
  #[default]
  Subresource,
  Navigate,
}

/// An outgoing request as seen by the agent.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub mode: RequestMode,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
}

impl Request {
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::Get,
      url,
      mode: RequestMode::Subresource,
      headers: Vec::new(),
      body: None,
    }
  }

  /// A GET that loads a full page, eligible for the offline-shell fallback.
  pub fn navigate(url: Url) -> Self {
    Self {
      mode: RequestMode::Navigate,
      ..Self::get(url)
    }
  }

  pub fn head(url: Url) -> Self {
    Self {
      method: Method::Head,
      ..Self::get(url)
    }
  }

  pub fn post(url: Url, body: Vec<u8>) -> Self {
    Self {
      method: Method::Post,
      url,
      mode: RequestMode::Subresource,
      headers: Vec::new(),
      body: Some(body),
    }
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  /// Cache identity: method plus URL with query string, fragment stripped.
  ///
  /// Fragments never go over the wire, so two URLs differing only in
  /// fragment are the same resource.
  pub fn identity(&self) -> String {
    let mut url = self.url.clone();
    url.set_fragment(None);
    format!("{} {}", self.method, url)
  }

  /// Whether this request targets the backend API, by path prefix.
  /// API requests are excluded from caching in both directions.
  pub fn is_api(&self, prefix: &str) -> bool {
    !prefix.is_empty() && self.url.path().starts_with(prefix)
  }
}

/// A response as stored in and replayed from the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: Vec<u8>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body,
    }
  }

  /// Whether the backend acknowledged the request (2xx).
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }
}

/// Network seam. A fetch resolves to a response (any status) or fails with
/// a transport error (offline, DNS, refused); the distinction is what the
/// agent's cache fallback keys on.
pub trait Fetcher: Send + Sync {
  fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response>>;
}

/// Production fetcher backed by reqwest.
pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  pub fn new(timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to build HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

impl Fetcher for HttpFetcher {
  fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response>> {
    Box::pin(async move {
      let method = match request.method {
        Method::Get => reqwest::Method::GET,
        Method::Head => reqwest::Method::HEAD,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Delete => reqwest::Method::DELETE,
      };

      let mut builder = self.client.request(method, request.url.clone());
      for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
      }
      if let Some(body) = &request.body {
        builder = builder.body(body.clone());
      }

      let response = builder
        .send()
        .await
        .map_err(|e| eyre!("Request to {} failed: {}", request.url, e))?;

      let status = response.status().as_u16();
      let headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
          value
            .to_str()
            .ok()
            .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
      let body = response
        .bytes()
        .await
        .map_err(|e| eyre!("Failed to read response from {}: {}", request.url, e))?
        .to_vec();

      Ok(Response {
        status,
        headers,
        body,
      })
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
  }

  #[test]
  fn test_identity_includes_query_string() {
    let a = Request::get(url("https://app.test/results?page=1"));
    let b = Request::get(url("https://app.test/results?page=2"));
    assert_ne!(a.identity(), b.identity());
  }

  #[test]
  fn test_identity_strips_fragment() {
    let a = Request::get(url("https://app.test/dashboard#stats"));
    let b = Request::get(url("https://app.test/dashboard"));
    assert_eq!(a.identity(), b.identity());
  }

  #[test]
  fn test_identity_distinguishes_methods() {
    let get = Request::get(url("https://app.test/results"));
    let post = Request::post(url("https://app.test/results"), Vec::new());
    assert_ne!(get.identity(), post.identity());
    assert!(get.identity().starts_with("GET "));
  }

  #[test]
  fn test_is_api_matches_path_prefix() {
    let api = Request::get(url("https://app.test/functions/v1/profile"));
    let asset = Request::get(url("https://app.test/styles/globals.css"));
    assert!(api.is_api("/functions/v1/"));
    assert!(!asset.is_api("/functions/v1/"));
  }

  #[test]
  fn test_is_api_ignores_query_and_host() {
    let req = Request::get(url("https://functions.test/assets/app.js?v=/functions/v1/"));
    assert!(!req.is_api("/functions/v1/"));
  }

  #[test]
  fn test_response_success_range() {
    assert!(Response::new(200, Vec::new()).is_success());
    assert!(Response::new(204, Vec::new()).is_success());
    assert!(!Response::new(301, Vec::new()).is_success());
    assert!(!Response::new(500, Vec::new()).is_success());
  }
}
