// Copyright (C) 2024 The kiwoom Developers
// SPDX-License-Identifier: GPL-3.0-or-later

use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::str::from_utf8;

use async_trait::async_trait;

use chrono::Duration;
use chrono::Utc;

use http::header::CONTENT_TYPE;
use http::request::Builder as HttpRequestBuilder;
use http::HeaderMap;
use http::HeaderValue;
use http::Request;
use http_body_util::BodyExt;
use http_body_util::Full;

use hyper::body::Body as _;
use hyper::body::Bytes;
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Builder as HttpClientBuilder;
use hyper_util::client::legacy::Client as HttpClient;
use hyper_util::rt::TokioExecutor;

use tokio::sync::Mutex;

use tracing::debug;
use tracing::field::debug;
use tracing::field::DebugValue;
use tracing::info;
use tracing::instrument;
use tracing::span;
use tracing::trace;
use tracing::Level;
use tracing_futures::Instrument;

use crate::api::oauth;
use crate::api::oauth::Token;
use crate::api::CONTENT_TYPE_JSON;
use crate::api::HDR_API_ID;
use crate::api::HDR_AUTHORIZATION;
use crate::api::HDR_CONT_YN;
use crate::api::HDR_NEXT_KEY;
use crate::api_info::ApiInfo;
use crate::endpoint::Endpoint;
use crate::error::RequestError;
use crate::realtime;
use crate::token::TokenSource;
use crate::Error;


/// Tokens this close to their expiry are considered expired already.
const TOKEN_EXPIRY_MARGIN_SECS: i64 = 60;


/// A type providing a debug representation of HTTP headers, with
/// sensitive data being masked out.
struct DebugHeaders<'h> {
  headers: &'h HeaderMap<HeaderValue>,
}

impl Debug for DebugHeaders<'_> {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    static MASKED: HeaderValue = HeaderValue::from_static("<masked>");

    f.debug_map()
      .entries(self.headers.iter().map(|(k, v)| {
        if k == HDR_AUTHORIZATION {
          (k, &MASKED)
        } else {
          (k, v)
        }
      }))
      .finish()
  }
}


/// A type providing a debug representation of an HTTP request, with
/// sensitive data being masked out.
struct DebugRequest<'r> {
  request: &'r Request<Full<Bytes>>,
}

impl Debug for DebugRequest<'_> {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    // Note that we do not print URL and version, because we assume they
    // are already included as identifiers in the span of the usage
    // site. Bodies may carry credentials (token requests do), so we
    // only report their size.
    f.debug_struct("Request")
      .field("version", &self.request.version())
      .field(
        "headers",
        &DebugHeaders {
          headers: self.request.headers(),
        },
      )
      .field(
        "body",
        &format_args!(
          "<{} bytes>",
          self.request.body().size_hint().exact().unwrap_or_default()
        ),
      )
      .finish()
  }
}


/// Emit a debug representation of an HTTP request.
fn debug_request(request: &Request<Full<Bytes>>) -> DebugValue<DebugRequest<'_>> {
  debug(DebugRequest { request })
}


/// The cursor for retrieving the next page of a paged request.
#[derive(Clone, Debug, PartialEq)]
pub struct Continuation {
  /// The opaque key identifying the next page.
  pub next_key: String,
}

impl Continuation {
  /// Extract the continuation from response headers, if the server
  /// indicated that more data is available.
  fn from_headers(headers: &HeaderMap<HeaderValue>) -> Option<Self> {
    let cont_yn = headers.get(HDR_CONT_YN)?.to_str().ok()?;
    if cont_yn != "Y" {
      return None
    }

    let next_key = headers
      .get(HDR_NEXT_KEY)
      .and_then(|value| value.to_str().ok())
      .unwrap_or_default()
      .to_string();

    Some(Self { next_key })
  }
}


/// A page of data as returned by a paged request.
#[derive(Clone, Debug, PartialEq)]
pub struct Paged<T> {
  /// The data of this page.
  pub data: T,
  /// The continuation to use for retrieving the next page, if there is
  /// one.
  pub next: Option<Continuation>,
}


/// A builder for creating customized `Client` objects.
#[derive(Debug)]
pub struct Builder {
  builder: HttpClientBuilder,
}

impl Builder {
  /// Adjust the maximum number of idle connections per host.
  #[inline]
  pub fn max_idle_per_host(&mut self, max_idle: usize) -> &mut Self {
    let _ = self.builder.pool_max_idle_per_host(max_idle);
    self
  }

  /// Build the final `Client` object.
  pub fn build(&self, api_info: ApiInfo) -> Client {
    let https = HttpsConnector::new();
    let client = self.builder.build(https);

    Client {
      api_info,
      client,
      token: Mutex::new(None),
    }
  }
}

impl Default for Builder {
  #[cfg(test)]
  fn default() -> Self {
    // Idle connections are kept around as spawned tasks, which can
    // outlive the runtime of an individual test. Disable them.
    let mut builder = HttpClient::builder(TokioExecutor::new());
    let _ = builder.pool_max_idle_per_host(0);

    Self { builder }
  }

  #[cfg(not(test))]
  #[inline]
  fn default() -> Self {
    Self {
      builder: HttpClient::builder(TokioExecutor::new()),
    }
  }
}


/// A `Client` is the entity used by clients of this module for
/// interacting with the Kiwoom API.
///
/// The client takes care of access tokens: it issues one on demand and
/// caches it until it expires.
pub struct Client {
  api_info: ApiInfo,
  client: HttpClient<HttpsConnector<HttpConnector>, Full<Bytes>>,
  token: Mutex<Option<Token>>,
}

impl Client {
  /// Instantiate a new `Builder` which allows for creating a customized `Client`.
  #[inline]
  pub fn builder() -> Builder {
    Builder::default()
  }

  /// Create a new `Client` using the given app key and secret for
  /// connecting to the API.
  #[inline]
  pub fn new(api_info: ApiInfo) -> Self {
    Builder::default().build(api_info)
  }

  /// Create a `Request` to the endpoint.
  fn request<R>(
    &self,
    input: &R::Input,
    token: Option<&str>,
    continuation: Option<&Continuation>,
  ) -> Result<Request<Full<Bytes>>, RequestError>
  where
    R: Endpoint,
  {
    let mut url = self.api_info.api_base_url.clone();
    url.set_path(&R::path(input)?);

    let body = match R::body(input)? {
      None => Bytes::new(),
      Some(vec) => Bytes::from(vec),
    };

    let mut builder = HttpRequestBuilder::new()
      .method(R::method())
      .uri(url.as_str())
      .header(CONTENT_TYPE, CONTENT_TYPE_JSON);

    if let Some(token) = token {
      builder = builder.header(HDR_AUTHORIZATION, format!("Bearer {}", token));
    }
    if let Some(api_id) = R::api_id(input) {
      builder = builder.header(HDR_API_ID, &*api_id);
    }
    builder = match continuation {
      Some(continuation) => builder
        .header(HDR_CONT_YN, "Y")
        .header(HDR_NEXT_KEY, continuation.next_key.as_str()),
      None => builder.header(HDR_CONT_YN, "N").header(HDR_NEXT_KEY, ""),
    };

    let request = builder.body(Full::new(body))?;
    Ok(request)
  }

  /// Create and issue a request and decode the response.
  pub async fn issue<R>(&self, input: &R::Input) -> Result<R::Output, RequestError>
  where
    R: Endpoint,
  {
    self
      .issue_paged::<R>(input, None)
      .await
      .map(|paged| paged.data)
  }

  /// Create and issue a request continuing a previous one, returning
  /// the decoded response along with the continuation for the next
  /// page, if any.
  pub async fn issue_paged<R>(
    &self,
    input: &R::Input,
    continuation: Option<&Continuation>,
  ) -> Result<Paged<R::Output>, RequestError>
  where
    R: Endpoint,
  {
    let token = if R::authenticated() {
      Some(self.access_token().await?)
    } else {
      None
    };

    let request = self.request::<R>(input, token.as_deref(), continuation)?;
    self.issue_instrumented::<R>(request).await
  }

  /// Issue a request to an endpoint not requiring a token.
  ///
  /// Token handling itself goes through here, so that it never has to
  /// wait on the token cache.
  async fn issue_unauthenticated<R>(&self, input: &R::Input) -> Result<R::Output, RequestError>
  where
    R: Endpoint,
  {
    let request = self.request::<R>(input, None, None)?;
    self
      .issue_instrumented::<R>(request)
      .await
      .map(|paged| paged.data)
  }

  async fn issue_instrumented<R>(
    &self,
    request: Request<Full<Bytes>>,
  ) -> Result<Paged<R::Output>, RequestError>
  where
    R: Endpoint,
  {
    let span = span!(
      Level::INFO,
      "issue",
      method = display(request.method()),
      uri = display(request.uri())
    );
    self.issue_::<R>(request).instrument(span).await
  }

  /// Issue a request.
  #[allow(clippy::cognitive_complexity)]
  async fn issue_<R>(&self, request: Request<Full<Bytes>>) -> Result<Paged<R::Output>, RequestError>
  where
    R: Endpoint,
  {
    debug!("requesting");
    trace!(request = debug_request(&request));

    let result = self.client.request(request).await?;
    let status = result.status();
    debug!(status = debug(&status));
    trace!(response = debug(&result));

    let (parts, body) = result.into_parts();
    let bytes = BodyExt::collect(body).await?.to_bytes();
    let body = bytes.as_ref();
    match from_utf8(body) {
      Ok(s) => trace!(body = display(&s)),
      Err(b) => trace!(body = display(&b)),
    }

    let data = R::evaluate(status, body)?;
    let next = Continuation::from_headers(&parts.headers);
    Ok(Paged { data, next })
  }

  /// Issue a new access token, replacing any cached one.
  #[instrument(level = "debug", skip(self))]
  pub async fn issue_token(&self) -> Result<Token, RequestError> {
    let mut guard = self.token.lock().await;
    self.issue_token_(&mut guard).await
  }

  async fn issue_token_(&self, cached: &mut Option<Token>) -> Result<Token, RequestError> {
    let request = oauth::IssueReq::new(&self.api_info.app_key, &self.api_info.secret);
    let token = self.issue_unauthenticated::<oauth::Issue>(&request).await?;
    info!(expires_at = display(&token.expires_at), "issued access token");
    *cached = Some(token.clone());
    Ok(token)
  }

  /// Retrieve a valid access token, issuing a new one if none is
  /// cached or the cached one is about to expire.
  pub async fn access_token(&self) -> Result<String, RequestError> {
    let mut guard = self.token.lock().await;
    let deadline = Utc::now() + Duration::seconds(TOKEN_EXPIRY_MARGIN_SECS);

    match &*guard {
      Some(token) if !token.is_expired_at(deadline) => Ok(token.token.clone()),
      _ => {
        debug!("access token missing or expired");
        self.issue_token_(&mut guard).await.map(|token| token.token)
      },
    }
  }

  /// Revoke the cached access token, if any.
  #[instrument(level = "debug", skip(self))]
  pub async fn revoke_token(&self) -> Result<(), RequestError> {
    let mut guard = self.token.lock().await;
    if let Some(token) = &*guard {
      let request =
        oauth::RevokeReq::new(&self.api_info.app_key, &self.api_info.secret, &token.token);
      let () = self
        .issue_unauthenticated::<oauth::Revoke>(&request)
        .await?;
      info!("revoked access token");
      *guard = None;
    }
    Ok(())
  }

  /// Create a builder for a realtime session connecting to the
  /// websocket server belonging to this client's API.
  ///
  /// The client itself (wrapped in an `Arc`) can serve as the
  /// session's token source.
  #[inline]
  pub fn realtime(&self) -> realtime::Builder {
    realtime::Session::builder(self.api_info.websocket_url.clone())
  }

  /// Retrieve the `ApiInfo` object used by this `Client` instance.
  #[inline]
  pub fn api_info(&self) -> &ApiInfo {
    &self.api_info
  }
}

impl Debug for Client {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    f.debug_struct("Client")
      .field("api_base_url", &self.api_info.api_base_url.as_str())
      .finish()
  }
}

#[async_trait]
impl TokenSource for Client {
  async fn token(&self) -> Result<String, Error> {
    self.access_token().await.map_err(Error::from)
  }
}
