// Copyright (C) 2024 The kiwoom Developers
// SPDX-License-Identifier: GPL-3.0-or-later

use std::fmt::Debug;
use std::fmt::Display;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::str::from_utf8;

use http::Error as HttpError;
use hyper::Error as HyperError;
use hyper_util::client::legacy::Error as HyperUtilError;
use serde_json::Error as JsonError;
use thiserror::Error;
use tungstenite::tungstenite::Error as WebSocketError;
use url::ParseError;

use crate::endpoint::EndpointError;
use crate::Str;


/// An error encountered while issuing a request.
#[derive(Debug, Error)]
pub enum RequestError {
  /// An endpoint reported error.
  #[error("the endpoint reported an error")]
  Endpoint(
    #[from]
    #[source]
    EndpointError,
  ),
  /// The HTTP request could not be assembled.
  #[error("failed to create the HTTP request")]
  Http(
    #[from]
    #[source]
    HttpError,
  ),
  /// An error reported by the `hyper` crate.
  #[error("the hyper crate reported an error")]
  Hyper(
    #[from]
    #[source]
    HyperError,
  ),
  /// An error reported by the `hyper-util` HTTP client.
  #[error("the HTTP client reported an error")]
  HyperUtil(
    #[from]
    #[source]
    HyperUtilError,
  ),
}


/// An HTTP body, displayed as text where possible.
#[derive(Clone, Debug, Error, PartialEq)]
pub struct HttpBody(pub(crate) Vec<u8>);

impl Display for HttpBody {
  fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
    match from_utf8(&self.0) {
      Ok(s) => fmt.write_str(s)?,
      Err(b) => write!(fmt, "{:?}", b)?,
    }
    Ok(())
  }
}


/// The error type as used by this crate.
#[derive(Debug, Error)]
pub enum Error {
  /// An HTTP related error.
  #[error("encountered an HTTP related error")]
  Http(
    #[from]
    #[source]
    HttpError,
  ),
  /// A JSON conversion error.
  #[error("a JSON conversion failed")]
  Json(
    #[from]
    #[source]
    JsonError,
  ),
  /// An error issuing a request against the REST API.
  #[error("failed to issue a request")]
  Request(
    #[from]
    #[source]
    RequestError,
  ),
  /// An error directly originating in this crate.
  #[error("{0}")]
  Str(Str),
  /// An URL parsing error.
  #[error("failed to parse the URL")]
  Url(
    #[from]
    #[source]
    ParseError,
  ),
  /// A websocket error.
  #[error("encountered a websocket related error")]
  WebSocket(
    #[from]
    #[source]
    WebSocketError,
  ),
  /// An operation required an established realtime connection but
  /// there was none.
  #[error("the realtime session is not connected")]
  NotConnected,
  /// The realtime connection was closed by the peer.
  #[error("the realtime connection was closed")]
  ConnectionClosed,
  /// The realtime server rejected our login.
  #[error("login rejected by server ({code}): {message}")]
  LoginRejected {
    /// The `return_code` reported by the server.
    code: i64,
    /// The `return_msg` reported by the server.
    message: String,
  },
}
