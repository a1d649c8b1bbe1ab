// Copyright (C) 2024 The kiwoom Developers
// SPDX-License-Identifier: GPL-3.0-or-later

use std::fmt::Display;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;

use http::Method;
use http::StatusCode;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::from_slice;
use serde_json::Error as JsonError;
use thiserror::Error;

use crate::error::HttpBody;
use crate::Str;


/// An error as reported by the Kiwoom API in a response body.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ApiError {
  /// The API's return code; zero means success.
  #[serde(rename = "return_code")]
  pub code: i64,
  /// The message accompanying the code.
  #[serde(rename = "return_msg", default)]
  pub message: String,
}

impl Display for ApiError {
  fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
    write!(fmt, "{} ({})", self.message, self.code)
  }
}

impl std::error::Error for ApiError {}


/// The status portion every response body carries.
#[derive(Debug, Deserialize)]
struct Status {
  #[serde(rename = "return_code")]
  code: Option<i64>,
  #[serde(rename = "return_msg", default)]
  message: String,
}


/// An error type used by the `Endpoint` trait.
#[derive(Debug, Error)]
pub enum EndpointError {
  /// An HTTP status other than 200 was reported.
  #[error("encountered an unexpected HTTP status: {0}")]
  UnexpectedStatus(StatusCode, #[source] HttpBody),
  /// The request was answered but the API reported a non-zero
  /// return code.
  #[error("the API reported an error: {0}")]
  Api(#[source] ApiError),
  /// No endpoint is known to serve the given TR code.
  #[error("unknown API type: {0}")]
  UnknownApiId(String),
  /// A JSON conversion error.
  #[error("a JSON conversion failed")]
  Json(
    #[from]
    #[source]
    JsonError,
  ),
}


/// A trait describing an HTTP endpoint.
///
/// An endpoint for our intents and purposes is basically a path, an
/// HTTP request method (almost always POST), and optionally a TR code
/// identifying the request type to the server. The path will be
/// combined with the base URL of the API into a full URL.
pub trait Endpoint {
  /// The type of data being passed in as part of a request to this
  /// endpoint.
  type Input;
  /// The type of data being returned in the response from this
  /// endpoint.
  type Output: DeserializeOwned;

  /// Retrieve the HTTP method to use.
  ///
  /// The default method being used is POST.
  fn method() -> Method {
    Method::POST
  }

  /// Inquire the path the request should go to.
  fn path(input: &Self::Input) -> Result<Str, EndpointError>;

  /// Retrieve the TR code (sent as the `api-id` header), if any.
  #[allow(unused)]
  fn api_id(input: &Self::Input) -> Option<Str> {
    None
  }

  /// Whether the request has to carry a bearer token.
  fn authenticated() -> bool {
    true
  }

  /// Retrieve the request's body.
  ///
  /// By default the body is empty.
  #[allow(unused)]
  fn body(input: &Self::Input) -> Result<Option<Vec<u8>>, EndpointError> {
    Ok(None)
  }

  /// Parse the body into the final result.
  ///
  /// By default this method directly parses the body as JSON.
  fn parse(body: &[u8]) -> Result<Self::Output, EndpointError> {
    from_slice::<Self::Output>(body).map_err(EndpointError::from)
  }

  /// Evaluate an HTTP status and body, converting them into an output
  /// or an error.
  ///
  /// Responses with an HTTP 200 status may still carry a non-zero
  /// `return_code`, which is reported as [`EndpointError::Api`].
  fn evaluate(status: StatusCode, body: &[u8]) -> Result<Self::Output, EndpointError> {
    if status != StatusCode::OK {
      return Err(EndpointError::UnexpectedStatus(
        status,
        HttpBody(body.to_vec()),
      ))
    }

    // Bodies that do not even have the shape of a status object will
    // fail during `parse` below with a proper error.
    if let Ok(Status {
      code: Some(code),
      message,
    }) = from_slice::<Status>(body)
    {
      if code != 0 {
        return Err(EndpointError::Api(ApiError { code, message }))
      }
    }

    Self::parse(body)
  }
}
