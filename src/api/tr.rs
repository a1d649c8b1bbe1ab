// Copyright (C) 2024 The kiwoom Developers
// SPDX-License-Identifier: GPL-3.0-or-later

use serde_json::to_vec as to_json;
use serde_json::Value;

use crate::endpoint::Endpoint;
use crate::endpoint::EndpointError;
use crate::Str;


/// Map a TR code to the path of the endpoint serving it.
///
/// The category of a request is determined by the first two letters
/// of its TR code.
pub fn path_for(api_id: &str) -> Option<&'static str> {
  let prefix = api_id.get(..2)?.to_ascii_lowercase();
  let path = match prefix.as_str() {
    "au" => "/oauth2/token",
    "ka" => "/api/dostk/acnt",
    "kt" | "kr" => "/api/dostk/ordr",
    "kc" => "/api/dostk/chart",
    "ks" => "/api/dostk/price",
    "ke" => "/api/dostk/stock",
    "ki" => "/api/dostk/rkinfo",
    "kb" => "/api/dostk/sector",
    "kl" => "/api/dostk/etf",
    "kf" => "/api/dostk/elw",
    "kh" => "/api/dostk/theme",
    "ko" => "/api/dostk/condition",
    "kg" => "/api/dostk/forgnr",
    _ => return None,
  };
  Some(path)
}


/// A request identified by a TR code, carrying an arbitrary JSON body.
#[derive(Clone, Debug, PartialEq)]
pub struct TrReq {
  /// The TR code (api-id) of the request.
  pub api_id: String,
  /// The request body.
  pub body: Value,
  /// An explicit endpoint path, overriding the one derived from the
  /// TR code.
  pub path: Option<String>,
}

impl TrReq {
  /// Create a request for the given TR code and body.
  pub fn new(api_id: impl ToString, body: Value) -> Self {
    Self {
      api_id: api_id.to_string(),
      body,
      path: None,
    }
  }

  /// Send the request to `path` instead of the path derived from the
  /// TR code.
  pub fn with_path(mut self, path: impl ToString) -> Self {
    self.path = Some(path.to_string());
    self
  }
}


/// The representation of a POST request for an arbitrary TR code.
#[derive(Clone, Copy, Debug)]
pub enum Request {}

impl Endpoint for Request {
  type Input = TrReq;
  type Output = Value;

  fn path(input: &Self::Input) -> Result<Str, EndpointError> {
    if let Some(path) = &input.path {
      return Ok(path.clone().into())
    }

    path_for(&input.api_id)
      .map(Str::from)
      .ok_or_else(|| EndpointError::UnknownApiId(input.api_id.clone()))
  }

  fn api_id(input: &Self::Input) -> Option<Str> {
    Some(input.api_id.clone().into())
  }

  fn body(input: &Self::Input) -> Result<Option<Vec<u8>>, EndpointError> {
    let json = to_json(&input.body)?;
    Ok(Some(json))
  }
}
