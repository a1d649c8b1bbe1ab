// Copyright (C) 2024 The kiwoom Developers
// SPDX-License-Identifier: GPL-3.0-or-later

use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;

use chrono::DateTime;
use chrono::Utc;

use serde::Deserialize;
use serde::Serialize;
use serde_json::to_vec as to_json;

use crate::endpoint::Endpoint;
use crate::endpoint::EndpointError;
use crate::time_util::kst_from_str;
use crate::Str;


/// An OAuth2 access token as issued by the API.
#[derive(Clone, Deserialize, PartialEq)]
#[non_exhaustive]
pub struct Token {
  /// The bearer token itself.
  #[serde(rename = "token")]
  pub token: String,
  /// The type of the token, typically "bearer".
  #[serde(rename = "token_type")]
  pub token_type: String,
  /// The point in time at which the token expires.
  #[serde(rename = "expires_dt", deserialize_with = "kst_from_str")]
  pub expires_at: DateTime<Utc>,
}

impl Token {
  /// Check whether the token has expired as of `now`.
  #[inline]
  pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
    now >= self.expires_at
  }
}

impl Debug for Token {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    f.debug_struct("Token")
      .field("token", &"<masked>")
      .field("token_type", &self.token_type)
      .field("expires_at", &self.expires_at)
      .finish()
  }
}


/// A request for a new access token (TR code au10001).
#[derive(Clone, PartialEq, Serialize)]
pub struct IssueReq {
  /// The grant type; always "client_credentials".
  #[serde(rename = "grant_type")]
  pub(crate) grant_type: &'static str,
  /// The app key.
  #[serde(rename = "appkey")]
  pub(crate) app_key: String,
  /// The secret key.
  #[serde(rename = "secretkey")]
  pub(crate) secret: String,
}

impl IssueReq {
  /// Create a token request for the given credentials.
  pub fn new(app_key: impl ToString, secret: impl ToString) -> Self {
    Self {
      grant_type: "client_credentials",
      app_key: app_key.to_string(),
      secret: secret.to_string(),
    }
  }
}

impl Debug for IssueReq {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    f.debug_struct("IssueReq")
      .field("grant_type", &self.grant_type)
      .field("app_key", &"<masked>")
      .field("secret", &"<masked>")
      .finish()
  }
}


/// A request to revoke an access token (TR code au10002).
#[derive(Clone, PartialEq, Serialize)]
pub struct RevokeReq {
  /// The app key.
  #[serde(rename = "appkey")]
  pub(crate) app_key: String,
  /// The secret key.
  #[serde(rename = "secretkey")]
  pub(crate) secret: String,
  /// The token to revoke.
  #[serde(rename = "token")]
  pub(crate) token: String,
}

impl RevokeReq {
  /// Create a revocation request for `token`.
  pub fn new(app_key: impl ToString, secret: impl ToString, token: impl ToString) -> Self {
    Self {
      app_key: app_key.to_string(),
      secret: secret.to_string(),
      token: token.to_string(),
    }
  }
}

impl Debug for RevokeReq {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    f.debug_struct("RevokeReq")
      .field("app_key", &"<masked>")
      .field("secret", &"<masked>")
      .field("token", &"<masked>")
      .finish()
  }
}


/// The representation of a POST request to the /oauth2/token
/// endpoint.
#[derive(Clone, Copy, Debug)]
pub enum Issue {}

impl Endpoint for Issue {
  type Input = IssueReq;
  type Output = Token;

  fn path(_input: &Self::Input) -> Result<Str, EndpointError> {
    Ok("/oauth2/token".into())
  }

  fn api_id(_input: &Self::Input) -> Option<Str> {
    Some("au10001".into())
  }

  fn authenticated() -> bool {
    false
  }

  fn body(input: &Self::Input) -> Result<Option<Vec<u8>>, EndpointError> {
    let json = to_json(input)?;
    Ok(Some(json))
  }
}


/// The representation of a POST request to the /oauth2/revoke
/// endpoint.
#[derive(Clone, Copy, Debug)]
pub enum Revoke {}

impl Endpoint for Revoke {
  type Input = RevokeReq;
  type Output = ();

  fn path(_input: &Self::Input) -> Result<Str, EndpointError> {
    Ok("/oauth2/revoke".into())
  }

  fn api_id(_input: &Self::Input) -> Option<Str> {
    Some("au10002".into())
  }

  fn authenticated() -> bool {
    false
  }

  fn body(input: &Self::Input) -> Result<Option<Vec<u8>>, EndpointError> {
    let json = to_json(input)?;
    Ok(Some(json))
  }

  fn parse(_body: &[u8]) -> Result<Self::Output, EndpointError> {
    Ok(())
  }
}
