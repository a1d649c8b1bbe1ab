// Copyright (C) 2024 The kiwoom Developers
// SPDX-License-Identifier: GPL-3.0-or-later

use std::env::var_os;
use std::ffi::OsString;

use url::Url;

use crate::api::API_BASE_URL;
use crate::api::MOCK_API_BASE_URL;
use crate::Error;

/// The base URL to the API to use.
const ENV_API_URL: &str = "KIWOOM_API_BASE_URL";
/// The environment variable representing the app key.
const ENV_APP_KEY: &str = "kiwoom_appkey";
/// The environment variable representing the secret key.
const ENV_SECRET: &str = "kiwoom_secretkey";

/// The port the realtime server listens on.
const WEBSOCKET_PORT: u16 = 10000;
/// The path of the realtime endpoint.
const WEBSOCKET_PATH: &str = "/api/dostk/websocket";


/// Derive the realtime websocket URL from the REST API base URL.
fn websocket_url(base_url: &Url) -> Result<Url, Error> {
  let scheme = match base_url.scheme() {
    "https" => "wss",
    "http" => "ws",
    scheme => {
      return Err(Error::Str(
        format!("unsupported API URL scheme: {}", scheme).into(),
      ))
    },
  };

  let mut url = base_url.clone();
  url
    .set_scheme(scheme)
    .map_err(|()| Error::Str(format!("failed to set URL scheme {}", scheme).into()))?;
  url
    .set_port(Some(WEBSOCKET_PORT))
    .map_err(|()| Error::Str("failed to set websocket port".into()))?;
  url.set_path(WEBSOCKET_PATH);
  url.set_query(None);
  Ok(url)
}


/// An object encapsulating the information used for working with the
/// Kiwoom API.
#[derive(Clone, Debug, PartialEq)]
pub struct ApiInfo {
  /// The base URL for the REST API.
  pub(crate) api_base_url: Url,
  /// The URL of the realtime websocket server.
  pub(crate) websocket_url: Url,
  /// The app key to use for authentication.
  pub(crate) app_key: String,
  /// The secret to use for authentication.
  pub(crate) secret: String,
}

impl ApiInfo {
  /// Create an `ApiInfo` from the required data.
  ///
  /// The realtime websocket URL is derived from `api_base_url`.
  ///
  /// # Errors
  /// - [`Error::Url`](crate::Error::Url) If `api_base_url` cannot be
  ///   parsed into a [`url::Url`](url::Url).
  pub fn from_parts(
    api_base_url: impl AsRef<str>,
    app_key: impl ToString,
    secret: impl ToString,
  ) -> Result<Self, Error> {
    let api_base_url = Url::parse(api_base_url.as_ref())?;
    let websocket_url = websocket_url(&api_base_url)?;

    Ok(Self {
      api_base_url,
      websocket_url,
      app_key: app_key.to_string(),
      secret: secret.to_string(),
    })
  }

  /// Create an `ApiInfo` object targeting the paper trading
  /// environment.
  pub fn mock(app_key: impl ToString, secret: impl ToString) -> Result<Self, Error> {
    Self::from_parts(MOCK_API_BASE_URL, app_key, secret)
  }

  /// Create an `ApiInfo` object with information from the environment.
  ///
  /// This constructor retrieves API related information from the
  /// environment and performs some preliminary validation on it. The
  /// following information is used:
  /// - the Kiwoom API base URL is retrieved from the
  ///   KIWOOM_API_BASE_URL variable, falling back to the production
  ///   server
  /// - the app key is retrieved from the kiwoom_appkey variable
  /// - the secret key is retrieved from the kiwoom_secretkey variable
  pub fn from_env() -> Result<Self, Error> {
    let api_base_url = var_os(ENV_API_URL)
      .unwrap_or_else(|| OsString::from(API_BASE_URL))
      .into_string()
      .map_err(|_| {
        Error::Str(format!("{} environment variable is not a valid string", ENV_API_URL).into())
      })?;

    let app_key = var_os(ENV_APP_KEY)
      .ok_or_else(|| Error::Str(format!("{} environment variable not found", ENV_APP_KEY).into()))?
      .into_string()
      .map_err(|_| {
        Error::Str(format!("{} environment variable is not a valid string", ENV_APP_KEY).into())
      })?;

    let secret = var_os(ENV_SECRET)
      .ok_or_else(|| Error::Str(format!("{} environment variable not found", ENV_SECRET).into()))?
      .into_string()
      .map_err(|_| {
        Error::Str(format!("{} environment variable is not a valid string", ENV_SECRET).into())
      })?;

    Self::from_parts(api_base_url, app_key, secret)
  }

  /// Retrieve the base URL of the REST API.
  #[inline]
  pub fn api_base_url(&self) -> &Url {
    &self.api_base_url
  }

  /// Retrieve the URL of the realtime websocket server.
  #[inline]
  pub fn websocket_url(&self) -> &Url {
    &self.websocket_url
  }
}
