// Copyright (C) 2024 The kiwoom Developers
// SPDX-License-Identifier: GPL-3.0-or-later

use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::sync::Arc;

use async_trait::async_trait;

use crate::Error;


/// A trait representing "something" that can hand out a bearer token
/// used for authenticating with the API.
///
/// The realtime session asks its source for a token every time it
/// establishes a connection.
#[async_trait]
pub trait TokenSource: Send + Sync {
  /// Retrieve a currently valid token.
  async fn token(&self) -> Result<String, Error>;
}

#[async_trait]
impl<T> TokenSource for Arc<T>
where
  T: TokenSource + ?Sized,
{
  async fn token(&self) -> Result<String, Error> {
    (**self).token().await
  }
}


/// A token source always providing the same token.
#[derive(Clone, PartialEq)]
pub struct StaticToken(String);

impl StaticToken {
  /// Create a new `StaticToken` wrapping `token`.
  #[inline]
  pub fn new(token: impl ToString) -> Self {
    Self(token.to_string())
  }
}

impl Debug for StaticToken {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    f.debug_tuple("StaticToken").field(&"<masked>").finish()
  }
}

#[async_trait]
impl TokenSource for StaticToken {
  async fn token(&self) -> Result<String, Error> {
    Ok(self.0.clone())
  }
}


#[cfg(test)]
mod tests {
  use super::*;

  use test_log::test;


  /// Check that a `StaticToken` hands out its token, also through an
  /// `Arc`.
  #[test(tokio::test)]
  async fn static_token() {
    let source = StaticToken::new("secret-token");
    assert_eq!(source.token().await.unwrap(), "secret-token");

    let source = Arc::new(source) as Arc<dyn TokenSource>;
    assert_eq!(source.token().await.unwrap(), "secret-token");
  }

  /// Check that the token is not exposed via `Debug`.
  #[test]
  fn static_token_debug() {
    let string = format!("{:?}", StaticToken::new("secret-token"));
    assert!(!string.contains("secret-token"), "{string}");
  }
}
