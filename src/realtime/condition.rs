// Copyright (C) 2024 The kiwoom Developers
// SPDX-License-Identifier: GPL-3.0-or-later

use serde::Serialize;
use serde_json::Value;

use tracing::debug;

use crate::realtime::Session;
use crate::Error;


/// The kind of a condition search.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum SearchType {
  /// A one-off search, answered with the currently matching items.
  #[serde(rename = "0")]
  General,
  /// A search whose later hits are streamed as realtime data.
  #[serde(rename = "1")]
  Realtime,
}


/// A condition search or condition clear request.
#[derive(Debug, Serialize)]
#[serde(tag = "trnm")]
enum Request<'s> {
  #[serde(rename = "CNSRREQ")]
  Search {
    #[serde(rename = "seq")]
    seq: &'s str,
    #[serde(rename = "search_type")]
    search_type: SearchType,
    /// The exchange; "K" denotes KRX.
    #[serde(rename = "stex_tp")]
    exchange: &'static str,
    #[serde(rename = "cont_yn")]
    cont_yn: &'static str,
    #[serde(rename = "next_key")]
    next_key: &'static str,
  },
  #[serde(rename = "CNSRCLR")]
  Clear {
    #[serde(rename = "seq")]
    seq: &'s str,
  },
}


impl Session {
  /// Run the condition search identified by `seq`.
  ///
  /// `callback` is invoked once with the server's response. Items
  /// matching a [`SearchType::Realtime`] search later on are delivered
  /// as realtime data to the callbacks registered for their type tag.
  pub async fn request_condition<F>(
    &self,
    seq: &str,
    search_type: SearchType,
    callback: F,
  ) -> Result<(), Error>
  where
    F: FnOnce(Value) + Send + 'static,
  {
    let request = Request::Search {
      seq,
      search_type,
      exchange: "K",
      cont_yn: "N",
      next_key: "",
    };
    self.request(seq, &request, callback).await
  }

  /// Stop the realtime condition search identified by `seq`.
  ///
  /// A callback still awaiting the search's response is dropped
  /// without being invoked.
  pub async fn clear_condition(&self, seq: &str) -> Result<(), Error> {
    if self.cancel_request(seq) {
      debug!(seq, "dropped pending condition search callback");
    }
    self.send(&Request::Clear { seq }).await
  }
}
