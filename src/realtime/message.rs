// Copyright (C) 2024 The kiwoom Developers
// SPDX-License-Identifier: GPL-3.0-or-later

use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::Deserialize;
use serde::Serialize;
use serde_json::from_str as from_json;
use serde_json::from_value;
use serde_json::Error as JsonError;
use serde_json::Value;


/// Serialize a boolean flag as the strings "1" and "0".
fn flag_to_str<S>(flag: &bool, serializer: S) -> Result<S::Ok, S::Error>
where
  S: Serializer,
{
  serializer.serialize_str(if *flag { "1" } else { "0" })
}


/// Deserialize a `seq` value that may be provided as string or number.
fn seq_from_value<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
  D: Deserializer<'de>,
{
  let seq = match Option::<Value>::deserialize(deserializer)? {
    Some(Value::String(seq)) => Some(seq),
    Some(Value::Number(seq)) => Some(seq.to_string()),
    _ => None,
  };
  Ok(seq)
}


/// A set of items and the realtime types to receive for them.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub(crate) struct Registration {
  /// The items (typically stock codes).
  #[serde(rename = "item")]
  pub items: Vec<String>,
  /// The realtime type tags.
  #[serde(rename = "type")]
  pub types: Vec<String>,
}


/// A control message sent to the realtime server.
#[derive(Debug, Serialize)]
#[serde(tag = "trnm")]
pub(crate) enum Request<'d> {
  /// Log in using a bearer token.
  #[serde(rename = "LOGIN")]
  Login {
    #[serde(rename = "token")]
    token: &'d str,
  },
  /// Declare interest in realtime data.
  #[serde(rename = "REG")]
  Register {
    #[serde(rename = "grp_no")]
    group: &'d str,
    #[serde(rename = "refresh", serialize_with = "flag_to_str")]
    refresh: bool,
    #[serde(rename = "data")]
    data: Vec<Registration>,
  },
  /// Withdraw interest in realtime data.
  #[serde(rename = "REMOVE")]
  Remove {
    #[serde(rename = "grp_no")]
    group: &'d str,
    #[serde(rename = "data")]
    data: Vec<Registration>,
  },
  /// A keepalive.
  #[serde(rename = "PING")]
  Ping,
}


/// The response to our login request.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub(crate) struct Login {
  /// Zero on success.
  #[serde(rename = "return_code")]
  pub code: i64,
  /// A human readable message.
  #[serde(rename = "return_msg", default)]
  pub message: String,
}


/// The envelope fields we inspect on every inbound message.
#[derive(Debug, Deserialize)]
struct Envelope {
  #[serde(rename = "trnm", default)]
  trnm: Option<String>,
  #[serde(rename = "seq", default, deserialize_with = "seq_from_value")]
  seq: Option<String>,
}


/// A message received from the realtime server.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Inbound {
  /// The response to a login request.
  Login(Login),
  /// A keepalive that has to be echoed back verbatim.
  Ping,
  /// Realtime data, one element per event.
  Real(Vec<Value>),
  /// A response correlated to an earlier request by its `seq`.
  Response {
    /// The `trnm` of the message.
    trnm: String,
    /// The sequence number identifying the request.
    seq: String,
    /// The full message.
    message: Value,
  },
  /// Any other message.
  Other(Option<String>),
}

impl Inbound {
  /// Parse and classify a text frame.
  pub fn parse(text: &str) -> Result<Self, JsonError> {
    let mut value = from_json::<Value>(text)?;
    let envelope = Envelope::deserialize(&value)?;

    let inbound = match envelope.trnm.as_deref() {
      Some("LOGIN") => Self::Login(from_value(value)?),
      Some("PING") => Self::Ping,
      Some("REAL") => {
        let data = match value.get_mut("data").map(Value::take) {
          None | Some(Value::Null) => Vec::new(),
          Some(data) => from_value::<Vec<Value>>(data)?,
        };
        Self::Real(data)
      },
      trnm => match (trnm, envelope.seq) {
        (Some(trnm), Some(seq)) => Self::Response {
          trnm: trnm.to_string(),
          seq,
          message: value,
        },
        (trnm, _) => Self::Other(trnm.map(str::to_string)),
      },
    };
    Ok(inbound)
  }
}


/// Retrieve the realtime type tag of a REAL data element.
pub(crate) fn type_tag(element: &Value) -> Option<&str> {
  element.get("type").and_then(Value::as_str)
}
