// Copyright (C) 2024 The kiwoom Developers
// SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::HashMap;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::panic::catch_unwind;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use serde_json::Value;

use tracing::error;


/// A callback invoked for every realtime data element of a given type.
pub(crate) type Callback = Arc<dyn Fn(&Value) + Send + Sync>;

/// A callback invoked once for the response to a request.
pub(crate) type ResponseCallback = Box<dyn FnOnce(Value) + Send>;


/// Invoke `f`, containing any panic it may raise.
///
/// Returns `false` if `f` panicked.
fn isolated<F>(f: F) -> bool
where
  F: FnOnce(),
{
  catch_unwind(AssertUnwindSafe(f)).is_ok()
}


/// The registry of realtime data callbacks, keyed by type tag, and of
/// pending one-shot response callbacks, keyed by `seq`.
#[derive(Default)]
pub(crate) struct Callbacks {
  /// Callbacks per type tag, in registration order.
  by_tag: HashMap<String, Vec<Callback>>,
  /// Callbacks awaiting the response to a request.
  pending: HashMap<String, ResponseCallback>,
}

impl Callbacks {
  /// Append a callback for the given type tag.
  pub fn add(&mut self, tag: String, callback: Callback) {
    self.by_tag.entry(tag).or_default().push(callback)
  }

  /// Retrieve a snapshot of the callbacks registered for `tag`.
  pub fn get(&self, tag: &str) -> Vec<Callback> {
    self.by_tag.get(tag).cloned().unwrap_or_default()
  }

  /// Register a callback for the response with the given `seq`,
  /// replacing any previous one.
  pub fn add_pending(
    &mut self,
    seq: String,
    callback: ResponseCallback,
  ) -> Option<ResponseCallback> {
    self.pending.insert(seq, callback)
  }

  /// Remove and return the callback waiting for `seq`.
  pub fn take_pending(&mut self, seq: &str) -> Option<ResponseCallback> {
    self.pending.remove(seq)
  }
}

impl Debug for Callbacks {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    f.debug_struct("Callbacks")
      .field(
        "by_tag",
        &self
          .by_tag
          .iter()
          .map(|(tag, callbacks)| (tag, callbacks.len()))
          .collect::<HashMap<_, _>>(),
      )
      .field("pending", &self.pending.keys().collect::<Vec<_>>())
      .finish()
  }
}


/// Invoke each callback with `element`, isolating them from each
/// other.
///
/// Returns the number of callbacks that panicked.
pub(crate) fn dispatch(tag: &str, callbacks: &[Callback], element: &Value) -> usize {
  let mut panicked = 0;
  for callback in callbacks {
    if !isolated(|| callback(element)) {
      error!(tag = display(tag), "realtime callback panicked");
      panicked += 1;
    }
  }
  panicked
}


/// Invoke a one-shot response callback, containing any panic.
///
/// Returns `false` if the callback panicked.
pub(crate) fn respond(seq: &str, callback: ResponseCallback, message: Value) -> bool {
  let ok = isolated(move || callback(message));
  if !ok {
    error!(seq = display(seq), "response callback panicked");
  }
  ok
}
