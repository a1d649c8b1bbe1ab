// Copyright (C) 2024 The kiwoom Developers
// SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use crate::realtime::message::Registration;


/// The client side record of all realtime registrations, used for
/// restoring them after a reconnect.
///
/// Registrations are kept per group as a mapping from type tag to the
/// set of items the type is registered for.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct Subscriptions {
  groups: BTreeMap<String, BTreeMap<String, BTreeSet<String>>>,
}

impl Subscriptions {
  /// Record a registration of `types` for `items` in `group`.
  ///
  /// Unless `refresh` is set, earlier registrations of the group are
  /// dropped first.
  pub fn register(&mut self, group: &str, items: &[String], types: &[String], refresh: bool) {
    if !refresh {
      let _ = self.groups.remove(group);
    }

    let entries = self.groups.entry(group.to_string()).or_default();
    for type_ in types {
      entries
        .entry(type_.clone())
        .or_default()
        .extend(items.iter().cloned());
    }
    if entries.is_empty() {
      let _ = self.groups.remove(group);
    }
  }

  /// Remove the registration of `types` for `items` in `group`.
  pub fn unregister(&mut self, group: &str, items: &[String], types: &[String]) {
    if let Some(entries) = self.groups.get_mut(group) {
      for type_ in types {
        if let Some(registered) = entries.get_mut(type_) {
          for item in items {
            let _ = registered.remove(item);
          }
          if registered.is_empty() {
            let _ = entries.remove(type_);
          }
        }
      }
      if entries.is_empty() {
        let _ = self.groups.remove(group);
      }
    }
  }

  /// Check whether no registrations are recorded.
  #[cfg(test)]
  pub fn is_empty(&self) -> bool {
    self.groups.is_empty()
  }

  /// Produce the registrations to re-issue, one list per group.
  ///
  /// Types registered for the exact same set of items are combined
  /// into a single registration.
  pub fn replay(&self) -> Vec<(String, Vec<Registration>)> {
    self
      .groups
      .iter()
      .map(|(group, entries)| {
        let mut combined = BTreeMap::<&BTreeSet<String>, Vec<String>>::new();
        for (type_, items) in entries {
          combined.entry(items).or_default().push(type_.clone());
        }

        let registrations = combined
          .into_iter()
          .map(|(items, types)| Registration {
            items: items.iter().cloned().collect(),
            types,
          })
          .collect();
        (group.clone(), registrations)
      })
      .collect()
  }
}
