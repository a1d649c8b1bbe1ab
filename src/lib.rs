// Copyright (C) 2024 The kiwoom Developers
// SPDX-License-Identifier: GPL-3.0-or-later

#![allow(clippy::unreadable_literal)]
#![warn(
  bad_style,
  dead_code,
  future_incompatible,
  improper_ctypes,
  late_bound_lifetime_arguments,
  missing_copy_implementations,
  missing_debug_implementations,
  missing_docs,
  no_mangle_generic_items,
  non_shorthand_field_patterns,
  nonstandard_style,
  overflowing_literals,
  path_statements,
  patterns_in_fns_without_body,
  proc_macro_derive_resolution_fallback,
  renamed_and_removed_lints,
  rust_2018_compatibility,
  rust_2018_idioms,
  stable_features,
  trivial_bounds,
  trivial_numeric_casts,
  type_alias_bounds,
  tyvar_behind_raw_pointer,
  unconditional_recursion,
  unreachable_code,
  unreachable_patterns,
  unstable_features,
  unstable_name_collisions,
  unused,
  unused_comparisons,
  unused_import_braces,
  unused_lifetimes,
  unused_qualifications,
  unused_results,
  while_true,
)]

//! A crate for interacting with the Kiwoom Securities OpenAPI.
//!
//! The [`Client`] issues requests against the REST API, taking care of
//! acquiring and caching the required access token. The
//! [`realtime`] module provides a session with the realtime websocket
//! API, delivering streamed market data to user provided callbacks.

/// A module comprising the functionality backing interactions with the
/// REST API.
pub mod api;
pub mod realtime;

mod api_info;
mod client;
mod endpoint;
mod error;
mod time_util;
mod token;

use std::borrow::Cow;

pub use crate::api_info::ApiInfo;
pub use crate::client::Builder;
pub use crate::client::Client;
pub use crate::client::Continuation;
pub use crate::client::Paged;
pub use crate::endpoint::ApiError;
pub use crate::endpoint::Endpoint;
pub use crate::endpoint::EndpointError;
pub use crate::error::Error;
pub use crate::error::HttpBody;
pub use crate::error::RequestError;
pub use crate::token::StaticToken;
pub use crate::token::TokenSource;

type Str = Cow<'static, str>;
