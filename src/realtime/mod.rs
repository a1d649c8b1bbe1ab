// Copyright (C) 2024 The kiwoom Developers
// SPDX-License-Identifier: GPL-3.0-or-later

//! Access to the realtime websocket API.
//!
//! A [`Session`] logs in with a bearer token, registers interest in
//! realtime data of certain types for certain items, and invokes the
//! callbacks registered for a type whenever data of that type arrives.
//!
//! ```no_run
//! # use kiwoom::realtime::Session;
//! # use kiwoom::ApiInfo;
//! # use kiwoom::Client;
//! # use std::sync::Arc;
//! # #[tokio::main]
//! # async fn main() -> Result<(), kiwoom::Error> {
//! let client = Arc::new(Client::new(ApiInfo::from_env()?));
//! let session = client.realtime().build(Arc::clone(&client));
//! session.add_callback("0B", |element| println!("{element}"));
//! session.register(["005930"], ["0B"], "1", true).await?;
//! session.run().await
//! # }
//! ```

mod callbacks;
mod condition;
mod message;
mod retry;
mod session;
mod subscription;
#[cfg(test)]
mod test_util;

pub use condition::SearchType;
pub use retry::RetryPolicy;
pub use session::Builder;
pub use session::Event;
pub use session::Session;
pub use session::State;
