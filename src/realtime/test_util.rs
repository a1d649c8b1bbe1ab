// Copyright (C) 2024 The kiwoom Developers
// SPDX-License-Identifier: GPL-3.0-or-later

use std::future::Future;
use std::net::SocketAddr;

use tokio::net::TcpListener;
use tokio::net::TcpStream;

use tracing::debug;
use tracing::warn;

use tungstenite::accept_async;
use tungstenite::tungstenite::Error as WebSocketError;

pub(crate) type WebSocketStream = tungstenite::WebSocketStream<TcpStream>;


/// Start a websocket server on a random local port, handing every
/// accepted connection to `f` along with its zero based index.
///
/// Connections are served one after the other, which allows tests to
/// script the behavior across reconnects.
pub(crate) async fn mock_server<F, R>(f: F) -> SocketAddr
where
  F: Fn(usize, WebSocketStream) -> R + Send + Sync + 'static,
  R: Future<Output = Result<(), WebSocketError>> + Send + 'static,
{
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();

  let _handle = tokio::spawn(async move {
    let mut index = 0;
    while let Ok((stream, _)) = listener.accept().await {
      let stream = match accept_async(stream).await {
        Ok(stream) => stream,
        Err(err) => {
          warn!("failed to accept websocket connection: {err}");
          continue
        },
      };

      debug!(index, "serving mock websocket connection");
      if let Err(err) = f(index, stream).await {
        debug!("mock websocket connection ended: {err}");
      }
      index += 1;
    }
  });

  addr
}
