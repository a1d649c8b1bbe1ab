// Copyright (C) 2024 The kiwoom Developers
// SPDX-License-Identifier: GPL-3.0-or-later

use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;

use futures::future::join;
use futures::future::pending;
use futures::stream::SplitSink;
use futures::stream::SplitStream;
use futures::SinkExt as _;
use futures::StreamExt as _;

use serde::Serialize;
use serde_json::to_string as to_json;
use serde_json::Value;

use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::broadcast;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::time::interval;
use tokio::time::sleep;
use tokio::time::timeout;
use tokio::time::MissedTickBehavior;

use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::span;
use tracing::trace;
use tracing::warn;
use tracing::Level;
use tracing_futures::Instrument;

use tungstenite::connect_async;
use tungstenite::tungstenite::Message;
use tungstenite::MaybeTlsStream;
use tungstenite::WebSocketStream;

use url::Url;

use crate::realtime::callbacks::dispatch;
use crate::realtime::callbacks::respond;
use crate::realtime::callbacks::Callbacks;
use crate::realtime::message::type_tag;
use crate::realtime::message::Inbound;
use crate::realtime::message::Registration;
use crate::realtime::message::Request;
use crate::realtime::retry::RetryPolicy;
use crate::realtime::subscription::Subscriptions;
use crate::Error;
use crate::TokenSource;


/// The interval at which we send keepalive messages by default.
const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);
/// The number of events buffered per event receiver.
const EVENT_CAPACITY: usize = 64;
/// The time we grant the closing handshake before dropping the
/// connection.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

type Stream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Writer = SplitSink<Stream, Message>;
type Reader = SplitStream<Stream>;


/// The connection state of a [`Session`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum State {
  /// There is no connection.
  Disconnected,
  /// A connection is being established.
  Connecting,
  /// The connection is established and we wait for the server to
  /// acknowledge our login.
  AwaitingLoginAck,
  /// We are logged in and realtime data is being delivered.
  Ready,
}


/// A notable occurrence in the life of a [`Session`].
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
  /// A connection was established and the login request sent.
  Connected,
  /// The server accepted our login.
  Authenticated,
  /// The server rejected our login.
  LoginRejected {
    /// The `return_code` reported by the server.
    code: i64,
    /// The `return_msg` reported by the server.
    message: String,
  },
  /// The connection got closed.
  Disconnected,
  /// We are about to reconnect after the given delay.
  Reconnecting {
    /// The attempt, starting at one.
    attempt: u32,
    /// The delay before the attempt is made.
    delay: Duration,
  },
  /// The retry policy is exhausted and we stopped reconnecting.
  GaveUp,
  /// A message could not be parsed and got dropped.
  MalformedMessage(String),
  /// A callback panicked.
  CallbackPanicked {
    /// The type tag of the realtime data or the `trnm` of the response
    /// the callback was invoked for.
    tag: String,
  },
}


/// The result of reading from a single connection.
#[derive(Debug)]
enum Outcome {
  /// The connection was replaced or torn down by somebody else.
  Replaced,
  /// The server rejected our login.
  Rejected(Error),
  /// The connection broke.
  Lost(Error),
}


/// The write end of the current connection along with bookkeeping.
#[derive(Default)]
struct Connection {
  /// The generation of the connection.
  generation: u64,
  /// The sink we send messages through.
  writer: Option<Writer>,
  /// The stream of inbound messages, until the receive loop claims it,
  /// tagged with the generation of the connection.
  reader: Option<(u64, Reader)>,
}


/// A builder for a [`Session`].
#[derive(Clone, Debug)]
pub struct Builder {
  url: Url,
  auto_reconnect: bool,
  ping_interval: Duration,
  retry_policy: RetryPolicy,
}

impl Builder {
  /// Set whether to reconnect automatically after the connection got
  /// lost.
  ///
  /// Defaults to `true`.
  #[inline]
  pub fn auto_reconnect(&mut self, auto_reconnect: bool) -> &mut Self {
    self.auto_reconnect = auto_reconnect;
    self
  }

  /// Set the interval at which to send keepalive messages.
  ///
  /// Defaults to 30 seconds. A zero interval disables keepalive
  /// messages; those of the server are answered regardless.
  #[inline]
  pub fn ping_interval(&mut self, interval: Duration) -> &mut Self {
    self.ping_interval = interval;
    self
  }

  /// Set the policy governing reconnect attempts.
  #[inline]
  pub fn retry_policy(&mut self, policy: RetryPolicy) -> &mut Self {
    self.retry_policy = policy;
    self
  }

  /// Build the session, using `token_source` for retrieving the token
  /// to log in with.
  pub fn build<T>(&self, token_source: T) -> Session
  where
    T: TokenSource + 'static,
  {
    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    let (generation, _) = watch::channel(0);
    let (running, _) = watch::channel(true);
    let (state, _) = watch::channel(State::Disconnected);

    let inner = Inner {
      url: self.url.clone(),
      token_source: Box::new(token_source),
      auto_reconnect: self.auto_reconnect,
      ping_interval: self.ping_interval,
      retry_policy: self.retry_policy,
      connection: Mutex::new(Connection::default()),
      generation,
      running,
      run_lock: Mutex::new(()),
      state,
      events,
      callbacks: StdMutex::new(Callbacks::default()),
      subscriptions: StdMutex::new(Subscriptions::default()),
    };

    Session {
      inner: Arc::new(inner),
    }
  }
}


struct Inner {
  url: Url,
  token_source: Box<dyn TokenSource>,
  auto_reconnect: bool,
  ping_interval: Duration,
  retry_policy: RetryPolicy,
  /// The current connection, if any.
  connection: Mutex<Connection>,
  /// Bumped whenever a connection is established or torn down.
  generation: watch::Sender<u64>,
  /// Cleared once the session got disconnected by the user or gave up.
  running: watch::Sender<bool>,
  /// Held by `run`.
  run_lock: Mutex<()>,
  state: watch::Sender<State>,
  events: broadcast::Sender<Event>,
  callbacks: StdMutex<Callbacks>,
  subscriptions: StdMutex<Subscriptions>,
}


/// Wait until the value observed by `receiver` satisfies `f`.
async fn until<T, F>(receiver: &mut watch::Receiver<T>, f: F)
where
  F: Fn(&T) -> bool,
{
  loop {
    if f(&receiver.borrow_and_update()) {
      return
    }
    if receiver.changed().await.is_err() {
      // The sender lives as long as the session.
      pending::<()>().await
    }
  }
}


/// Connect to the websocket server at `url`.
async fn connect_internal(url: &Url) -> Result<Stream, Error> {
  let span = span!(Level::DEBUG, "stream");

  async move {
    debug!(message = "connecting", url = display(url));

    let (stream, response) = connect_async(url.as_str()).await?;
    debug!("connection successful");
    trace!(response = debug(&response));

    Ok(stream)
  }
  .instrument(span)
  .await
}


/// A session with the realtime websocket server.
///
/// A session maintains at most one connection. It logs in with a token
/// retrieved from its token source, routes realtime data to the
/// callbacks registered for its type tag, answers and sends keepalive
/// messages, and, if so configured, reconnects after the connection
/// got lost, restoring all registrations.
///
/// `Session` is a cheaply clonable handle. Inbound messages are only
/// processed while [`Session::run`] is active.
#[derive(Clone)]
pub struct Session {
  inner: Arc<Inner>,
}

impl Session {
  /// Create a [`Builder`] for a session with the server at `url`.
  pub fn builder(url: Url) -> Builder {
    Builder {
      url,
      auto_reconnect: true,
      ping_interval: DEFAULT_PING_INTERVAL,
      retry_policy: RetryPolicy::default(),
    }
  }

  /// Retrieve the current connection state.
  #[inline]
  pub fn state(&self) -> State {
    *self.inner.state.borrow()
  }

  /// Retrieve a receiver for observing state changes.
  #[inline]
  pub fn state_changes(&self) -> watch::Receiver<State> {
    self.inner.state.subscribe()
  }

  /// Subscribe to the [`Event`]s of this session.
  ///
  /// Only events occurring after the subscription are received.
  #[inline]
  pub fn events(&self) -> broadcast::Receiver<Event> {
    self.inner.events.subscribe()
  }

  fn set_state(&self, state: State) {
    let previous = self.inner.state.send_replace(state);
    if previous != state {
      debug!(from = debug(previous), to = debug(state), "state changed");
    }
  }

  fn emit(&self, event: Event) {
    // An error just means that nobody is listening.
    let _ = self.inner.events.send(event);
  }

  fn callbacks(&self) -> MutexGuard<'_, Callbacks> {
    self
      .inner
      .callbacks
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  fn subscriptions(&self) -> MutexGuard<'_, Subscriptions> {
    self
      .inner
      .subscriptions
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  fn is_running(&self) -> bool {
    *self.inner.running.borrow()
  }

  fn stop(&self) {
    let _ = self.inner.running.send_replace(false);
  }

  /// Establish a connection and send the login request.
  ///
  /// Success means that the login was initiated. Whether it got
  /// accepted is decided once [`Session::run`] processes the server's
  /// response, which can be observed via [`Session::state_changes`] and
  /// [`Session::events`]. If a connection exists already this is a
  /// no-op.
  pub async fn connect(&self) -> Result<(), Error> {
    let _ = self.inner.running.send_replace(true);
    self.establish().await
  }

  async fn establish(&self) -> Result<(), Error> {
    let mut connection = self.inner.connection.lock().await;
    if connection.writer.is_some() {
      return Ok(())
    }

    self.set_state(State::Connecting);

    let result: Result<_, Error> = async {
      let token = self.inner.token_source.token().await?;
      let login = to_json(&Request::Login { token: &token })?;
      let stream = connect_internal(&self.inner.url).await?;
      Ok((login, stream))
    }
    .await;

    let (login, stream) = match result {
      Ok(result) => result,
      Err(err) => {
        error!(url = display(&self.inner.url), "failed to connect: {err}");
        self.set_state(State::Disconnected);
        return Err(err)
      },
    };

    let (mut writer, reader) = stream.split();
    self.set_state(State::AwaitingLoginAck);

    if let Err(err) = writer.send(Message::Text(login)).await {
      error!("failed to send login request: {err}");
      self.set_state(State::Disconnected);
      return Err(err.into())
    }

    let mut generation = 0;
    self.inner.generation.send_modify(|current| {
      *current += 1;
      generation = *current;
    });

    connection.generation = generation;
    connection.writer = Some(writer);
    connection.reader = Some((generation, reader));
    info!(url = display(&self.inner.url), "connected");
    self.emit(Event::Connected);
    Ok(())
  }

  /// Close the connection with the given generation, or whatever
  /// connection exists if `generation` is `None`.
  async fn teardown(&self, generation: Option<u64>) {
    // The generation is bumped before acquiring the connection, which
    // makes pending writes release it.
    let mut previous = 0;
    let bumped = self.inner.generation.send_if_modified(|current| {
      if generation.is_some_and(|generation| generation != *current) {
        return false
      }
      previous = *current;
      *current += 1;
      true
    });
    if !bumped {
      return
    }

    let mut connection = self.inner.connection.lock().await;
    if generation.is_some() && connection.generation != previous {
      // A new connection got established in the meantime.
      return
    }

    let _ = connection.reader.take();

    if let Some(mut writer) = connection.writer.take() {
      match timeout(CLOSE_TIMEOUT, writer.close()).await {
        Ok(Ok(())) => (),
        Ok(Err(err)) => debug!("failed to close connection cleanly: {err}"),
        Err(_) => debug!("timed out closing connection"),
      }
      self.set_state(State::Disconnected);
      info!("disconnected");
      self.emit(Event::Disconnected);
    } else {
      self.set_state(State::Disconnected);
    }
  }

  /// Close the connection and stop [`Session::run`].
  pub async fn disconnect(&self) {
    self.stop();
    self.teardown(None).await
  }

  /// Close the current connection, if any, and establish a new one.
  pub async fn reconnect(&self) -> Result<(), Error> {
    self.teardown(None).await;
    self.connect().await
  }

  async fn write(&self, text: String) -> Result<(), Error> {
    let mut generations = self.inner.generation.subscribe();
    let mut connection = self.inner.connection.lock().await;
    let generation = connection.generation;
    let writer = connection.writer.as_mut().ok_or(Error::NotConnected)?;

    trace!(text = display(&text), "sending");
    // A peer not reading anymore must not keep the connection from
    // getting torn down.
    select! {
      biased;
      () = until(&mut generations, |current| *current != generation) => {
        debug!("connection torn down while sending");
        Err(Error::NotConnected)
      },
      result = writer.send(Message::Text(text)) => result.map_err(Error::from),
    }
  }

  /// Send a message to the server.
  ///
  /// An established connection is required, otherwise
  /// [`Error::NotConnected`] is reported.
  pub async fn send<M>(&self, message: &M) -> Result<(), Error>
  where
    M: Serialize + ?Sized,
  {
    let text = to_json(message)?;
    self.write(text).await
  }

  /// Register interest in realtime data of the given `types` for
  /// `items`, as part of `group`.
  ///
  /// With `refresh` set the registration is added to earlier ones of
  /// the group, otherwise it replaces them. If the session is not
  /// logged in yet, the registration is sent once it is. All
  /// registrations are restored after a reconnect.
  pub async fn register<I, T>(
    &self,
    items: I,
    types: T,
    group: &str,
    refresh: bool,
  ) -> Result<(), Error>
  where
    I: IntoIterator,
    I::Item: Into<String>,
    T: IntoIterator,
    T::Item: Into<String>,
  {
    let items = items.into_iter().map(Into::into).collect::<Vec<_>>();
    let types = types.into_iter().map(Into::into).collect::<Vec<_>>();
    self
      .subscriptions()
      .register(group, &items, &types, refresh);

    if self.state() != State::Ready {
      debug!(group, "deferring registration until logged in");
      return Ok(())
    }

    let request = Request::Register {
      group,
      refresh,
      data: vec![Registration { items, types }],
    };
    self.send(&request).await
  }

  /// Withdraw interest in realtime data of the given `types` for
  /// `items` in `group`.
  pub async fn unregister<I, T>(&self, items: I, types: T, group: &str) -> Result<(), Error>
  where
    I: IntoIterator,
    I::Item: Into<String>,
    T: IntoIterator,
    T::Item: Into<String>,
  {
    let items = items.into_iter().map(Into::into).collect::<Vec<_>>();
    let types = types.into_iter().map(Into::into).collect::<Vec<_>>();
    self.subscriptions().unregister(group, &items, &types);

    if self.state() != State::Ready {
      return Ok(())
    }

    let request = Request::Remove {
      group,
      data: vec![Registration { items, types }],
    };
    self.send(&request).await
  }

  /// Add a callback to invoke for every realtime data element with
  /// type tag `tag`.
  ///
  /// Callbacks for the same tag are invoked in the order they were
  /// added. A panicking callback does not affect the others.
  pub fn add_callback<F>(&self, tag: impl Into<String>, callback: F)
  where
    F: Fn(&Value) + Send + Sync + 'static,
  {
    self.callbacks().add(tag.into(), Arc::new(callback))
  }

  /// Send `message` and invoke `callback` once with the first response
  /// carrying the sequence number `seq`.
  ///
  /// A pending callback for the same `seq` is replaced.
  pub async fn request<M, F>(&self, seq: &str, message: &M, callback: F) -> Result<(), Error>
  where
    M: Serialize + ?Sized,
    F: FnOnce(Value) + Send + 'static,
  {
    let _ = self
      .callbacks()
      .add_pending(seq.to_string(), Box::new(callback));

    if let Err(err) = self.send(message).await {
      let _ = self.cancel_request(seq);
      return Err(err)
    }
    Ok(())
  }

  /// Forget the callback awaiting the response with sequence number
  /// `seq`.
  ///
  /// Returns whether a callback was pending.
  pub fn cancel_request(&self, seq: &str) -> bool {
    self.callbacks().take_pending(seq).is_some()
  }

  /// Re-issue all recorded registrations.
  async fn replay(&self) {
    let groups = self.subscriptions().replay();
    for (group, data) in groups {
      let request = Request::Register {
        group: &group,
        refresh: true,
        data,
      };
      if let Err(err) = self.send(&request).await {
        warn!(group = display(&group), "failed to restore registration: {err}");
      }
    }
  }

  /// Handle a single text message.
  ///
  /// An error is reported only if the server rejected our login.
  async fn handle_text(&self, text: String, attempt: &mut u32) -> Result<(), Error> {
    trace!(text = display(&text), "received");

    let inbound = match Inbound::parse(&text) {
      Ok(inbound) => inbound,
      Err(err) => {
        warn!(text = display(&text), "dropping malformed message: {err}");
        self.emit(Event::MalformedMessage(text));
        return Ok(())
      },
    };

    match inbound {
      Inbound::Login(login) => {
        if self.state() != State::AwaitingLoginAck {
          debug!("ignoring unexpected login response");
          return Ok(())
        }

        if login.code != 0 {
          error!(
            code = login.code,
            reason = display(&login.message),
            "login rejected"
          );
          self.emit(Event::LoginRejected {
            code: login.code,
            message: login.message.clone(),
          });
          return Err(Error::LoginRejected {
            code: login.code,
            message: login.message,
          })
        }

        info!("logged in");
        *attempt = 0;
        self.set_state(State::Ready);
        self.emit(Event::Authenticated);
        self.replay().await;
      },
      Inbound::Ping => {
        if let Err(err) = self.write(text).await {
          warn!("failed to answer keepalive: {err}");
        }
      },
      Inbound::Real(data) => {
        if self.state() != State::Ready {
          debug!("dropping realtime data received before login");
          return Ok(())
        }

        for element in &data {
          let tag = match type_tag(element) {
            Some(tag) => tag,
            None => {
              warn!(element = display(element), "dropping realtime data without type");
              continue
            },
          };

          let callbacks = self.callbacks().get(tag);
          let panicked = dispatch(tag, &callbacks, element);
          for _ in 0..panicked {
            self.emit(Event::CallbackPanicked {
              tag: tag.to_string(),
            });
          }
        }
      },
      Inbound::Response { trnm, seq, message } => {
        if self.state() != State::Ready {
          debug!(trnm = display(&trnm), "dropping response received before login");
          return Ok(())
        }

        let callback = self.callbacks().take_pending(&seq);
        match callback {
          Some(callback) => {
            if !respond(&seq, callback, message) {
              self.emit(Event::CallbackPanicked { tag: trnm });
            }
          },
          None => debug!(
            trnm = display(&trnm),
            seq = display(&seq),
            "ignoring uncorrelated response"
          ),
        }
      },
      Inbound::Other(trnm) => {
        debug!(trnm = debug(trnm), "ignoring message");
      },
    }
    Ok(())
  }

  /// Process messages from a single connection until it breaks or gets
  /// replaced.
  async fn receive(&self, generation: u64, mut reader: Reader, attempt: &mut u32) -> Outcome {
    let mut generations = self.inner.generation.subscribe();

    loop {
      let message = select! {
        () = until(&mut generations, |current| *current != generation) => {
          return Outcome::Replaced
        },
        message = reader.next() => message,
      };

      match message {
        Some(Ok(Message::Text(text))) => {
          if let Err(err) = self.handle_text(text, attempt).await {
            return Outcome::Rejected(err)
          }
        },
        Some(Ok(Message::Close(frame))) => {
          debug!(frame = debug(frame), "connection closed by server");
          return Outcome::Lost(Error::ConnectionClosed)
        },
        Some(Ok(other)) => {
          trace!(frame = debug(other), "ignoring non-text message");
        },
        Some(Err(err)) => return Outcome::Lost(err.into()),
        None => return Outcome::Lost(Error::ConnectionClosed),
      }
    }
  }

  /// Wait for `delay` to pass, unless the session gets stopped first.
  ///
  /// Returns `false` if the session got stopped.
  async fn pause(&self, delay: Duration) -> bool {
    let mut running = self.inner.running.subscribe();

    select! {
      () = until(&mut running, |running| !*running) => false,
      () = sleep(delay) => true,
    }
  }

  async fn receive_loop(&self) -> Result<(), Error> {
    let mut attempt = 0;

    loop {
      if !self.is_running() {
        return Ok(())
      }

      let reader = self.inner.connection.lock().await.reader.take();
      let err = match reader {
        Some((generation, reader)) => match self.receive(generation, reader, &mut attempt).await {
          Outcome::Replaced => continue,
          Outcome::Rejected(err) => {
            self.stop();
            self.teardown(Some(generation)).await;
            return Err(err)
          },
          Outcome::Lost(err) => {
            warn!("connection lost: {err}");
            self.teardown(Some(generation)).await;
            err
          },
        },
        None => match self.establish().await {
          Ok(()) => continue,
          Err(err) => err,
        },
      };

      if !self.is_running() {
        return Ok(())
      }

      if !self.inner.auto_reconnect {
        self.stop();
        return Err(err)
      }

      attempt += 1;
      match self.inner.retry_policy.delay(attempt) {
        Some(delay) => {
          warn!(attempt, delay = debug(delay), "reconnecting");
          self.emit(Event::Reconnecting { attempt, delay });
          if !self.pause(delay).await {
            return Ok(())
          }
        },
        None => {
          error!(attempt, "giving up reconnecting: {err}");
          self.emit(Event::GaveUp);
          self.stop();
          return Err(err)
        },
      }
    }
  }

  async fn ping_loop(&self) {
    let mut running = self.inner.running.subscribe();
    if self.inner.ping_interval.is_zero() {
      debug!("keepalive messages disabled");
      let () = until(&mut running, |running| !*running).await;
      return
    }

    let mut ticks = interval(self.inner.ping_interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    let _ = ticks.tick().await;

    loop {
      select! {
        () = until(&mut running, |running| !*running) => break,
        _ = ticks.tick() => {
          if self.state() == State::Ready {
            if let Err(err) = self.send(&Request::Ping).await {
              warn!("failed to send keepalive: {err}");
            }
          }
        },
      }
    }
  }

  /// Process inbound messages and send keepalive messages until the
  /// session is disconnected.
  ///
  /// A connection is established first if there is none. `Ok` is
  /// reported once [`Session::disconnect`] got called. Otherwise an
  /// error is reported when the server rejected our login, or when the
  /// connection got lost and reconnecting is disabled or exhausted.
  pub async fn run(&self) -> Result<(), Error> {
    let _guard = self
      .inner
      .run_lock
      .try_lock()
      .map_err(|_| Error::Str("the session is already running".into()))?;

    let (result, ()) = join(self.receive_loop(), self.ping_loop()).await;
    result
  }
}

impl Debug for Session {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    f.debug_struct("Session")
      .field("url", &self.inner.url.as_str())
      .field("state", &self.state())
      .field("auto_reconnect", &self.inner.auto_reconnect)
      .field("ping_interval", &self.inner.ping_interval)
      .field("retry_policy", &self.inner.retry_policy)
      .finish()
  }
}


#[cfg(test)]
mod tests {
  use super::*;

  use std::future::Future;
  use std::net::SocketAddr;
  use std::sync::atomic::AtomicUsize;
  use std::sync::atomic::Ordering;

  use serde_json::json;

  use test_log::test;

  use tokio::net::TcpListener;
  use tokio::spawn;
  use tokio::sync::mpsc::unbounded_channel;
  use tokio::sync::mpsc::UnboundedReceiver;
  use tokio::task::JoinHandle;
  use tokio::time::timeout;

  use tungstenite::tungstenite::Error as WebSocketError;

  use crate::realtime::test_util::mock_server;
  use crate::realtime::test_util::WebSocketStream as MockStream;
  use crate::realtime::SearchType;
  use crate::StaticToken;


  const TOKEN: &str = "token-123";
  const LOGIN_REQ: &str = r#"{"trnm":"LOGIN","token":"token-123"}"#;
  const LOGIN_OK: &str = r#"{"trnm":"LOGIN","return_code":0,"return_msg":""}"#;
  const LOGIN_BAD: &str = r#"{"trnm":"LOGIN","return_code":1,"return_msg":"bad token"}"#;
  const REG_0B: &str = {
    r#"{"trnm":"REG","grp_no":"1","refresh":"1","data":[{"item":["005930"],"type":["0B"]}]}"#
  };
  const REAL_0B: &str = {
    r#"{"trnm":"REAL","data":[{"type":"0B","item":"005930","price":"70000"}]}"#
  };
  const TIMEOUT: Duration = Duration::from_secs(10);


  /// Perform the server side of the login handshake.
  async fn login(stream: &mut MockStream) -> Result<(), WebSocketError> {
    assert_eq!(
      stream.next().await.unwrap()?,
      Message::Text(LOGIN_REQ.to_string())
    );
    stream.send(Message::Text(LOGIN_OK.to_string())).await
  }

  /// Consume messages until the client closes the connection.
  async fn idle(mut stream: MockStream) -> Result<(), WebSocketError> {
    while let Some(message) = stream.next().await {
      let _ = message?;
    }
    Ok(())
  }

  fn session(addr: SocketAddr) -> Builder {
    let url = Url::parse(&format!("ws://{addr}")).unwrap();
    let mut builder = Session::builder(url);
    let _ = builder.auto_reconnect(false);
    builder
  }

  fn run(session: &Session) -> JoinHandle<Result<(), Error>> {
    let session = session.clone();
    spawn(async move { session.run().await })
  }

  async fn within<F>(future: F) -> F::Output
  where
    F: Future,
  {
    timeout(TIMEOUT, future).await.unwrap()
  }

  async fn wait_for_state(session: &Session, state: State) {
    let mut states = session.state_changes();
    let _ = within(states.wait_for(|current| *current == state))
      .await
      .unwrap();
  }

  async fn next_text(receiver: &mut UnboundedReceiver<String>) -> String {
    within(receiver.recv()).await.unwrap()
  }


  /// Check that a successful login makes the session ready.
  #[test(tokio::test)]
  async fn login_success() {
    let addr = mock_server(|_, mut stream| async move {
      login(&mut stream).await?;
      idle(stream).await
    })
    .await;

    let session = session(addr).build(StaticToken::new(TOKEN));
    let mut events = session.events();
    assert_eq!(session.state(), State::Disconnected);

    let () = session.connect().await.unwrap();
    assert_eq!(session.state(), State::AwaitingLoginAck);

    let handle = run(&session);
    wait_for_state(&session, State::Ready).await;

    // Connecting again does not establish a second connection.
    let () = session.connect().await.unwrap();
    assert_eq!(session.state(), State::Ready);

    session.disconnect().await;
    let () = within(handle).await.unwrap().unwrap();
    assert_eq!(session.state(), State::Disconnected);

    assert_eq!(events.recv().await.unwrap(), Event::Connected);
    assert_eq!(events.recv().await.unwrap(), Event::Authenticated);
    assert_eq!(events.recv().await.unwrap(), Event::Disconnected);
  }

  /// Check that a rejected login tears down the connection and is
  /// reported.
  #[test(tokio::test)]
  async fn login_rejected() {
    let addr = mock_server(|_, mut stream| async move {
      let _ = stream.next().await.unwrap()?;
      stream.send(Message::Text(LOGIN_BAD.to_string())).await?;
      idle(stream).await
    })
    .await;

    let session = session(addr).build(StaticToken::new(TOKEN));
    let mut events = session.events();

    let () = session.connect().await.unwrap();
    let result = within(session.run()).await;
    match result {
      Err(Error::LoginRejected { code, message }) => {
        assert_eq!(code, 1);
        assert_eq!(message, "bad token");
      },
      result => panic!("unexpected result: {result:?}"),
    }

    assert_eq!(session.state(), State::Disconnected);

    let err = session.send(&json!({"trnm": "PING"})).await.unwrap_err();
    assert!(matches!(err, Error::NotConnected), "{err:?}");

    assert_eq!(events.recv().await.unwrap(), Event::Connected);
    assert_eq!(
      events.recv().await.unwrap(),
      Event::LoginRejected {
        code: 1,
        message: "bad token".to_string(),
      }
    );
    assert_eq!(events.recv().await.unwrap(), Event::Disconnected);
  }

  /// Check that keepalive messages from the server are echoed
  /// verbatim.
  #[test(tokio::test)]
  async fn ping_echo() {
    const PING: &str = r#"{"trnm":"PING","x":"1"}"#;

    let (sender, mut receiver) = unbounded_channel();
    let addr = mock_server(move |_, mut stream| {
      let sender = sender.clone();
      async move {
        login(&mut stream).await?;
        stream.send(Message::Text(PING.to_string())).await?;
        let message = stream.next().await.unwrap()?;
        let _ = sender.send(message.into_text()?);
        idle(stream).await
      }
    })
    .await;

    let session = session(addr).build(StaticToken::new(TOKEN));
    let handle = run(&session);

    assert_eq!(next_text(&mut receiver).await, PING);

    session.disconnect().await;
    let () = within(handle).await.unwrap().unwrap();
  }

  /// Check that realtime data elements are routed by their type tag,
  /// exactly once each.
  #[test(tokio::test)]
  async fn realtime_dispatch() {
    const REAL: &str = {
      r#"{"trnm":"REAL","data":[{"type":"0B","item":"005930","price":"70000"},{"type":"0D","item":"005930"}]}"#
    };

    let (sender, mut receiver) = unbounded_channel();
    let addr = mock_server(move |_, mut stream| {
      let sender = sender.clone();
      async move {
        login(&mut stream).await?;
        let message = stream.next().await.unwrap()?;
        let _ = sender.send(message.into_text()?);
        stream.send(Message::Text(REAL.to_string())).await?;
        idle(stream).await
      }
    })
    .await;

    let session = session(addr).build(StaticToken::new(TOKEN));
    let () = session
      .register(["005930"], ["0B"], "1", true)
      .await
      .unwrap();

    let (data_sender, mut data) = unbounded_channel();
    for id in 0..2 {
      let data_sender = data_sender.clone();
      session.add_callback("0B", move |element| {
        let _ = data_sender.send((id, element.clone()));
      });
    }
    let other = data_sender.clone();
    session.add_callback("0D", move |element| {
      let _ = other.send((2, element.clone()));
    });

    let handle = run(&session);
    assert_eq!(next_text(&mut receiver).await, REG_0B);

    let expected = json!({"type": "0B", "item": "005930", "price": "70000"});
    assert_eq!(within(data.recv()).await.unwrap(), (0, expected.clone()));
    assert_eq!(within(data.recv()).await.unwrap(), (1, expected));
    let (id, element) = within(data.recv()).await.unwrap();
    assert_eq!(id, 2);
    assert_eq!(type_tag(&element), Some("0D"));
    assert!(data.try_recv().is_err());

    session.disconnect().await;
    let () = within(handle).await.unwrap().unwrap();
  }

  /// Check that a panicking callback does not stop message processing.
  #[test(tokio::test)]
  async fn panicking_callback() {
    const REAL_0A: &str = r#"{"trnm":"REAL","data":[{"type":"0A","item":"005930"}]}"#;

    let addr = mock_server(|_, mut stream| async move {
      login(&mut stream).await?;
      stream.send(Message::Text(REAL_0A.to_string())).await?;
      stream.send(Message::Text(REAL_0B.to_string())).await?;
      idle(stream).await
    })
    .await;

    let session = session(addr).build(StaticToken::new(TOKEN));
    let mut events = session.events();
    session.add_callback("0A", |_| panic!("callback failure"));

    let (sender, mut data) = unbounded_channel();
    session.add_callback("0B", move |element| {
      let _ = sender.send(element.clone());
    });

    let handle = run(&session);
    let element = within(data.recv()).await.unwrap();
    assert_eq!(element["price"], "70000");

    loop {
      if let Event::CallbackPanicked { tag } = within(events.recv()).await.unwrap() {
        assert_eq!(tag, "0A");
        break
      }
    }

    session.disconnect().await;
    let () = within(handle).await.unwrap().unwrap();
  }

  /// Check that malformed messages and realtime data received before
  /// the login got acknowledged are dropped.
  #[test(tokio::test)]
  async fn drop_unexpected_messages() {
    const EARLY: &str = {
      r#"{"trnm":"REAL","data":[{"type":"0B","item":"005930","price":"1"}]}"#
    };

    let addr = mock_server(|_, mut stream| async move {
      let _ = stream.next().await.unwrap()?;
      stream.send(Message::Text(EARLY.to_string())).await?;
      stream.send(Message::Text("{ foobarbaz }".to_string())).await?;
      stream.send(Message::Text(LOGIN_OK.to_string())).await?;
      stream.send(Message::Text("{ foobarbaz }".to_string())).await?;
      stream.send(Message::Text(REAL_0B.to_string())).await?;
      idle(stream).await
    })
    .await;

    let session = session(addr).build(StaticToken::new(TOKEN));
    let mut events = session.events();
    let (sender, mut data) = unbounded_channel();
    session.add_callback("0B", move |element: &Value| {
      let _ = sender.send(element["price"].clone());
    });

    let handle = run(&session);
    assert_eq!(within(data.recv()).await.unwrap(), "70000");
    assert!(data.try_recv().is_err());

    let mut malformed = 0;
    while let Ok(event) = events.try_recv() {
      if let Event::MalformedMessage(text) = event {
        assert_eq!(text, "{ foobarbaz }");
        malformed += 1;
      }
    }
    assert_eq!(malformed, 2);

    session.disconnect().await;
    let () = within(handle).await.unwrap().unwrap();
  }

  /// Check that a lost connection is re-established and that the login
  /// and all registrations are replayed.
  #[test(tokio::test)]
  async fn reconnect_and_replay() {
    let (sender, mut receiver) = unbounded_channel();
    let addr = mock_server(move |index, mut stream| {
      let sender = sender.clone();
      async move {
        let login_req = stream.next().await.unwrap()?;
        let _ = sender.send((index, login_req.into_text()?));
        stream.send(Message::Text(LOGIN_OK.to_string())).await?;

        let register = stream.next().await.unwrap()?;
        let _ = sender.send((index, register.into_text()?));

        if index == 0 {
          // Drop the connection without a closing handshake.
          Ok(())
        } else {
          idle(stream).await
        }
      }
    })
    .await;

    let url = Url::parse(&format!("ws://{addr}")).unwrap();
    let session = Session::builder(url)
      .retry_policy(RetryPolicy::fixed(Duration::from_millis(50)))
      .build(StaticToken::new(TOKEN));
    let mut events = session.events();

    let () = session
      .register(["005930"], ["0B"], "1", true)
      .await
      .unwrap();

    let handle = run(&session);

    for index in 0..2 {
      assert_eq!(
        within(receiver.recv()).await.unwrap(),
        (index, LOGIN_REQ.to_string())
      );
      assert_eq!(
        within(receiver.recv()).await.unwrap(),
        (index, REG_0B.to_string())
      );
    }
    wait_for_state(&session, State::Ready).await;

    let mut reconnecting = None;
    while let Ok(event) = events.try_recv() {
      if let Event::Reconnecting { attempt, delay } = event {
        reconnecting = Some((attempt, delay));
      }
    }
    assert_eq!(reconnecting, Some((1, Duration::from_millis(50))));

    session.disconnect().await;
    let () = within(handle).await.unwrap().unwrap();
  }

  /// Check that without automatic reconnects a lost connection stays
  /// lost.
  #[test(tokio::test)]
  async fn no_reconnect() {
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&connections);
    let addr = mock_server(move |_, mut stream| {
      let _ = counter.fetch_add(1, Ordering::SeqCst);
      async move {
        login(&mut stream).await?;
        stream.close(None).await
      }
    })
    .await;

    let session = session(addr).build(StaticToken::new(TOKEN));
    let result = within(session.run()).await;
    assert!(matches!(result, Err(Error::ConnectionClosed)), "{result:?}");
    assert_eq!(session.state(), State::Disconnected);

    sleep(Duration::from_millis(100)).await;
    assert_eq!(connections.load(Ordering::SeqCst), 1);
  }

  /// Check that we give up reconnecting once the retry policy is
  /// exhausted.
  #[test(tokio::test)]
  async fn give_up() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let url = Url::parse(&format!("ws://{addr}")).unwrap();
    let session = Session::builder(url)
      .retry_policy(RetryPolicy::fixed(Duration::from_millis(10)).with_max_attempts(2))
      .build(StaticToken::new(TOKEN));
    let mut events = session.events();

    let result = within(session.run()).await;
    assert!(result.is_err());
    assert_eq!(session.state(), State::Disconnected);

    let mut received = Vec::new();
    while let Ok(event) = events.try_recv() {
      received.push(event);
    }
    let delay = Duration::from_millis(10);
    assert_eq!(
      received,
      vec![
        Event::Reconnecting { attempt: 1, delay },
        Event::Reconnecting { attempt: 2, delay },
        Event::GaveUp,
      ]
    );
  }

  /// Check that failing to connect is reported and that sending
  /// requires a connection.
  #[test(tokio::test)]
  async fn connect_failure() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let session = session(addr).build(StaticToken::new(TOKEN));
    let err = session.send(&Request::Ping).await.unwrap_err();
    assert!(matches!(err, Error::NotConnected), "{err:?}");

    let err = session.connect().await.unwrap_err();
    assert!(matches!(err, Error::WebSocket(..)), "{err:?}");
    assert_eq!(session.state(), State::Disconnected);
  }

  /// Check that responses are correlated with requests by their `seq`
  /// and delivered only once.
  #[test(tokio::test)]
  async fn condition_request() {
    const CNSRREQ: &str = {
      r#"{"trnm":"CNSRREQ","seq":"4","search_type":"0","stex_tp":"K","cont_yn":"N","next_key":""}"#
    };
    const RESPONSE: &str = {
      r#"{"trnm":"CNSRREQ","seq":"4","return_code":0,"data":[{"jmcode":"005930"}]}"#
    };

    let (sender, mut receiver) = unbounded_channel();
    let addr = mock_server(move |_, mut stream| {
      let sender = sender.clone();
      async move {
        login(&mut stream).await?;
        let request = stream.next().await.unwrap()?;
        let _ = sender.send(request.into_text()?);
        stream.send(Message::Text(RESPONSE.to_string())).await?;
        stream.send(Message::Text(RESPONSE.to_string())).await?;
        stream.send(Message::Text(REAL_0B.to_string())).await?;

        let clear = stream.next().await.unwrap()?;
        let _ = sender.send(clear.into_text()?);
        idle(stream).await
      }
    })
    .await;

    let session = session(addr).build(StaticToken::new(TOKEN));
    let (data_sender, mut data) = unbounded_channel();
    session.add_callback("0B", move |_| {
      let _ = data_sender.send(());
    });

    let handle = run(&session);
    wait_for_state(&session, State::Ready).await;

    let responses = Arc::new(StdMutex::new(Vec::new()));
    let slot = Arc::clone(&responses);
    let () = session
      .request_condition("4", SearchType::General, move |response| {
        slot.lock().unwrap().push(response)
      })
      .await
      .unwrap();
    assert_eq!(next_text(&mut receiver).await, CNSRREQ);

    // Messages are processed in order, so both responses have been
    // handled once the realtime data arrived.
    let () = within(data.recv()).await.unwrap();
    {
      let responses = responses.lock().unwrap();
      assert_eq!(responses.len(), 1);
      assert_eq!(responses[0]["data"][0]["jmcode"], "005930");
    }

    let () = session.clear_condition("4").await.unwrap();
    assert_eq!(
      next_text(&mut receiver).await,
      r#"{"trnm":"CNSRCLR","seq":"4"}"#
    );

    session.disconnect().await;
    let () = within(handle).await.unwrap().unwrap();
  }

  /// Check that clearing a condition search drops the callback still
  /// waiting for its response.
  #[test(tokio::test)]
  async fn clear_pending_condition() {
    const RESPONSE: &str = {
      r#"{"trnm":"CNSRREQ","seq":"7","return_code":0,"data":[{"jmcode":"005930"}]}"#
    };

    let (sender, mut receiver) = unbounded_channel();
    let addr = mock_server(move |_, mut stream| {
      let sender = sender.clone();
      async move {
        login(&mut stream).await?;
        for _ in 0..2 {
          let message = stream.next().await.unwrap()?;
          let _ = sender.send(message.into_text()?);
        }
        // The response arrives only after the search got cleared.
        stream.send(Message::Text(RESPONSE.to_string())).await?;
        stream.send(Message::Text(REAL_0B.to_string())).await?;
        idle(stream).await
      }
    })
    .await;

    let session = session(addr).build(StaticToken::new(TOKEN));
    let (data_sender, mut data) = unbounded_channel();
    session.add_callback("0B", move |_| {
      let _ = data_sender.send(());
    });

    let handle = run(&session);
    wait_for_state(&session, State::Ready).await;

    let responses = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&responses);
    let () = session
      .request_condition("7", SearchType::Realtime, move |_| {
        let _ = counter.fetch_add(1, Ordering::SeqCst);
      })
      .await
      .unwrap();
    let request = next_text(&mut receiver).await;
    assert!(request.starts_with(r#"{"trnm":"CNSRREQ","seq":"7""#), "{request}");

    let () = session.clear_condition("7").await.unwrap();
    assert_eq!(
      next_text(&mut receiver).await,
      r#"{"trnm":"CNSRCLR","seq":"7"}"#
    );
    assert!(!session.cancel_request("7"));

    // The realtime data is handled after the late response.
    let () = within(data.recv()).await.unwrap();
    assert_eq!(responses.load(Ordering::SeqCst), 0);

    session.disconnect().await;
    let () = within(handle).await.unwrap().unwrap();
  }

  /// Check that we send keepalive messages periodically.
  #[test(tokio::test)]
  async fn ping_sender() {
    let (sender, mut receiver) = unbounded_channel();
    let addr = mock_server(move |_, mut stream| {
      let sender = sender.clone();
      async move {
        login(&mut stream).await?;
        let message = stream.next().await.unwrap()?;
        let _ = sender.send(message.into_text()?);
        idle(stream).await
      }
    })
    .await;

    let session = session(addr)
      .ping_interval(Duration::from_millis(50))
      .build(StaticToken::new(TOKEN));
    let handle = run(&session);

    assert_eq!(next_text(&mut receiver).await, r#"{"trnm":"PING"}"#);

    session.disconnect().await;
    let () = within(handle).await.unwrap().unwrap();
  }

  /// Check that a zero keepalive interval disables our keepalive
  /// messages.
  #[test(tokio::test)]
  async fn ping_sender_disabled() {
    let (sender, mut receiver) = unbounded_channel();
    let addr = mock_server(move |_, mut stream| {
      let sender = sender.clone();
      async move {
        login(&mut stream).await?;
        while let Some(message) = stream.next().await {
          if let Message::Text(text) = message? {
            let _ = sender.send(text);
          }
        }
        Ok(())
      }
    })
    .await;

    let session = session(addr)
      .ping_interval(Duration::ZERO)
      .build(StaticToken::new(TOKEN));
    let handle = run(&session);
    wait_for_state(&session, State::Ready).await;

    sleep(Duration::from_millis(100)).await;
    let () = session
      .register(["005930"], ["0B"], "1", true)
      .await
      .unwrap();
    // Nothing was sent before the registration.
    assert_eq!(next_text(&mut receiver).await, REG_0B);

    session.disconnect().await;
    let () = within(handle).await.unwrap().unwrap();
    assert!(receiver.try_recv().is_err());
  }

  /// Check that disconnecting is not held up by a write to a peer
  /// that stopped reading.
  #[test(tokio::test)]
  async fn disconnect_stalled_write() {
    let addr = mock_server(|_, mut stream| async move {
      login(&mut stream).await?;
      // Keep the connection open without ever reading from it again.
      let () = pending().await;
      drop(stream);
      Ok(())
    })
    .await;

    let session = session(addr).build(StaticToken::new(TOKEN));
    let handle = run(&session);
    wait_for_state(&session, State::Ready).await;

    let writer = session.clone();
    let flood = spawn(async move {
      let payload = "x".repeat(1024 * 1024);
      loop {
        let message = json!({"trnm": "NOOP", "data": &payload});
        if let Err(err) = writer.send(&message).await {
          break err
        }
      }
    });

    // Give the writes time to fill up the socket buffers.
    sleep(Duration::from_millis(500)).await;

    within(session.disconnect()).await;
    assert_eq!(session.state(), State::Disconnected);

    let err = within(flood).await.unwrap();
    assert!(matches!(err, Error::NotConnected), "{err:?}");
    let () = within(handle).await.unwrap().unwrap();
  }

  /// Check that registrations are sent directly once logged in and
  /// that unregistering sends a removal.
  #[test(tokio::test)]
  async fn register_and_unregister() {
    let (sender, mut receiver) = unbounded_channel();
    let addr = mock_server(move |_, mut stream| {
      let sender = sender.clone();
      async move {
        login(&mut stream).await?;
        while let Some(message) = stream.next().await {
          if let Message::Text(text) = message? {
            let _ = sender.send(text);
          }
        }
        Ok(())
      }
    })
    .await;

    let session = session(addr).build(StaticToken::new(TOKEN));
    let handle = run(&session);
    wait_for_state(&session, State::Ready).await;

    let () = session
      .register(vec!["005930".to_string()], ["0B"], "1", true)
      .await
      .unwrap();
    assert_eq!(next_text(&mut receiver).await, REG_0B);

    let () = session
      .register(["000660"], ["0B"], "1", false)
      .await
      .unwrap();
    assert_eq!(
      next_text(&mut receiver).await,
      r#"{"trnm":"REG","grp_no":"1","refresh":"0","data":[{"item":["000660"],"type":["0B"]}]}"#
    );

    let () = session.unregister(["005930"], ["0B"], "1").await.unwrap();
    assert_eq!(
      next_text(&mut receiver).await,
      r#"{"trnm":"REMOVE","grp_no":"1","data":[{"item":["005930"],"type":["0B"]}]}"#
    );

    session.disconnect().await;
    let () = within(handle).await.unwrap().unwrap();
  }

  /// Check that a session can be run only once at a time.
  #[test(tokio::test)]
  async fn run_twice() {
    let addr = mock_server(|_, mut stream| async move {
      login(&mut stream).await?;
      idle(stream).await
    })
    .await;

    let session = session(addr).build(StaticToken::new(TOKEN));
    let handle = run(&session);
    wait_for_state(&session, State::Ready).await;

    let err = session.run().await.unwrap_err();
    assert!(matches!(err, Error::Str(..)), "{err:?}");

    session.disconnect().await;
    let () = within(handle).await.unwrap().unwrap();

    // A disconnected session does not process anything anymore.
    let () = within(session.run()).await.unwrap();
  }
}
