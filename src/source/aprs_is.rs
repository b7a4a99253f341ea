//! APRS-IS client
//!
//! Logs in receive-only (passcode `-1`) with a server side filter for our
//! destination. The server sends a `#` comment line at least every 20 seconds,
//! so if we don't hear anything for [`WATCHDOG_TIMEOUT`], the connection is
//! considered dead and we reconnect.
//!
//! The connection handling is split into a [`FeedStateMachine`], which only
//! deals with timestamps and lines, and [`run`], which does the IO.
//!
//! - [APRS-IS][1]
//!
//! [1]: https://www.aprs-is.net/Connecting.aspx

use std::time::Duration;

use futures_util::{
    StreamExt,
    pin_mut,
};
use tokio::{
    io::{
        AsyncRead,
        AsyncWrite,
        AsyncWriteExt,
    },
    net::TcpStream,
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use crate::source::{
    Error,
    lines::LineReader,
};

pub const DEFAULT_ADDRESS: &str = "rotate.aprs2.net:14580";
pub const DEFAULT_FILTER: &str = "u/APECAN";

pub const WATCHDOG_TIMEOUT: Duration = Duration::from_secs(30);
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
pub const RETRY_DELAY: Duration = Duration::from_millis(100);

const SOFTWARE: &str = "pecan-ingest 0.1";

pub fn login_line(call: &str, filter: &str) -> String {
    format!("user {call} pass -1 vers {SOFTWARE} filter {filter}\r\n")
}

#[derive(Clone, Copy, Debug)]
pub struct Watchdog {
    timeout: Duration,
    deadline: Option<Instant>,
}

impl Watchdog {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            deadline: None,
        }
    }

    pub fn refresh(&mut self, now: Instant) {
        self.deadline = Some(now + self.timeout);
    }

    pub fn disarm(&mut self) {
        self.deadline = None;
    }

    pub fn expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeedState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LineAction {
    /// Server comment, nothing to decode.
    KeepAlive,
    /// A frame to pass on.
    Frame,
}

/// Returned by [`FeedStateMachine::poll`] when the connection went silent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Reconnect;

#[derive(Debug)]
pub struct FeedStateMachine {
    state: FeedState,
    watchdog: Watchdog,
}

impl FeedStateMachine {
    pub fn new(watchdog_timeout: Duration) -> Self {
        Self {
            state: FeedState::Disconnected,
            watchdog: Watchdog::new(watchdog_timeout),
        }
    }

    pub fn state(&self) -> FeedState {
        self.state
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.watchdog.deadline()
    }

    pub fn start_connecting(&mut self) {
        self.state = FeedState::Connecting;
        self.watchdog.disarm();
    }

    pub fn connected(&mut self, now: Instant) {
        self.state = FeedState::Connected;
        self.watchdog.refresh(now);
    }

    /// Any line proves the connection is alive.
    pub fn handle_line(&mut self, line: &str, now: Instant) -> LineAction {
        self.watchdog.refresh(now);

        if line.starts_with('#') {
            LineAction::KeepAlive
        }
        else {
            LineAction::Frame
        }
    }

    pub fn poll(&mut self, now: Instant) -> Option<Reconnect> {
        if self.state == FeedState::Connected && self.watchdog.expired(now) {
            self.disconnected();
            Some(Reconnect)
        }
        else {
            None
        }
    }

    pub fn disconnected(&mut self) {
        self.state = FeedState::Disconnected;
        self.watchdog.disarm();
    }
}

/// Opens connections to the server.
pub trait Connect {
    type Stream: AsyncRead + AsyncWrite + Unpin;

    fn connect(&self) -> impl Future<Output = Result<Self::Stream, std::io::Error>>;
}

#[derive(Clone, Debug)]
pub struct TcpConnector {
    address: String,
}

impl TcpConnector {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

impl Connect for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self) -> Result<TcpStream, std::io::Error> {
        TcpStream::connect(&self.address).await
    }
}

/// Stays connected until `shutdown` is cancelled, passing every frame line to
/// `handle_line`.
pub async fn run<C, P>(
    connector: &C,
    call: &str,
    filter: &str,
    shutdown: CancellationToken,
    mut handle_line: P,
) -> Result<(), Error>
where
    C: Connect,
    P: AsyncFnMut(String),
{
    let mut machine = FeedStateMachine::new(WATCHDOG_TIMEOUT);

    while !shutdown.is_cancelled() {
        machine.start_connecting();

        let connect = tokio::time::timeout(CONNECT_TIMEOUT, connector.connect());
        let result = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = connect => result,
        };

        match result {
            Ok(Ok(stream)) => {
                let (reader, mut writer) = tokio::io::split(stream);

                if let Err(error) = writer.write_all(login_line(call, filter).as_bytes()).await {
                    tracing::warn!(?error, "aprs-is login failed");
                    machine.disconnected();
                }
                else {
                    tracing::info!("connected to aprs-is");
                    machine.connected(Instant::now());

                    let lines = LineReader::new(reader);
                    pin_mut!(lines);

                    while machine.state() == FeedState::Connected {
                        let deadline = machine
                            .deadline()
                            .unwrap_or_else(|| Instant::now() + WATCHDOG_TIMEOUT);

                        tokio::select! {
                            _ = shutdown.cancelled() => return Ok(()),
                            _ = tokio::time::sleep_until(deadline) => {
                                if machine.poll(Instant::now()).is_some() {
                                    tracing::warn!("aprs-is connection went silent");
                                }
                            }
                            line = lines.next() => {
                                match line {
                                    None => {
                                        tracing::info!("aprs-is closed the connection");
                                        machine.disconnected();
                                    }
                                    Some(Err(error)) if error.is_fatal() => {
                                        tracing::warn!(?error, "aprs-is read failed");
                                        machine.disconnected();
                                    }
                                    Some(Err(error)) => {
                                        tracing::debug!(?error, "skipping line");
                                    }
                                    Some(Ok(line)) => {
                                        match machine.handle_line(&line, Instant::now()) {
                                            LineAction::KeepAlive => {
                                                tracing::trace!(%line, "aprs-is keep-alive");
                                            }
                                            LineAction::Frame => handle_line(line).await,
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            }
            Ok(Err(error)) => {
                tracing::warn!(?error, "aprs-is connection failed");
                machine.disconnected();
            }
            Err(_) => {
                tracing::warn!("aprs-is connection timed out");
                machine.disconnected();
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(RETRY_DELAY) => {}
        }
    }

    Ok(())
}
