//! Backoff connector shared by every socket channel
//!
//! A [`Connector`] owns at most one TCP stream to a controller port. Every
//! operation that touches the stream runs under a single async mutex, so two
//! callers can never hold or replace the socket at the same time. Any I/O
//! failure drops the stream and triggers an immediate reconnect before the
//! failing call returns.

use crate::backoff::{Clock, RetryPolicy, TokioClock};
use crate::{Result, URError};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Default timeout for a single TCP connect
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

#[derive(Debug)]
struct LinkStatus {
    state: ConnectionState,
    retries: u32,
    last_delay: Option<Duration>,
}

/// Single-socket connection with capped exponential backoff
pub struct Connector {
    name: String,
    addr: String,
    policy: RetryPolicy,
    connect_timeout: Duration,
    clock: Arc<dyn Clock>,
    stream: tokio::sync::Mutex<Option<TcpStream>>,
    status: Mutex<LinkStatus>,
    generation: AtomicU64,
}

impl Connector {
    /// Create a connector for `host:port`. Nothing is connected until first use.
    pub fn new(name: &str, host: &str, port: u16, policy: RetryPolicy) -> Self {
        Self {
            name: name.to_string(),
            addr: format!("{}:{}", host, port),
            policy,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            clock: Arc::new(TokioClock),
            stream: tokio::sync::Mutex::new(None),
            status: Mutex::new(LinkStatus {
                state: ConnectionState::Disconnected,
                retries: 0,
                last_delay: None,
            }),
            generation: AtomicU64::new(0),
        }
    }

    /// Replace the clock used for backoff sleeps
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    pub fn state(&self) -> ConnectionState {
        self.status.lock().map(|s| s.state).unwrap_or(ConnectionState::Error)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Failed attempts since the last successful connect
    pub fn retry_count(&self) -> u32 {
        self.status.lock().map(|s| s.retries).unwrap_or(0)
    }

    /// Most recent backoff delay slept by the reconnect loop
    pub fn last_backoff(&self) -> Option<Duration> {
        self.status.lock().ok().and_then(|s| s.last_delay)
    }

    /// Number of successful connects so far. Changes every time a new socket replaces the old one.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn set_state(&self, state: ConnectionState) {
        if let Ok(mut status) = self.status.lock() {
            status.state = state;
        }
    }

    /// Connect with backoff. Returns immediately if a live socket already exists.
    pub async fn connect(&self) -> Result<()> {
        let mut stream = self.stream.lock().await;
        if stream.is_some() && self.is_connected() {
            return Ok(());
        }
        self.connect_locked(&mut stream).await
    }

    async fn connect_locked(&self, stream: &mut Option<TcpStream>) -> Result<()> {
        // Never keep a stale socket around while dialing a new one
        if let Some(mut old) = stream.take() {
            let _ = old.shutdown().await;
        }

        let mut last_error = String::new();
        for attempt in 0..self.policy.max_attempts {
            self.set_state(ConnectionState::Connecting);
            debug!(channel = %self.name, addr = %self.addr, attempt, "Connecting");

            match tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.addr)).await {
                Ok(Ok(socket)) => {
                    if let Err(e) = socket.set_nodelay(true) {
                        warn!(channel = %self.name, "Failed to set TCP_NODELAY: {}", e);
                    }
                    *stream = Some(socket);
                    if let Ok(mut status) = self.status.lock() {
                        status.state = ConnectionState::Connected;
                        status.retries = 0;
                    }
                    self.generation.fetch_add(1, Ordering::AcqRel);
                    info!(channel = %self.name, addr = %self.addr, "Connected");
                    return Ok(());
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = format!("connect timed out after {:?}", self.connect_timeout),
            }

            if let Ok(mut status) = self.status.lock() {
                status.state = ConnectionState::Error;
                status.retries += 1;
            }
            warn!(
                channel = %self.name,
                addr = %self.addr,
                attempt = attempt + 1,
                max_attempts = self.policy.max_attempts,
                "Connection attempt failed: {}", last_error
            );

            if attempt + 1 < self.policy.max_attempts {
                let delay = self.policy.delay_for(attempt);
                if let Ok(mut status) = self.status.lock() {
                    status.last_delay = Some(delay);
                }
                info!(channel = %self.name, delay_secs = delay.as_secs_f64(), "Retrying connection");
                self.clock.sleep(delay).await;
            }
        }

        Err(URError::TransientIo(format!(
            "Failed to connect to {} ({}) after {} attempts: {}",
            self.addr, self.name, self.policy.max_attempts, last_error
        )))
    }

    /// Close the socket. Safe to call any number of times.
    pub async fn disconnect(&self) {
        let mut stream = self.stream.lock().await;
        if let Some(mut socket) = stream.take() {
            let _ = socket.shutdown().await;
            info!(channel = %self.name, addr = %self.addr, "Disconnected");
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Record a failed operation, drop the socket and try to get a fresh one
    async fn recover_locked(&self, stream: &mut Option<TcpStream>, op: &str, error: &io::Error) -> URError {
        warn!(channel = %self.name, addr = %self.addr, "{} failed: {}", op, error);
        self.set_state(ConnectionState::Error);
        stream.take();

        if let Err(e) = self.connect_locked(stream).await {
            warn!(channel = %self.name, "Reconnect after failed {} did not succeed: {}", op, e);
        }
        URError::TransientIo(format!("{} on {} failed: {}", op, self.name, error))
    }

    /// Write the whole buffer, failing after `limit`
    pub async fn write_all(&self, bytes: &[u8], limit: Duration) -> Result<()> {
        let mut stream = self.stream.lock().await;
        let outcome = match stream.as_mut() {
            Some(socket) => with_limit(limit, socket.write_all(bytes)).await,
            None => Err(not_connected()),
        };
        match outcome {
            Ok(()) => Ok(()),
            Err(e) => Err(self.recover_locked(&mut stream, "write", &e).await),
        }
    }

    /// Fill `buf` completely, failing after `limit`
    pub async fn read_exact(&self, buf: &mut [u8], limit: Duration) -> Result<()> {
        let mut stream = self.stream.lock().await;
        let outcome = match stream.as_mut() {
            Some(socket) => with_limit(limit, async { socket.read_exact(buf).await.map(|_| ()) }).await,
            None => Err(not_connected()),
        };
        match outcome {
            Ok(()) => Ok(()),
            Err(e) => Err(self.recover_locked(&mut stream, "read", &e).await),
        }
    }

    /// Read bytes up to (not including) the next newline
    pub async fn read_line(&self, limit: Duration) -> Result<String> {
        let mut stream = self.stream.lock().await;
        let outcome = match stream.as_mut() {
            Some(socket) => with_limit(limit, read_line_from(socket)).await,
            None => Err(not_connected()),
        };
        match outcome {
            Ok(line) => Ok(line),
            Err(e) => Err(self.recover_locked(&mut stream, "read", &e).await),
        }
    }

    /// Send one line and read the single-line reply while holding the socket
    pub async fn request_line(&self, line: &str, limit: Duration) -> Result<String> {
        let mut stream = self.stream.lock().await;
        let outcome = match stream.as_mut() {
            Some(socket) => {
                with_limit(limit, async {
                    let mut framed = line.trim_end_matches('\n').to_string();
                    framed.push('\n');
                    socket.write_all(framed.as_bytes()).await?;
                    read_line_from(socket).await
                })
                .await
            }
            None => Err(not_connected()),
        };
        match outcome {
            Ok(reply) => Ok(reply),
            Err(e) => Err(self.recover_locked(&mut stream, "request", &e).await),
        }
    }
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "socket not connected")
}

async fn with_limit<T, F>(limit: Duration, fut: F) -> io::Result<T>
where
    F: std::future::Future<Output = io::Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, format!("no progress within {:?}", limit))),
    }
}

async fn read_line_from(socket: &mut TcpStream) -> io::Result<String> {
    let mut collected = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        socket.read_exact(&mut byte).await?;
        if byte[0] == b'\n' {
            break;
        }
        collected.push(byte[0]);
    }
    String::from_utf8(collected)
        .map(|s| s.trim_end_matches('\r').to_string())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
