//! Telnet client for a remote skimmer/cluster spot server.
//!
//! A supervisor task keeps one worker alive at a time. Each worker owns a
//! single TCP connection: it dials, performs the banner/callsign/welcome
//! login, then reads spot lines until the connection dies or goes idle.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::dispatch::SpotDispatcher;
use crate::parser::{ParseError, looks_like_spot, parse_spot};
use crate::spot::SpotKind;
use crate::stats::PipelineStats;

/// Default skimmer telnet server.
pub const SKIMMER_HOST: &str = "telnet.reversebeacon.net";

/// Default port for CW/RTTY spots.
pub const SKIMMER_PORT: u16 = 7000;

/// Longest line kept in the buffer before it is discarded.
const MAX_LINE_BYTES: usize = 16 * 1024;

/// Configuration for the skimmer client.
#[derive(Debug, Clone)]
pub struct SkimmerClientConfig {
    /// Hostname of the skimmer server.
    pub host: String,

    /// Port number.
    pub port: u16,

    /// Callsign to use for login.
    pub callsign: String,

    /// Dial timeout.
    pub connect_timeout: Duration,

    /// Deadline for each of the banner and welcome reads.
    pub banner_timeout: Duration,

    /// Deadline for the whole login handshake.
    pub login_timeout: Duration,

    /// Disconnect when nothing arrives for this long.
    pub idle_timeout: Duration,

    /// Delay before redialing after a failed connect.
    pub reconnect_delay: Duration,

    /// Event type the spots are published as.
    pub publish_as: SpotKind,
}

impl Default for SkimmerClientConfig {
    fn default() -> Self {
        Self {
            host: SKIMMER_HOST.to_string(),
            port: SKIMMER_PORT,
            callsign: "N0CALL".to_string(),
            connect_timeout: Duration::from_secs(10),
            banner_timeout: Duration::from_secs(10),
            login_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(15 * 60),
            reconnect_delay: Duration::from_secs(5),
            publish_as: SpotKind::CwSpot,
        }
    }
}

impl SkimmerClientConfig {
    /// Create a new configuration with the given callsign.
    pub fn with_callsign(callsign: impl Into<String>) -> Self {
        Self {
            callsign: callsign.into(),
            ..Default::default()
        }
    }

    /// Set the host and port.
    pub fn with_server(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }
}

/// Reasons a worker ends.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Login timed out waiting for {0}")]
    LoginTimeout(&'static str),

    #[error("No data for {0:?}")]
    IdleTimeout(Duration),

    #[error("Connection closed by peer")]
    PeerClosed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ClientError {
    /// Whether the worker never got a socket.
    pub fn is_connect(&self) -> bool {
        matches!(self, ClientError::Connect { .. })
    }
}

/// Lifecycle of one skimmer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    LoggingIn = 2,
    Active = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::LoggingIn,
            3 => ConnectionState::Active,
            _ => ConnectionState::Disconnected,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::LoggingIn => "logging_in",
            ConnectionState::Active => "active",
        }
    }
}

/// Lock-free view of the client's connection, for status reporting.
#[derive(Debug, Clone)]
pub struct SkimmerStatus {
    connected: Arc<AtomicBool>,
    state: Arc<AtomicU8>,
}

impl Default for SkimmerStatus {
    fn default() -> Self {
        Self {
            connected: Arc::new(AtomicBool::new(false)),
            state: Arc::new(AtomicU8::new(ConnectionState::Disconnected as u8)),
        }
    }
}

impl SkimmerStatus {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
        self.connected
            .store(state == ConnectionState::Active, Ordering::Release);
    }
}

/// Auto-reconnecting skimmer client.
pub struct SkimmerClient {
    config: SkimmerClientConfig,
    dispatcher: SpotDispatcher,
    stats: Arc<PipelineStats>,
    status: SkimmerStatus,
}

impl SkimmerClient {
    /// Create a client that hands its spots to `dispatcher`.
    pub fn new(config: SkimmerClientConfig, dispatcher: SpotDispatcher) -> Self {
        let stats = Arc::clone(dispatcher.stats());
        Self {
            config,
            dispatcher,
            stats,
            status: SkimmerStatus::default(),
        }
    }

    /// Status handle shared with the running client.
    pub fn status(&self) -> SkimmerStatus {
        self.status.clone()
    }

    /// Start the supervisor. It stops when `shutdown` flips to true.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.supervise(shutdown).await;
        })
    }

    async fn supervise(self, mut shutdown: watch::Receiver<bool>) {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        loop {
            if *shutdown.borrow() {
                break;
            }

            let result = tokio::select! {
                result = self.run_worker() => result,
                _ = shutdown.changed() => break,
            };
            self.status.set(ConnectionState::Disconnected);

            match result {
                Ok(()) => info!("Skimmer connection to {} ended", addr),
                Err(e) if e.is_connect() => {
                    warn!(
                        "{}; retrying in {} seconds",
                        e,
                        self.config.reconnect_delay.as_secs()
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.reconnect_delay) => {}
                        _ = shutdown.changed() => break,
                    }
                }
                Err(e) => warn!("Skimmer connection to {} lost: {}", addr, e),
            }
        }
        self.status.set(ConnectionState::Disconnected);
        info!("Skimmer client stopped");
    }

    /// One connection, end to end.
    async fn run_worker(&self) -> Result<(), ClientError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        self.status.set(ConnectionState::Connecting);
        info!("Connecting to {}...", addr);

        let mut stream = match timeout(self.config.connect_timeout, TcpStream::connect(&addr)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(ClientError::Connect { addr, source }),
            Err(_) => {
                return Err(ClientError::Connect {
                    addr,
                    source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
                });
            }
        };

        self.status.set(ConnectionState::LoggingIn);
        let pending = timeout(self.config.login_timeout, self.login(&mut stream))
            .await
            .map_err(|_| ClientError::LoginTimeout("login to complete"))??;

        self.status.set(ConnectionState::Active);
        PipelineStats::incr(&self.stats.skimmer_connects);
        info!("Logged in to {} as {}", addr, self.config.callsign);

        self.read_loop(stream, pending).await
    }

    /// Banner, callsign, welcome. Returns whatever arrived with the welcome.
    async fn login(&self, stream: &mut TcpStream) -> Result<Vec<u8>, ClientError> {
        let mut buf = vec![0u8; 4096];

        let n = timeout(self.config.banner_timeout, stream.read(&mut buf))
            .await
            .map_err(|_| ClientError::LoginTimeout("banner"))??;
        if n == 0 {
            return Err(ClientError::PeerClosed);
        }
        debug!("Banner: {}", String::from_utf8_lossy(&buf[..n]).trim());

        stream
            .write_all(format!("{}\r\n", self.config.callsign).as_bytes())
            .await?;
        stream.flush().await?;

        let n = timeout(self.config.banner_timeout, stream.read(&mut buf))
            .await
            .map_err(|_| ClientError::LoginTimeout("welcome"))??;
        if n == 0 {
            return Err(ClientError::PeerClosed);
        }
        Ok(buf[..n].to_vec())
    }

    async fn read_loop(
        &self,
        mut stream: TcpStream,
        mut pending: Vec<u8>,
    ) -> Result<(), ClientError> {
        let mut chunk = vec![0u8; 8192];
        self.drain_lines(&mut pending);

        loop {
            let n = timeout(self.config.idle_timeout, stream.read(&mut chunk))
                .await
                .map_err(|_| ClientError::IdleTimeout(self.config.idle_timeout))??;
            if n == 0 {
                return Err(ClientError::PeerClosed);
            }
            self.stats
                .skimmer_bytes
                .fetch_add(n as u64, Ordering::Relaxed);
            pending.extend_from_slice(&chunk[..n]);
            self.drain_lines(&mut pending);
        }
    }

    fn drain_lines(&self, pending: &mut Vec<u8>) {
        while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            self.handle_line(line.trim_end_matches(['\r', '\n']));
        }
        if pending.len() > MAX_LINE_BYTES {
            warn!("Discarding {} bytes without a line break", pending.len());
            pending.clear();
        }
    }

    fn handle_line(&self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }

        if !looks_like_spot(line) {
            PipelineStats::incr(&self.stats.skimmer_info_lines);
            debug!("Skimmer: {}", line);
            return;
        }

        match parse_spot(line) {
            Ok(spot) => {
                PipelineStats::incr(&self.stats.skimmer_spots);
                self.dispatcher.dispatch(self.config.publish_as, spot);
            }
            Err(ParseError::OutOfRange(hz)) => {
                PipelineStats::incr(&self.stats.skimmer_out_of_range);
                debug!("Discarding out-of-range spot at {} Hz", hz);
            }
            Err(e) => {
                PipelineStats::incr(&self.stats.skimmer_parse_failures);
                debug!("Failed to parse: {} - {}", e, line);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::{Enricher, PrefixTable};
    use crate::spot::Spot;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::AsyncBufReadExt;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    const SPOT_LINE: &str =
        "DX de W1AW-#:   14025.0  K2ABC          15 dB  25 WPM  CQ            1234Z";

    fn dispatcher() -> SpotDispatcher {
        SpotDispatcher::new(
            Enricher::new(Arc::new(PrefixTable::new()), None),
            None,
            Vec::new(),
            Arc::new(PipelineStats::new()),
        )
    }

    fn test_config(port: u16) -> SkimmerClientConfig {
        let mut config = SkimmerClientConfig::with_callsign("W1TEST").with_server("127.0.0.1", port);
        config.connect_timeout = Duration::from_millis(500);
        config.banner_timeout = Duration::from_millis(500);
        config.login_timeout = Duration::from_secs(1);
        config.reconnect_delay = Duration::from_millis(50);
        config
    }

    /// Banner, read the callsign line, then send `welcome`.
    async fn serve_login(stream: &mut TcpStream, welcome: &str) -> String {
        stream.write_all(b"Please enter your call: ").await.unwrap();
        let mut reader = tokio::io::BufReader::new(&mut *stream);
        let mut login = String::new();
        reader.read_line(&mut login).await.unwrap();
        stream.write_all(welcome.as_bytes()).await.unwrap();
        login
    }

    #[test]
    fn test_default_config() {
        let config = SkimmerClientConfig::default();
        assert_eq!(config.host, SKIMMER_HOST);
        assert_eq!(config.port, SKIMMER_PORT);
        assert_eq!(config.idle_timeout, Duration::from_secs(900));
        assert_eq!(config.publish_as, SpotKind::CwSpot);
    }

    #[test]
    fn test_config_builder() {
        let config =
            SkimmerClientConfig::with_callsign("W6JSV").with_server("test.example.com", 1234);

        assert_eq!(config.callsign, "W6JSV");
        assert_eq!(config.host, "test.example.com");
        assert_eq!(config.port, 1234);
    }

    #[test]
    fn test_status_flag_tracks_state() {
        let status = SkimmerStatus::default();
        assert_eq!(status.state(), ConnectionState::Disconnected);
        status.set(ConnectionState::LoggingIn);
        assert!(!status.is_connected());
        status.set(ConnectionState::Active);
        assert!(status.is_connected());
        assert_eq!(status.state().as_str(), "active");
        status.set(ConnectionState::Disconnected);
        assert!(!status.is_connected());
    }

    #[tokio::test]
    async fn test_login_then_spot_is_dispatched() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (login_tx, mut login_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let welcome = format!("Hello W1TEST, welcome\r\n{}\r\n", SPOT_LINE);
            let login = serve_login(&mut stream, &welcome).await;
            let _ = login_tx.send(login);
            stream
                .write_all(b"local users = 12\r\nDX de KM3T-2-#:  7018.3  RW1M  CW  19 dB  18 WPM  CQ  2259Z\r\n")
                .await
                .unwrap();
            let mut sink = [0u8; 64];
            let _ = stream.read(&mut sink).await;
        });

        let dispatcher = dispatcher();
        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatcher.listeners().register(move |kind, spot: Arc<Spot>| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((kind, spot));
            }
        });
        let stats = Arc::clone(dispatcher.stats());

        let client = SkimmerClient::new(test_config(port), dispatcher);
        let status = client.status();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = client.spawn(shutdown_rx);

        assert_eq!(login_rx.recv().await.unwrap(), "W1TEST\r\n");

        let mut calls = Vec::new();
        for _ in 0..2 {
            let (kind, spot) = timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(kind, SpotKind::CwSpot);
            calls.push(spot.callsign.clone());
        }
        calls.sort();
        assert_eq!(calls, vec!["K2ABC".to_string(), "RW1M".to_string()]);
        assert_eq!(status.state(), ConnectionState::Active);
        assert!(status.is_connected());
        assert_eq!(stats.skimmer_info_lines.load(Ordering::Relaxed), 2);

        shutdown_tx.send(true).unwrap();
        timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        assert!(!status.is_connected());
    }

    #[tokio::test]
    async fn test_idle_timeouts_each_trigger_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepts);

        tokio::spawn(async move {
            loop {
                let (mut stream, _) = listener.accept().await.unwrap();
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    serve_login(&mut stream, "Welcome\r\n").await;
                    // Go silent until the client hangs up.
                    let mut sink = [0u8; 64];
                    while let Ok(n) = stream.read(&mut sink).await {
                        if n == 0 {
                            break;
                        }
                    }
                });
            }
        });

        let mut config = test_config(port);
        config.idle_timeout = Duration::from_millis(100);
        let client = SkimmerClient::new(config, dispatcher());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = client.spawn(shutdown_rx);

        timeout(Duration::from_secs(3), async {
            while accepts.load(Ordering::SeqCst) < 4 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("three idle timeouts should cause three reconnects");

        shutdown_tx.send(true).unwrap();
        timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_silent_banner_fails_login() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let mut config = test_config(port);
        config.banner_timeout = Duration::from_millis(50);
        let client = SkimmerClient::new(config, dispatcher());
        let result = client.run_worker().await;
        assert!(matches!(result, Err(ClientError::LoginTimeout("banner"))));
    }

    #[tokio::test]
    async fn test_refused_dial_is_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = SkimmerClient::new(test_config(port), dispatcher());
        let err = client.run_worker().await.unwrap_err();
        assert!(err.is_connect());
        assert_eq!(client.status().state(), ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn test_line_classification_counters() {
        let dispatcher = dispatcher();
        let stats = Arc::clone(dispatcher.stats());
        let client = SkimmerClient::new(SkimmerClientConfig::default(), dispatcher);

        let mut pending = Vec::new();
        pending.extend_from_slice(b"Welcome to the node\r\n");
        pending.extend_from_slice(b"DX de W1AW-#:  50090.0  K2ABC  15 dB  25 WPM  CQ  1234Z\r\n");
        pending.extend_from_slice(b"DX de garbage\r\n");
        pending.extend_from_slice(b"partial DX de");
        client.drain_lines(&mut pending);

        assert_eq!(stats.skimmer_info_lines.load(Ordering::Relaxed), 1);
        assert_eq!(stats.skimmer_out_of_range.load(Ordering::Relaxed), 1);
        assert_eq!(stats.skimmer_parse_failures.load(Ordering::Relaxed), 1);
        assert_eq!(pending, b"partial DX de".to_vec());
    }
}
