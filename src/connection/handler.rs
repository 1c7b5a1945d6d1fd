//! Connection Handler
//!
//! One task per client. The task reads into a `BytesMut` buffer, splits off
//! every complete request, executes it and appends the reply to an output
//! buffer that is flushed once the pipeline is drained.
//!
//! ```text
//! read ──> parse* ──> execute* ──> write + flush ──> read ...
//!            │                        ▲
//!            └─ protocol error ───────┘ (reply, then close)
//! ```

use crate::commands::CommandHandler;
use crate::protocol::parser::MAX_BULK_SIZE;
use crate::protocol::{ParseError, RequestParser};
use bytes::BytesMut;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, trace, warn};

/// Unparsed input a client may accumulate: one maximal bulk argument plus
/// room for the request framing around it.
const MAX_PENDING_INPUT: usize = MAX_BULK_SIZE + 64 * 1024;

const READ_CHUNK: usize = 16 * 1024;

/// Server-wide counters shared by every connection task.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    accepted: AtomicU64,
    active: AtomicU64,
    commands: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

/// A point-in-time copy of [`ConnectionStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub active: u64,
    pub commands: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn opened(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    fn closed(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }

    fn record(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            commands: self.commands.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
        }
    }
}

/// One client connection: its socket, pending input and queued replies.
pub struct ConnectionHandler {
    socket: TcpStream,
    peer: SocketAddr,
    input: BytesMut,
    pending: BytesMut,
    parser: RequestParser,
    commands: CommandHandler,
    stats: Arc<ConnectionStats>,
}

/// What draining the input buffer left us with.
enum Drained {
    NeedInput,
    Quit,
}

impl ConnectionHandler {
    pub fn new(
        socket: TcpStream,
        peer: SocketAddr,
        commands: CommandHandler,
        stats: Arc<ConnectionStats>,
    ) -> Self {
        stats.opened();
        Self {
            socket,
            peer,
            input: BytesMut::with_capacity(READ_CHUNK),
            pending: BytesMut::new(),
            parser: RequestParser::new(),
            commands,
            stats,
        }
    }

    /// Serves the client until it disconnects, sends QUIT or breaks the
    /// protocol.
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        debug!(client = %self.peer, "Client connected");
        let result = self.serve().await;
        match &result {
            Ok(()) => debug!(client = %self.peer, "Client sent QUIT"),
            Err(e) if e.is_hangup() => debug!(client = %self.peer, "Client went away"),
            Err(e) => warn!(client = %self.peer, error = %e, "Connection error"),
        }
        self.stats.closed();
        result
    }

    async fn serve(&mut self) -> Result<(), ConnectionError> {
        loop {
            // Replies queued before a protocol error still go out.
            let drained = self.drain_input();
            self.send_pending().await?;
            if let Drained::Quit = drained? {
                return Ok(());
            }
            self.fill_input().await?;
        }
    }

    /// Runs every complete request currently buffered.
    fn drain_input(&mut self) -> Result<Drained, ConnectionError> {
        while let Some(argv) = self.parser.parse(&mut self.input).map_err(|e| {
            self.pending
                .extend_from_slice(format!("-ERR Protocol error: {}\r\n", e).as_bytes());
            ConnectionError::Protocol(e)
        })? {
            if argv.is_empty() {
                continue;
            }
            trace!(client = %self.peer, argc = argv.len(), "Executing request");

            let outcome = self.commands.execute(&argv);
            ConnectionStats::record(&self.stats.commands, 1);
            outcome.reply.serialize_into(&mut self.pending);
            if outcome.quit {
                return Ok(Drained::Quit);
            }
        }
        Ok(Drained::NeedInput)
    }

    async fn fill_input(&mut self) -> Result<(), ConnectionError> {
        if self.input.len() >= MAX_PENDING_INPUT {
            return Err(ConnectionError::Overflow(self.input.len()));
        }
        self.input.reserve(READ_CHUNK);

        match self.socket.read_buf(&mut self.input).await? {
            0 if self.input.is_empty() => Err(ConnectionError::Closed),
            0 => Err(ConnectionError::Truncated(self.input.len())),
            n => {
                ConnectionStats::record(&self.stats.bytes_in, n);
                Ok(())
            }
        }
    }

    async fn send_pending(&mut self) -> Result<(), ConnectionError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let out = self.pending.split();
        self.socket.write_all(&out).await?;
        ConnectionStats::record(&self.stats.bytes_out, out.len());
        trace!(client = %self.peer, bytes = out.len(), "Replies sent");
        Ok(())
    }
}

/// Why a connection ended abnormally.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ParseError),

    #[error("client closed the connection")]
    Closed,

    #[error("client closed the connection with {0} bytes of an unfinished request")]
    Truncated(usize),

    #[error("pending input of {0} bytes exceeds the limit")]
    Overflow(usize),
}

impl ConnectionError {
    /// The peer hung up; nothing worth reporting.
    pub fn is_hangup(&self) -> bool {
        match self {
            ConnectionError::Closed => true,
            ConnectionError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

/// Runs a [`ConnectionHandler`] to completion.
pub async fn handle_connection(
    socket: TcpStream,
    peer: SocketAddr,
    commands: CommandHandler,
    stats: Arc<ConnectionStats>,
) {
    let conn = ConnectionHandler::new(socket, peer, commands, stats);
    if let Err(e) = conn.run().await {
        if !e.is_hangup() {
            info!(client = %peer, error = %e, "Connection ended with error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::handler::tests::create_state;
    use crate::server::{self, SharedState};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::time::{timeout, Duration};

    async fn create_test_server() -> (SocketAddr, SharedState, Arc<ConnectionStats>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = server::shared(create_state());
        let stats = Arc::clone(&server::lock(&state).stats);
        let handler = CommandHandler::new(Arc::clone(&state));

        let stats_clone = Arc::clone(&stats);
        tokio::spawn(async move {
            while let Ok((stream, client_addr)) = listener.accept().await {
                let stats = Arc::clone(&stats_clone);
                tokio::spawn(handle_connection(stream, client_addr, handler.clone(), stats));
            }
        });

        (addr, state, stats)
    }

    /// Reads until `expected` bytes arrived or two seconds passed.
    async fn read_exactly(client: &mut TcpStream, expected: usize) -> Vec<u8> {
        let mut buf = vec![0u8; expected];
        let mut total = 0;
        while total < expected {
            match timeout(Duration::from_secs(2), client.read(&mut buf[total..])).await {
                Ok(Ok(n)) if n > 0 => total += n,
                _ => break,
            }
        }
        buf.truncate(total);
        buf
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let (addr, _, _) = create_test_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client.write_all(b"*1\r\n$4\r\nPING\r\n").await.unwrap();
        assert_eq!(read_exactly(&mut client, 7).await, b"+PONG\r\n");
    }

    #[tokio::test]
    async fn test_mmset_mmget() {
        let (addr, _, _) = create_test_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client
            .write_all(b"*3\r\n$5\r\nMMSET\r\n$4\r\nname\r\n$4\r\nAriz\r\n")
            .await
            .unwrap();
        assert_eq!(read_exactly(&mut client, 5).await, b"+OK\r\n");

        client
            .write_all(b"*2\r\n$5\r\nMMGET\r\n$4\r\nname\r\n")
            .await
            .unwrap();
        assert_eq!(read_exactly(&mut client, 10).await, b"$4\r\nAriz\r\n");
    }

    #[tokio::test]
    async fn test_pipelined_and_inline_commands() {
        let (addr, _, _) = create_test_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client
            .write_all(b"*3\r\n$5\r\nMMSET\r\n$2\r\nk1\r\n$2\r\nv1\r\nMMSET k2 v2\r\n*2\r\n$5\r\nMMGET\r\n$2\r\nk1\r\nMMGET k2\r\n")
            .await
            .unwrap();

        let expected = b"+OK\r\n+OK\r\n$2\r\nv1\r\n$2\r\nv2\r\n";
        assert_eq!(read_exactly(&mut client, expected.len()).await, expected);
    }

    #[tokio::test]
    async fn test_quit_closes_connection() {
        let (addr, _, _) = create_test_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client.write_all(b"QUIT\r\nPING\r\n").await.unwrap();
        assert_eq!(read_exactly(&mut client, 5).await, b"+OK\r\n");

        let mut rest = [0u8; 16];
        match timeout(Duration::from_secs(2), client.read(&mut rest)).await {
            Ok(Ok(0)) | Ok(Err(_)) => {}
            other => panic!("connection still open: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_protocol_error_is_reported() {
        let (addr, _, _) = create_test_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client.write_all(b"*1\r\n:5\r\n").await.unwrap();
        let reply = read_exactly(&mut client, 64).await;
        assert!(reply.starts_with(b"-ERR Protocol error: expected '$', got ':'"));
    }

    #[tokio::test]
    async fn test_writes_reach_shared_state() {
        let (addr, state, _) = create_test_server().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client.write_all(b"MMSET k v\r\n").await.unwrap();
        assert_eq!(read_exactly(&mut client, 5).await, b"+OK\r\n");

        let state = server::lock(&state);
        assert_eq!(state.host.dirty(), 1);
        assert_eq!(state.host.backlog().len(), 1);
    }

    #[tokio::test]
    async fn test_connection_stats() {
        let (addr, _, stats) = create_test_server().await;

        assert_eq!(stats.snapshot(), StatsSnapshot::default());

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"*1\r\n$4\r\nPING\r\n").await.unwrap();
        read_exactly(&mut client, 7).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let snap = stats.snapshot();
        assert_eq!(snap.accepted, 1);
        assert_eq!(snap.active, 1);
        assert_eq!(snap.commands, 1);
        assert_eq!(snap.bytes_in, 14);
        assert_eq!(snap.bytes_out, 7);

        drop(client);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(stats.snapshot().active, 0);
    }
}
