//! Transport sessions.
//!
//! A [`Session`] is one live bidirectional byte stream to a peer. Writes are
//! serialized through an async mutex; reads are reserved for a single reader
//! task through an atomic claim flag.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use chatmesh_core::PeerAddress;

use crate::error::{NetError, Result};

type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Longest record a session will buffer, newline included. File payloads
/// travel inline, so this bounds the largest transferable file.
pub const MAX_LINE_BYTES: usize = 64 * 1024 * 1024;

/// Process-unique session handle.
pub type SessionId = u64;

/// A live connection owned by a connection pool.
pub struct Session {
    id: SessionId,
    /// Address of the socket's remote end.
    remote: PeerAddress,
    /// Listening address the remote announced, when it differs from `remote`.
    advertised: RwLock<Option<PeerAddress>>,
    reader: Mutex<BufReader<BoxedRead>>,
    writer: Mutex<BoxedWrite>,
    reader_claimed: AtomicBool,
    active: AtomicBool,
    max_line: usize,
}

impl Session {
    /// Wrap arbitrary stream halves.
    pub fn new<R, W>(remote: PeerAddress, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            remote,
            advertised: RwLock::new(None),
            reader: Mutex::new(BufReader::new(Box::new(reader))),
            writer: Mutex::new(Box::new(writer)),
            reader_claimed: AtomicBool::new(false),
            active: AtomicBool::new(true),
            max_line: MAX_LINE_BYTES,
        }
    }

    /// Override the record size limit.
    pub fn with_max_line(mut self, max_line: usize) -> Self {
        self.max_line = max_line;
        self
    }

    /// Wrap a TCP stream. `remote` is the address the session is known by;
    /// for outbound connections this is the dialed listening address.
    pub fn from_tcp(stream: TcpStream, remote: PeerAddress) -> Self {
        let _ = stream.set_nodelay(true);
        let (read, write) = stream.into_split();
        Self::new(remote, read, write)
    }

    /// Wrap an accepted TCP stream, keyed by its socket address.
    pub fn accepted(stream: TcpStream) -> Result<Self> {
        let remote = PeerAddress::from(stream.peer_addr()?);
        Ok(Self::from_tcp(stream, remote))
    }

    /// Two sessions joined by an in-memory pipe: the first is held by `a`
    /// and reaches `b`, the second the reverse.
    pub fn pair(a: PeerAddress, b: PeerAddress) -> (Session, Session) {
        let (left, right) = tokio::io::duplex(64 * 1024);
        let (lr, lw) = tokio::io::split(left);
        let (rr, rw) = tokio::io::split(right);
        (Session::new(b, lr, lw), Session::new(a, rr, rw))
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn remote(&self) -> &PeerAddress {
        &self.remote
    }

    /// The announced listening address if known, else the socket address.
    pub fn effective_address(&self) -> PeerAddress {
        self.advertised
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_else(|| self.remote.clone())
    }

    /// Record the listening address the remote announced in a request.
    pub fn advertise(&self, address: &PeerAddress) {
        if *address == self.remote {
            return;
        }
        let mut advertised = self.advertised.write().unwrap_or_else(PoisonError::into_inner);
        if advertised.as_ref() != Some(address) {
            *advertised = Some(address.clone());
        }
    }

    /// Whether this session reaches the peer listening on `address`.
    pub fn matches(&self, address: &PeerAddress) -> bool {
        if self.remote == *address {
            return true;
        }
        self.advertised
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            == Some(address)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reader claim
    // ─────────────────────────────────────────────────────────────────────────

    /// Claim the single reader slot. Succeeds for exactly one caller until
    /// the slot is released.
    pub fn try_claim_reader(&self) -> bool {
        self.reader_claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn has_reader(&self) -> bool {
        self.reader_claimed.load(Ordering::Acquire)
    }

    pub fn release_reader(&self) {
        self.reader_claimed.store(false, Ordering::Release);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Liveness
    // ─────────────────────────────────────────────────────────────────────────

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Mark the session dead. Pools drop inactive sessions.
    pub fn close(&self) {
        self.active.store(false, Ordering::Release);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // I/O
    // ─────────────────────────────────────────────────────────────────────────

    /// Write one record followed by a newline, then flush.
    pub async fn write_line(&self, line: &str) -> Result<()> {
        if !self.is_active() {
            return Err(NetError::Closed);
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read the next line. `Ok(None)` on end of stream.
    ///
    /// A record longer than the size limit is a protocol error; the stream
    /// is left mid-record, so the caller must drop the session.
    ///
    /// Only the task holding the reader claim should call this.
    pub async fn read_line(&self) -> Result<Option<String>> {
        let mut reader = self.reader.lock().await;
        let mut limited = (&mut *reader).take(self.max_line as u64);
        let mut line = String::new();
        let n = limited.read_line(&mut line).await?;
        if n == 0 {
            return Ok(None);
        }
        if !line.ends_with('\n') && n >= self.max_line {
            return Err(NetError::Protocol(format!(
                "record exceeds {} bytes",
                self.max_line
            )));
        }
        Ok(Some(line))
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("remote", &self.remote.to_string())
            .field("active", &self.is_active())
            .field("reader", &self.has_reader())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn session_pair(a: PeerAddress, b: PeerAddress) -> (Session, Session) {
        Session::pair(a, b)
    }

    #[tokio::test]
    async fn test_lines_cross_the_pipe() {
        let (a, b) = session_pair(PeerAddress::new("a", 1), PeerAddress::new("b", 2));
        a.write_line(r#"{"action":"heartbeat"}"#).await.unwrap();
        let line = b.read_line().await.unwrap().unwrap();
        assert_eq!(line.trim_end(), r#"{"action":"heartbeat"}"#);
    }

    #[tokio::test]
    async fn test_eof_reads_none() {
        let (a, b) = session_pair(PeerAddress::new("a", 1), PeerAddress::new("b", 2));
        drop(a);
        assert!(b.read_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_single_reader_claim_under_contention() {
        let (a, _b) = session_pair(PeerAddress::new("a", 1), PeerAddress::new("b", 2));
        let session = Arc::new(a);
        let mut tasks = Vec::new();
        for _ in 0..32 {
            let s = session.clone();
            tasks.push(tokio::spawn(async move { s.try_claim_reader() }));
        }
        let mut wins = 0;
        for t in tasks {
            if t.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
        assert!(session.has_reader());

        session.release_reader();
        assert!(session.try_claim_reader());
        assert!(!session.try_claim_reader());
    }

    #[tokio::test]
    async fn test_advertised_address_matches() {
        let (a, _b) = session_pair(PeerAddress::new("a", 1), PeerAddress::new("10.0.0.5", 50123));
        let listen = PeerAddress::new("10.0.0.5", 9001);
        assert!(!a.matches(&listen));
        a.advertise(&listen);
        assert!(a.matches(&listen));
        assert!(a.matches(&PeerAddress::new("10.0.0.5", 50123)));
        assert_eq!(a.effective_address(), listen);
    }

    #[tokio::test]
    async fn test_oversized_line_is_protocol_error() {
        let (a, b) = session_pair(PeerAddress::new("a", 1), PeerAddress::new("b", 2));
        let b = b.with_max_line(16);
        a.write_line("short").await.unwrap();
        a.write_line(&"x".repeat(100)).await.unwrap();

        assert_eq!(b.read_line().await.unwrap().unwrap(), "short\n");
        assert!(matches!(b.read_line().await, Err(NetError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_line_at_limit_is_accepted() {
        let (a, b) = session_pair(PeerAddress::new("a", 1), PeerAddress::new("b", 2));
        let b = b.with_max_line(6);
        a.write_line("12345").await.unwrap();
        assert_eq!(b.read_line().await.unwrap().unwrap(), "12345\n");
    }

    #[tokio::test]
    async fn test_closed_session_rejects_writes() {
        let (a, _b) = session_pair(PeerAddress::new("a", 1), PeerAddress::new("b", 2));
        a.close();
        assert!(matches!(a.write_line("x").await, Err(NetError::Closed)));
    }
}
