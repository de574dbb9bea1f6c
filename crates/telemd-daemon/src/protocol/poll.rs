//! Readiness multiplexer over the listener and all client sockets.
//!
//! ```text
//! PollSet:  [0] Listener   [1] client-3   [2] client-7   [3] client-8
//!                 │              │              │              │
//!                 └──────────────┴──── poll(2) ─┴──────────────┘
//!                                       │
//!                      ready tokens, in poll-set order
//! ```
//!
//! Index 0 always holds the listener. Client entries keep their insertion
//! order; removal shifts later entries down. The [`ConnectionTable`] owns
//! the sockets, so the `pollfd` array is rebuilt from borrowed descriptors on
//! every [`Multiplexer::wait`].
//!
//! # Security Considerations
//!
//! - The number of clients is capped; connections over the cap are accepted
//!   and closed at once so they do not linger in the kernel backlog.
//! - Clients that stop making progress are reaped after the idle timeout, so
//!   a reporter dribbling bytes cannot hold a slot forever.

use std::io;
use std::os::fd::AsFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tracing::{debug, info, warn};

use super::connection::{Client, ClientId, ConnectionTable};
use super::error::{FatalError, TerminationReason};

/// What a poll-set entry refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    /// The listening socket.
    Listener,
    /// A connected client.
    Client(ClientId),
}

/// One descriptor registered with the multiplexer.
#[derive(Debug, Clone, Copy)]
pub struct PollEntry {
    token: Token,
    requested: PollFlags,
    returned: PollFlags,
}

impl PollEntry {
    const fn readable(token: Token) -> Self {
        Self {
            token,
            requested: PollFlags::POLLIN,
            returned: PollFlags::empty(),
        }
    }

    /// What this entry refers to.
    #[must_use]
    pub const fn token(&self) -> Token {
        self.token
    }

    /// Events of interest.
    #[must_use]
    pub const fn requested(&self) -> PollFlags {
        self.requested
    }

    /// Events reported by the last wait.
    #[must_use]
    pub const fn returned(&self) -> PollFlags {
        self.returned
    }
}

/// Ordered poll entries. Index 0 is the listener.
#[derive(Debug)]
pub struct PollSet {
    entries: Vec<PollEntry>,
}

impl PollSet {
    fn new() -> Self {
        Self {
            entries: vec![PollEntry::readable(Token::Listener)],
        }
    }

    fn push(&mut self, token: Token) -> Result<(), FatalError> {
        self.entries
            .try_reserve(1)
            .map_err(|_| FatalError::OutOfMemory {
                what: "poll set",
                size: self.entries.len() + 1,
            })?;
        self.entries.push(PollEntry::readable(token));
        Ok(())
    }

    /// Position of a client's entry.
    #[must_use]
    pub fn index_of(&self, id: ClientId) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.token == Token::Client(id))
    }

    /// Number of entries, listener included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Always false; the listener entry is permanent.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry at `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&PollEntry> {
        self.entries.get(index)
    }

    /// Entries in poll order.
    pub fn iter(&self) -> impl Iterator<Item = &PollEntry> {
        self.entries.iter()
    }
}

/// Accept outcome for one pending connection.
#[derive(Debug)]
pub enum Accepted {
    /// Registered under this id.
    Registered(ClientId),
    /// Closed immediately.
    Rejected(TerminationReason),
}

/// Owns the listener, the connection table and the poll set.
#[derive(Debug)]
pub struct Multiplexer {
    listener: UnixListener,
    table: ConnectionTable,
    set: PollSet,
    max_connections: usize,
}

impl Multiplexer {
    /// Wrap a bound listener. The listener is switched to non-blocking mode.
    ///
    /// # Errors
    ///
    /// Returns [`FatalError::Listener`] if the listener cannot be made
    /// non-blocking.
    pub fn new(listener: UnixListener, max_connections: usize) -> Result<Self, FatalError> {
        listener
            .set_nonblocking(true)
            .map_err(FatalError::Listener)?;
        Ok(Self {
            listener,
            table: ConnectionTable::new(),
            set: PollSet::new(),
            max_connections,
        })
    }

    /// The poll set.
    #[must_use]
    pub const fn poll_set(&self) -> &PollSet {
        &self.set
    }

    /// Live client count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// True when no clients remain.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Look up a client mutably.
    pub fn client_mut(&mut self, id: ClientId) -> Option<&mut Client> {
        self.table.get_mut(id)
    }

    /// Register a connected stream with readable interest.
    ///
    /// # Errors
    ///
    /// Returns [`FatalError::OutOfMemory`] if the table or poll set cannot
    /// grow.
    pub fn add(&mut self, stream: UnixStream) -> Result<ClientId, FatalError> {
        // Reserve the poll slot first so a failure leaves both structures
        // consistent.
        self.set
            .entries
            .try_reserve(1)
            .map_err(|_| FatalError::OutOfMemory {
                what: "poll set",
                size: self.set.len() + 1,
            })?;
        let id = self.table.insert(stream)?;
        self.set.push(Token::Client(id))?;
        Ok(id)
    }

    /// Remove the client at poll-set `index`, closing its socket.
    ///
    /// Index 0 is the listener and is never removed.
    pub fn remove(&mut self, index: usize) -> Option<Client> {
        match self.set.get(index).map(PollEntry::token) {
            Some(Token::Client(id)) => {
                self.set.entries.remove(index);
                self.table.remove(id)
            },
            _ => None,
        }
    }

    /// Remove a client by id.
    pub fn remove_client(&mut self, id: ClientId) -> Option<Client> {
        let index = self.set.index_of(id)?;
        self.remove(index)
    }

    /// Block until a descriptor is ready or `timeout` elapses.
    ///
    /// Returns the ready tokens in poll-set order. An interrupted wait
    /// returns no tokens. `None` waits indefinitely; longer timeouts are
    /// clamped to about 65 seconds.
    ///
    /// # Errors
    ///
    /// Returns [`FatalError::Poll`] on any `poll(2)` failure other than
    /// `EINTR`.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<Vec<Token>, FatalError> {
        let timeout = timeout.map_or(PollTimeout::NONE, |t| {
            PollTimeout::from(u16::try_from(t.as_millis()).unwrap_or(u16::MAX))
        });

        let oom = |size| FatalError::OutOfMemory {
            what: "pollfd array",
            size,
        };
        let mut indices = Vec::new();
        indices
            .try_reserve_exact(self.set.len())
            .map_err(|_| oom(self.set.len()))?;

        let returned = {
            let mut fds = Vec::new();
            fds.try_reserve_exact(self.set.len())
                .map_err(|_| oom(self.set.len()))?;
            for (index, entry) in self.set.entries.iter().enumerate() {
                let fd = match entry.token {
                    Token::Listener => self.listener.as_fd(),
                    Token::Client(id) => match self.table.get(id) {
                        Some(client) => client.as_fd(),
                        None => continue,
                    },
                };
                fds.push(PollFd::new(fd, entry.requested));
                indices.push(index);
            }

            match poll(&mut fds, timeout) {
                Ok(_) => {},
                Err(Errno::EINTR) => {
                    debug!("poll interrupted");
                    return Ok(Vec::new());
                },
                Err(e) => return Err(FatalError::Poll(e)),
            }

            fds.iter()
                .map(|fd| fd.revents().unwrap_or_else(PollFlags::empty))
                .collect::<Vec<_>>()
        };

        for entry in &mut self.set.entries {
            entry.returned = PollFlags::empty();
        }
        for (index, revents) in indices.into_iter().zip(returned) {
            self.set.entries[index].returned = revents;
        }

        Ok(self
            .set
            .entries
            .iter()
            .filter(|entry| !entry.returned.is_empty())
            .map(|entry| entry.token)
            .collect())
    }

    /// Accept every pending connection.
    ///
    /// # Errors
    ///
    /// Returns a [`FatalError`] if a client cannot be registered. Accept
    /// failures are logged and end the current batch.
    pub fn accept_pending(&mut self) -> Result<Vec<Accepted>, FatalError> {
        let mut accepted = Vec::new();
        loop {
            let stream = match self.listener.accept() {
                Ok((stream, _)) => stream,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    break;
                },
            };

            if self.table.len() >= self.max_connections {
                warn!(
                    max_connections = self.max_connections,
                    "Connection limit reached, closing new connection"
                );
                drop(stream);
                accepted.push(Accepted::Rejected(TerminationReason::AtCapacity {
                    max: self.max_connections,
                }));
                continue;
            }

            if let Err(e) = stream.set_nonblocking(true) {
                warn!(error = %e, "Failed to make client socket non-blocking");
                accepted.push(Accepted::Rejected(TerminationReason::Io(e)));
                continue;
            }

            let id = self.add(stream)?;
            debug!(client = %id, connections = self.table.len(), "Accepted connection");
            accepted.push(Accepted::Registered(id));
        }
        Ok(accepted)
    }

    /// Disconnect clients idle for longer than `timeout`.
    pub fn reap_idle(&mut self, now: Instant, timeout: Duration) -> Vec<ClientId> {
        let expired: Vec<(ClientId, Duration)> = self
            .table
            .iter()
            .map(|client| (client.id(), client.idle_for(now)))
            .filter(|(_, idle)| *idle > timeout)
            .collect();

        for (id, idle) in &expired {
            if let Some(client) = self.remove_client(*id) {
                let reason = TerminationReason::IdleTimeout {
                    idle_secs: idle.as_secs(),
                };
                info!(
                    client = %id,
                    received = client.received(),
                    expected = client.expected(),
                    %reason,
                    "Terminating idle client"
                );
            }
        }

        expired.into_iter().map(|(id, _)| id).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::TempDir;

    use super::*;

    fn listener(tmp: &TempDir) -> (UnixListener, std::path::PathBuf) {
        let path = tmp.path().join("test.sock");
        (UnixListener::bind(&path).unwrap(), path)
    }

    #[test]
    fn test_listener_is_entry_zero() {
        let tmp = TempDir::new().unwrap();
        let (listener, _) = listener(&tmp);
        let mut mux = Multiplexer::new(listener, 4).unwrap();

        assert_eq!(mux.poll_set().len(), 1);
        assert_eq!(mux.poll_set().get(0).unwrap().token(), Token::Listener);
        assert!(mux.is_empty());
        assert!(mux.remove(0).is_none());
    }

    #[test]
    fn test_add_and_remove_preserve_order() {
        let tmp = TempDir::new().unwrap();
        let (listener, _) = listener(&tmp);
        let mut mux = Multiplexer::new(listener, 8).unwrap();

        let mut peers = Vec::new();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let (stream, peer) = UnixStream::pair().unwrap();
            peers.push(peer);
            ids.push(mux.add(stream).unwrap());
        }
        assert_eq!(mux.len(), 3);
        assert_eq!(
            mux.poll_set().get(1).unwrap().requested(),
            PollFlags::POLLIN
        );

        let removed = mux.remove(2).unwrap();
        assert_eq!(removed.id(), ids[1]);

        let tokens: Vec<Token> = mux.poll_set().iter().map(PollEntry::token).collect();
        assert_eq!(
            tokens,
            vec![Token::Listener, Token::Client(ids[0]), Token::Client(ids[2])]
        );
        assert_eq!(mux.poll_set().index_of(ids[2]), Some(2));
        assert!(mux.remove_client(ids[1]).is_none());
    }

    #[test]
    fn test_wait_reports_ready_clients_in_order() {
        let tmp = TempDir::new().unwrap();
        let (listener, _) = listener(&tmp);
        let mut mux = Multiplexer::new(listener, 8).unwrap();

        let (a, _a_peer) = UnixStream::pair().unwrap();
        let (b, mut b_peer) = UnixStream::pair().unwrap();
        let _a = mux.add(a).unwrap();
        let b = mux.add(b).unwrap();

        b_peer.write_all(b"x").unwrap();
        let ready = mux.wait(Some(Duration::from_millis(500))).unwrap();

        assert_eq!(ready, vec![Token::Client(b)]);
        assert!(mux
            .poll_set()
            .get(2)
            .unwrap()
            .returned()
            .contains(PollFlags::POLLIN));
    }

    #[test]
    fn test_wait_times_out_with_no_tokens() {
        let tmp = TempDir::new().unwrap();
        let (listener, _) = listener(&tmp);
        let mut mux = Multiplexer::new(listener, 8).unwrap();

        let ready = mux.wait(Some(Duration::from_millis(10))).unwrap();
        assert!(ready.is_empty());
    }

    #[test]
    fn test_accept_respects_connection_cap() {
        let tmp = TempDir::new().unwrap();
        let (listener, path) = listener(&tmp);
        let mut mux = Multiplexer::new(listener, 1).unwrap();

        let _first = UnixStream::connect(&path).unwrap();
        let mut second = UnixStream::connect(&path).unwrap();

        let ready = mux.wait(Some(Duration::from_millis(500))).unwrap();
        assert_eq!(ready, vec![Token::Listener]);

        let accepted = mux.accept_pending().unwrap();
        assert_eq!(accepted.len(), 2);
        assert!(matches!(accepted[0], Accepted::Registered(_)));
        assert!(matches!(
            accepted[1],
            Accepted::Rejected(TerminationReason::AtCapacity { max: 1 })
        ));
        assert_eq!(mux.len(), 1);

        let mut buf = [0u8; 1];
        assert_eq!(std::io::Read::read(&mut second, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_reap_idle_clients() {
        let tmp = TempDir::new().unwrap();
        let (listener, _) = listener(&tmp);
        let mut mux = Multiplexer::new(listener, 8).unwrap();

        let (stream, _peer) = UnixStream::pair().unwrap();
        let id = mux.add(stream).unwrap();

        assert!(mux.reap_idle(Instant::now(), Duration::from_secs(60)).is_empty());

        let later = Instant::now() + Duration::from_secs(120);
        assert_eq!(mux.reap_idle(later, Duration::from_secs(60)), vec![id]);
        assert!(mux.is_empty());
        assert_eq!(mux.poll_set().len(), 1);
    }
}
