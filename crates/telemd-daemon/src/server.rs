//! The collector event loop.
//!
//! One thread, one `poll(2)` per turn. Ready descriptors are handled in
//! poll-set order; each client handler runs to completion (or to
//! `WouldBlock`) before the next one starts. Maintenance (identity refresh,
//! idle reaping) runs at least once per tick interval.

use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::protocol::{
    Accepted, ClientId, FatalError, Multiplexer, ReceiveOutcome, Token, receive,
};
use crate::state::DaemonContext;

/// Why [`Collector::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The shutdown flag was raised.
    Shutdown,
    /// No client connected within the idle-exit window.
    Idle,
}

/// What one turn of the loop did.
#[derive(Debug, Default)]
pub struct Turn {
    /// Connections registered.
    pub accepted: usize,
    /// Connections closed at accept time.
    pub rejected: usize,
    /// Staged files, in processing order.
    pub processed: Vec<PathBuf>,
    /// Clients dropped without a staged record.
    pub terminated: usize,
}

/// Listener, clients and daemon context driven by one event loop.
#[derive(Debug)]
pub struct Collector {
    ctx: DaemonContext,
    mux: Multiplexer,
    last_tick: Instant,
    idle_since: Instant,
}

impl Collector {
    /// Wrap a bound listener.
    ///
    /// # Errors
    ///
    /// Returns [`FatalError::Listener`] if the listener cannot be made
    /// non-blocking.
    pub fn new(ctx: DaemonContext, listener: UnixListener) -> Result<Self, FatalError> {
        let mux = Multiplexer::new(listener, ctx.config().daemon.max_connections)?;
        let now = Instant::now();
        Ok(Self {
            ctx,
            mux,
            last_tick: now,
            idle_since: now,
        })
    }

    /// The daemon context.
    #[must_use]
    pub const fn context(&self) -> &DaemonContext {
        &self.ctx
    }

    /// The multiplexer.
    #[must_use]
    pub const fn multiplexer(&self) -> &Multiplexer {
        &self.mux
    }

    /// Run until `shutdown` is raised or the idle-exit window elapses.
    ///
    /// # Errors
    ///
    /// Returns a [`FatalError`] on allocation or poll failure.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<ExitReason, FatalError> {
        let daemon = &self.ctx.config().daemon;
        let tick = daemon.tick_interval();
        let idle_exit = daemon.idle_exit();

        info!(
            tick_secs = tick.as_secs(),
            max_connections = daemon.max_connections,
            "Collector running"
        );

        loop {
            if shutdown.load(Ordering::SeqCst) {
                return Ok(ExitReason::Shutdown);
            }

            let wait = tick.saturating_sub(self.last_tick.elapsed());
            self.turn(Some(wait))?;

            let now = Instant::now();
            if now.saturating_duration_since(self.last_tick) >= tick {
                self.tick(now);
            }

            if let Some(limit) = idle_exit {
                if self.mux.is_empty() && now.saturating_duration_since(self.idle_since) >= limit {
                    info!(idle_secs = limit.as_secs(), "No clients, exiting");
                    return Ok(ExitReason::Idle);
                }
            }
        }
    }

    /// Wait once for readiness and handle every ready descriptor.
    ///
    /// # Errors
    ///
    /// Returns a [`FatalError`] on allocation or poll failure.
    pub fn turn(&mut self, timeout: Option<Duration>) -> Result<Turn, FatalError> {
        let mut turn = Turn::default();

        for token in self.mux.wait(timeout)? {
            match token {
                Token::Listener => {
                    for accepted in self.mux.accept_pending()? {
                        match accepted {
                            Accepted::Registered(_) => turn.accepted += 1,
                            Accepted::Rejected(_) => turn.rejected += 1,
                        }
                    }
                },
                Token::Client(id) => match self.handle_client(id)? {
                    Some(ReceiveOutcome::Processed(path)) => turn.processed.push(path),
                    Some(ReceiveOutcome::Terminated(_)) => turn.terminated += 1,
                    Some(ReceiveOutcome::NeedsMore) | None => {},
                },
            }
        }

        if !self.mux.is_empty() {
            self.idle_since = Instant::now();
        }
        Ok(turn)
    }

    /// Periodic maintenance: refresh the persisted identity and reap idle
    /// clients.
    pub fn tick(&mut self, now: Instant) {
        self.last_tick = now;

        match self.ctx.identity().maintain() {
            Ok(true) => info!("Generated new machine id"),
            Ok(false) => {},
            Err(e) => error!(error = %e, "Failed to refresh machine id"),
        }

        if let Some(timeout) = self.ctx.config().daemon.client_timeout() {
            let reaped = self.mux.reap_idle(now, timeout);
            if !reaped.is_empty() {
                debug!(count = reaped.len(), "Reaped idle clients");
            }
        }
    }

    /// Advance one client. Returns `None` if the client is already gone.
    fn handle_client(&mut self, id: ClientId) -> Result<Option<ReceiveOutcome>, FatalError> {
        let Some(client) = self.mux.client_mut(id) else {
            return Ok(None);
        };

        let outcome = receive(client, &self.ctx)?;
        match &outcome {
            ReceiveOutcome::NeedsMore => return Ok(Some(outcome)),
            ReceiveOutcome::Processed(path) => {
                info!(client = %id, path = %path.display(), "Record staged");
            },
            ReceiveOutcome::Terminated(reason) => {
                warn!(client = %id, %reason, "Terminating client");
            },
        }

        self.mux.remove_client(id);
        Ok(Some(outcome))
    }
}
