//! Inbound side of the fleet link.
//!
//! [`Listener::bind`] claims the listening socket; [`Listener::spawn`] moves
//! the accept loop onto its own Tokio task and returns a [`ListenerHandle`].
//! Every accepted connection gets its own task, which reads exactly one
//! frame, closes the socket, and hands the message to the [`Dispatcher`].
//! Slow or misbehaving peers therefore never hold up acceptance.
//!
//! # Shutdown
//!
//! [`ListenerHandle::shutdown`] stops the accept loop, takes over every
//! connection still queued on the socket, and closes the socket.  It then
//! waits up to the drain timeout for in-flight connections and aborts
//! whatever is still running.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use fleetlink_types::{Endpoint, FleetError};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::dispatcher::Dispatcher;
use crate::transport::Timeouts;
use crate::wire::{MAX_FRAME_BYTES, read_frame};

/// First pause after a failed `accept`; doubled per consecutive failure.
const ACCEPT_BACKOFF_BASE: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Pause before retrying `accept` after `failures` consecutive errors.
fn accept_backoff(failures: u32) -> Duration {
    ACCEPT_BACKOFF_BASE
        .saturating_mul(1u32 << failures.saturating_sub(1).min(16))
        .min(ACCEPT_BACKOFF_MAX)
}

/// A bound, not yet running, listener.
pub struct Listener {
    socket: TcpListener,
    local_addr: SocketAddr,
    dispatcher: Dispatcher,
    read_timeout: Duration,
    drain_timeout: Duration,
}

impl Listener {
    /// Bind the listening socket at `endpoint`.
    ///
    /// Port `0` asks the OS for an ephemeral port; read it back with
    /// [`Listener::local_addr`].
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::Listener`] if the socket cannot be bound.
    pub async fn bind(
        endpoint: &Endpoint,
        dispatcher: Dispatcher,
        timeouts: Timeouts,
    ) -> Result<Self, FleetError> {
        let socket = TcpListener::bind((endpoint.address.as_str(), endpoint.port))
            .await
            .map_err(|e| FleetError::Listener(format!("bind error on {endpoint}: {e}")))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| FleetError::Listener(format!("no local address for {endpoint}: {e}")))?;
        Ok(Self {
            socket,
            local_addr,
            dispatcher,
            read_timeout: timeouts.read,
            drain_timeout: timeouts.drain,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Start accepting connections on a background task.
    pub fn spawn(self) -> ListenerHandle {
        let local_addr = self.local_addr;
        let stop = Arc::new(Notify::new());
        let task = tokio::spawn(self.run(Arc::clone(&stop)));
        info!(addr = %local_addr, "fleet listener started");
        ListenerHandle {
            local_addr,
            stop,
            task,
        }
    }

    async fn run(self, stop: Arc<Notify>) -> usize {
        let Listener {
            socket,
            local_addr,
            dispatcher,
            read_timeout,
            drain_timeout,
        } = self;
        let mut connections: JoinSet<()> = JoinSet::new();
        let mut served = 0usize;
        let mut accept_failures = 0u32;

        loop {
            tokio::select! {
                _ = stop.notified() => break,
                accepted = socket.accept() => match accepted {
                    Ok((stream, peer)) => {
                        accept_failures = 0;
                        served += 1;
                        let dispatcher = dispatcher.clone();
                        connections.spawn(handle_connection(stream, peer, dispatcher, read_timeout));
                    }
                    Err(e) => {
                        accept_failures = accept_failures.saturating_add(1);
                        let pause = accept_backoff(accept_failures);
                        error!(addr = %local_addr, error = %e, failures = accept_failures, ?pause, "accept error");
                        tokio::time::sleep(pause).await;
                    }
                },
                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = finished {
                        warn!(error = %e, "connection task ended abnormally");
                    }
                }
            }
        }

        // Peers whose handshake already completed may have been told their
        // frame was delivered; serve them before the socket goes away.
        let pending = adopt_backlog(socket, local_addr);
        for (stream, peer) in pending {
            served += 1;
            connections.spawn(handle_connection(stream, peer, dispatcher.clone(), read_timeout));
        }
        debug!(addr = %local_addr, in_flight = connections.len(), "draining connections");

        let drained = timeout(drain_timeout, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                addr = %local_addr,
                remaining = connections.len(),
                "drain timeout elapsed; aborting connections"
            );
            connections.shutdown().await;
        }

        info!(addr = %local_addr, served, "fleet listener stopped");
        served
    }
}

/// Owner of a running listener task.
pub struct ListenerHandle {
    local_addr: SocketAddr,
    stop: Arc<Notify>,
    task: JoinHandle<usize>,
}

impl ListenerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Whether the accept loop has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the listener and wait until its socket is released.
    ///
    /// Returns the number of connections accepted over the listener's
    /// lifetime.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::Listener`] if the listener task panicked.
    pub async fn shutdown(self) -> Result<usize, FleetError> {
        // `notify_one` stores a permit, so this works even if the loop is
        // not parked on `notified()` right now.
        self.stop.notify_one();
        self.task
            .await
            .map_err(|e| FleetError::Listener(format!("listener task failed: {e}")))
    }
}

/// Accept every connection already queued on `socket`, then close it.
///
/// Uses non-blocking `accept` calls directly, so connections the reactor has
/// not reported yet are still picked up.
fn adopt_backlog(socket: TcpListener, local_addr: SocketAddr) -> Vec<(TcpStream, SocketAddr)> {
    let backlog = match socket.into_std() {
        Ok(backlog) => backlog,
        Err(e) => {
            warn!(addr = %local_addr, error = %e, "could not inspect accept queue");
            return Vec::new();
        }
    };

    let mut pending = Vec::new();
    loop {
        match backlog.accept() {
            Ok((stream, peer)) => {
                match stream.set_nonblocking(true).and_then(|()| TcpStream::from_std(stream)) {
                    Ok(stream) => pending.push((stream, peer)),
                    Err(e) => warn!(peer = %peer, error = %e, "dropping queued connection"),
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(addr = %local_addr, error = %e, "accept error while closing");
                break;
            }
        }
    }
    pending
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    dispatcher: Dispatcher,
    read_timeout: Duration,
) {
    let message = match timeout(read_timeout, read_frame(&mut stream, MAX_FRAME_BYTES)).await {
        Err(_) => {
            warn!(peer = %peer, "dropping connection: no frame within read timeout");
            return;
        }
        Ok(Err(e)) => {
            warn!(peer = %peer, error = %e, "dropping malformed frame");
            return;
        }
        Ok(Ok(message)) => message,
    };
    drop(stream);

    let (id, kind, sender) = (message.id, message.kind, message.sender.clone());
    match dispatcher.dispatch(message).await {
        Ok(outcome) => debug!(peer = %peer, %id, ?kind, %sender, ?outcome, "dispatched"),
        Err(e) => warn!(peer = %peer, %id, ?kind, %sender, error = %e, "message not applied"),
    }
}
