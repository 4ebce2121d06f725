//! # Listener Supervisor
//!
//! Owns the set of bound TCP listeners, one accept-loop task per
//! configured port. The running spec set is replaced atomically on
//! reload: the supervisor diffs by port, closes removed listeners
//! (draining their connections briefly, then forcing them), starts added
//! ones and rebinds changed ones. In-flight connections never migrate
//! across a reload.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{error, info, warn};

use lablink_core::{AppEvent, EventBus, ListenerSpec, ListenerState};
use lablink_db::Database;

use crate::connection::{run_connection, ConnectionContext};
use crate::error::{IngestError, IngestResult};
use crate::mapper::FieldMap;

/// How long a closing listener waits for its connections before aborting
/// them.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

// =============================================================================
// Shared Context
// =============================================================================

/// Dependencies shared by every listener, passed explicitly.
#[derive(Clone)]
pub struct IngestContext {
    pub db: Database,
    pub events: EventBus,
    pub idle_timeout: Duration,
    pub app_name: String,
}

// =============================================================================
// Listener
// =============================================================================

/// A bound acceptor and its running task.
pub struct Listener {
    spec: ListenerSpec,
    local_addr: SocketAddr,
    cancel_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
    client_count: Arc<AtomicUsize>,
}

impl Listener {
    /// Binds the port and spawns the accept loop.
    pub async fn spawn(spec: ListenerSpec, ctx: IngestContext) -> IngestResult<Listener> {
        let listener = TcpListener::bind(("0.0.0.0", spec.port)).await?;
        let local_addr = listener.local_addr()?;
        info!(port = spec.port, addr = %local_addr, analyzer = %spec.analyzer_type,
              protocol = %spec.protocol, "Listener online");

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let client_count = Arc::new(AtomicUsize::new(0));

        ctx.events.publish(AppEvent::ListenerStateChanged {
            port: spec.port,
            state: ListenerState::Online,
            client_count: 0,
        });

        let task = tokio::spawn(accept_loop(
            listener,
            spec.clone(),
            ctx,
            cancel_rx,
            client_count.clone(),
        ));

        Ok(Listener {
            spec,
            local_addr,
            cancel_tx,
            task,
            client_count,
        })
    }

    pub fn spec(&self) -> &ListenerSpec {
        &self.spec
    }

    /// Actual bound address; differs from the configured port when port
    /// 0 was requested (tests).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn client_count(&self) -> usize {
        self.client_count.load(Ordering::Relaxed)
    }

    /// Stops accepting, drains connections for `drain`, then forces the
    /// stragglers.
    pub async fn shutdown(self, drain: Duration) {
        let _ = self.cancel_tx.send(true);
        if timeout(drain + Duration::from_millis(250), self.task)
            .await
            .is_err()
        {
            warn!(port = self.spec.port, "Listener task did not stop in time");
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    spec: ListenerSpec,
    ctx: IngestContext,
    mut cancel_rx: watch::Receiver<bool>,
    client_count: Arc<AtomicUsize>,
) {
    let field_map = FieldMap::resolve(
        spec.analyzer_type,
        spec.protocol,
        spec.field_map_id.as_deref(),
    );
    let mut connections: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            changed = cancel_rx.changed() => {
                if changed.is_err() || *cancel_rx.borrow() {
                    break;
                }
            }

            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let count = client_count.fetch_add(1, Ordering::Relaxed) + 1;
                        ctx.events.publish(AppEvent::ListenerStateChanged {
                            port: spec.port,
                            state: ListenerState::Online,
                            client_count: count,
                        });

                        let conn_ctx = ConnectionContext {
                            port: spec.port,
                            analyzer: spec.analyzer_type,
                            protocol: spec.protocol,
                            field_map: field_map.clone(),
                            db: ctx.db.clone(),
                            events: ctx.events.clone(),
                            idle_timeout: ctx.idle_timeout,
                            app_name: ctx.app_name.clone(),
                        };
                        let cancel = cancel_rx.clone();
                        let counter = client_count.clone();
                        let events = ctx.events.clone();
                        let port = spec.port;

                        connections.spawn(async move {
                            let reason = run_connection(stream, peer, conn_ctx, cancel).await;
                            info!(%peer, port, %reason, "Connection closed");
                            let count = counter.fetch_sub(1, Ordering::Relaxed) - 1;
                            events.publish(AppEvent::ListenerStateChanged {
                                port,
                                state: ListenerState::Online,
                                client_count: count,
                            });
                        });
                    }
                    Err(e) => {
                        warn!(port = spec.port, error = %e, "Accept failed");
                    }
                }
            }

            // Reap finished connection tasks as they complete.
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    // Stop accepting immediately, then drain active connections. The
    // cancel watch has already been flipped, so connections are exiting.
    drop(listener);

    let draining = async {
        while connections.join_next().await.is_some() {}
    };
    if timeout(DRAIN_TIMEOUT, draining).await.is_err() {
        warn!(port = spec.port, "Forcing remaining connections closed");
        connections.abort_all();
        while connections.join_next().await.is_some() {}
    }

    ctx.events.publish(AppEvent::ListenerStateChanged {
        port: spec.port,
        state: ListenerState::Offline,
        client_count: 0,
    });
    info!(port = spec.port, "Listener offline");
}

// =============================================================================
// Supervisor
// =============================================================================

/// Owns the listeners and applies spec-set changes.
pub struct ListenerSupervisor {
    ctx: IngestContext,
    listeners: HashMap<u16, Listener>,
}

impl ListenerSupervisor {
    pub fn new(ctx: IngestContext) -> Self {
        ListenerSupervisor {
            ctx,
            listeners: HashMap::new(),
        }
    }

    /// Starts the given listener set. Idempotent: starting an already
    /// running set is a no-op diff.
    pub async fn start(&mut self, specs: Vec<ListenerSpec>) -> IngestResult<()> {
        self.reload(specs).await
    }

    /// Applies a new spec set: closes removed ports, rebinds changed
    /// ones, starts added ones.
    ///
    /// Ports that fail to bind are reported (event + error return) but do
    /// not prevent the rest of the set from starting.
    pub async fn reload(&mut self, specs: Vec<ListenerSpec>) -> IngestResult<()> {
        let desired: HashMap<u16, ListenerSpec> =
            specs.iter().map(|s| (s.port, s.clone())).collect();

        // Close removed and changed listeners first so rebinding ports
        // does not race the old socket.
        let to_close: Vec<u16> = self
            .listeners
            .iter()
            .filter(|(port, listener)| {
                desired
                    .get(port)
                    .map(|spec| spec != listener.spec())
                    .unwrap_or(true)
            })
            .map(|(port, _)| *port)
            .collect();

        for port in to_close {
            if let Some(listener) = self.listeners.remove(&port) {
                info!(port, "Closing listener");
                listener.shutdown(DRAIN_TIMEOUT).await;
            }
        }

        // Start whatever is missing.
        let mut first_error: Option<IngestError> = None;
        for spec in specs {
            if self.listeners.contains_key(&spec.port) {
                continue;
            }
            match Listener::spawn(spec.clone(), self.ctx.clone()).await {
                Ok(listener) => {
                    self.listeners.insert(spec.port, listener);
                }
                Err(e) => {
                    error!(port = spec.port, error = %e, "Failed to bind listener");
                    self.ctx
                        .events
                        .error("listener", format!("port {}: {}", spec.port, e));
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Stops every listener. Idempotent.
    pub async fn stop(&mut self) {
        for (_, listener) in self.listeners.drain() {
            listener.shutdown(DRAIN_TIMEOUT).await;
        }
    }

    /// Ports currently bound.
    pub fn bound_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.listeners.keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    /// Actual bound address of a listener.
    pub fn local_addr(&self, port: u16) -> Option<SocketAddr> {
        self.listeners.get(&port).map(Listener::local_addr)
    }

    /// Live connection count on a port.
    pub fn client_count(&self, port: u16) -> Option<usize> {
        self.listeners.get(&port).map(Listener::client_count)
    }
}
