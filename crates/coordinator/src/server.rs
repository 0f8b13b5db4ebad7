//! TCP front end
//!
//! Each accepted connection gets its own task that splits the socket into a
//! line reader and a writer. All reads are forwarded as [`PeerEvent`]s to a
//! single coordinator task, which owns the [`Coordinator`] and is the only
//! place state is mutated. Outgoing lines travel back over a per-peer
//! channel.

use crate::coordinator::Coordinator;
use crate::registry::PeerId;
use chrono::Utc;
use nightwatch_core::Config;
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Input to the coordinator task
#[derive(Debug)]
pub enum PeerEvent {
    /// A connection was accepted; the coordinator answers with its id
    Connected {
        remote: SocketAddr,
        tx: mpsc::UnboundedSender<String>,
        reply: oneshot::Sender<PeerId>,
    },
    Line {
        id: PeerId,
        line: String,
    },
    Closed {
        id: PeerId,
    },
}

pub struct CoordinatorServer {
    listener: TcpListener,
    coordinator: Coordinator,
    reload_path: Option<PathBuf>,
}

impl CoordinatorServer {
    pub async fn bind(addr: &str, coordinator: Coordinator) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "coordinator listening");
        Ok(Self {
            listener,
            coordinator,
            reload_path: None,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Configuration file re-read on SIGHUP
    pub fn with_reload_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.reload_path = Some(path.into());
        self
    }

    /// Serve until `shutdown` resolves
    pub async fn run_until<F>(self, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        let Self {
            listener,
            mut coordinator,
            reload_path,
        } = self;
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let acceptor = tokio::spawn(accept_loop(listener, events_tx));

        let mut peers: HashMap<PeerId, mpsc::UnboundedSender<String>> = HashMap::new();
        let mut ticker = tokio::time::interval(coordinator.config().centrald.tick_interval_duration());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut hangup = Hangup::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                Some(event) = events_rx.recv() => match event {
                    PeerEvent::Connected { remote, tx, reply } => {
                        let id = coordinator.connect(remote.to_string(), Utc::now());
                        peers.insert(id, tx);
                        if reply.send(id).is_err() {
                            peers.remove(&id);
                            coordinator.disconnect(id, Utc::now());
                        }
                    }
                    PeerEvent::Line { id, line } => coordinator.handle_line(id, &line, Utc::now()),
                    PeerEvent::Closed { id } => {
                        peers.remove(&id);
                        coordinator.disconnect(id, Utc::now());
                    }
                },
                _ = ticker.tick() => coordinator.tick(Utc::now()),
                _ = hangup.recv() => match &reload_path {
                    Some(path) => match Config::from_file(path) {
                        Ok(config) => coordinator.reload(config, Utc::now()),
                        Err(err) => error!(path = %path.display(), %err, "configuration reload failed"),
                    },
                    None => warn!("SIGHUP received but no configuration file to reload"),
                },
                _ = &mut shutdown => {
                    info!("coordinator shutting down");
                    break;
                }
            }

            for envelope in coordinator.drain_outbox() {
                if let Some(tx) = peers.get(&envelope.to) {
                    // a closed writer shows up as a Closed event
                    let _ = tx.send(envelope.message.to_string());
                }
            }
        }

        acceptor.abort();
        Ok(())
    }
}

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

async fn accept_loop(listener: TcpListener, events: mpsc::UnboundedSender<PeerEvent>) {
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                debug!(%remote, "connection accepted");
                tokio::spawn(serve_peer(stream, remote, events.clone()));
            }
            Err(e) => {
                // fd exhaustion and the like persist; back off
                error!("Failed to accept connection: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

async fn serve_peer(stream: TcpStream, remote: SocketAddr, events: mpsc::UnboundedSender<PeerEvent>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let (reply, id_rx) = oneshot::channel();
    if events
        .send(PeerEvent::Connected { remote, tx, reply })
        .is_err()
    {
        return;
    }
    let Ok(id) = id_rx.await else {
        return;
    };

    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if events.send(PeerEvent::Line { id, line }).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(peer_id = id, %remote, "read error: {}", e);
                    break;
                }
            },
            outgoing = rx.recv() => match outgoing {
                Some(mut text) => {
                    text.push('\n');
                    if let Err(e) = writer.write_all(text.as_bytes()).await {
                        warn!(peer_id = id, %remote, "write error: {}", e);
                        break;
                    }
                }
                None => break,
            },
        }
    }
    let _ = events.send(PeerEvent::Closed { id });
}

/// SIGHUP listener; never fires where signals are unavailable
#[cfg(unix)]
struct Hangup(Option<tokio::signal::unix::Signal>);

#[cfg(unix)]
impl Hangup {
    fn new() -> Self {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::hangup()) {
            Ok(signal) => Hangup(Some(signal)),
            Err(e) => {
                warn!("cannot listen for SIGHUP: {}", e);
                Hangup(None)
            }
        }
    }

    async fn recv(&mut self) {
        if let Some(signal) = self.0.as_mut() {
            if signal.recv().await.is_some() {
                return;
            }
            self.0 = None;
        }
        std::future::pending::<()>().await
    }
}

#[cfg(not(unix))]
struct Hangup;

#[cfg(not(unix))]
impl Hangup {
    fn new() -> Self {
        Hangup
    }

    async fn recv(&mut self) {
        std::future::pending::<()>().await
    }
}
