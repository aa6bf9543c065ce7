//! Server runtime.
//!
//! - One accept loop.
//! - One actor task per session: owns a `SessionCoordinator`, serializes
//!   connection events and the broadcast tick in a single `select!` loop.
//! - Per connection: a reader (decode, forward, liveness timeout) and a writer
//!   draining the connection's `Outbox`.
//!
//! Sessions share nothing but the registry used to route joins.

use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Context;
use plaza_shared::{
    codec::{decode_client, encode_server, ClientMsg, ServerMsg},
    config::PlazaConfig,
    entity::{JoinOptions, PlayerId},
    error::SyncError,
    net::{ConnectionId, FrameReader, FrameWriter, ReliableConn, ReliableListener},
};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, info, warn};

use crate::{
    outbox::Outbox,
    session::{SessionCoordinator, SessionLimits, SessionState},
};

/// Join attempts before giving up on a session that keeps disposing.
const JOIN_ATTEMPTS: usize = 3;

/// Events a session actor consumes.
enum SessionEvent {
    Join {
        conn: ConnectionId,
        options: JoinOptions,
        outbox: Arc<Outbox>,
        reply: oneshot::Sender<Result<PlayerId, SyncError>>,
    },
    Command {
        conn: ConnectionId,
        msg: ClientMsg,
    },
    Malformed {
        conn: ConnectionId,
        error: SyncError,
        /// True when the connection should be closed.
        reply: oneshot::Sender<bool>,
    },
    Leave {
        conn: ConnectionId,
    },
    Status {
        reply: oneshot::Sender<SessionStatus>,
    },
}

/// Point-in-time view of one session, for the console.
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub key: String,
    pub participants: usize,
    pub tick: u32,
}

#[derive(Clone)]
struct SessionHandle {
    generation: u64,
    tx: mpsc::Sender<SessionEvent>,
}

#[derive(Default)]
struct Registry {
    sessions: HashMap<String, SessionHandle>,
    next_generation: u64,
}

type SharedRegistry = Arc<Mutex<Registry>>;

fn lock(registry: &SharedRegistry) -> std::sync::MutexGuard<'_, Registry> {
    registry
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Game server.
pub struct GameServer {
    pub cfg: Arc<PlazaConfig>,
    listener: ReliableListener,
    registry: SharedRegistry,
}

impl GameServer {
    /// Binds the listener at `cfg.server_addr`.
    pub async fn bind(cfg: PlazaConfig) -> anyhow::Result<Self> {
        let addr: SocketAddr = cfg.server_addr.parse().context("parse server_addr")?;
        let listener = ReliableListener::bind(addr).await?;
        Ok(Self {
            cfg: Arc::new(cfg),
            listener,
            registry: SharedRegistry::default(),
        })
    }

    /// Returns the local address (after binding).
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle for inspecting sessions from outside the accept loop.
    pub fn control(&self) -> ServerControl {
        ServerControl {
            registry: self.registry.clone(),
        }
    }

    /// Accepts connections forever, one task per connection.
    pub async fn run(self) -> anyhow::Result<()> {
        loop {
            let (conn, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    continue;
                }
            };
            let cfg = self.cfg.clone();
            let registry = self.registry.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(conn, peer, cfg, registry).await {
                    debug!(%peer, error = %e, "Connection ended with error");
                }
            });
        }
    }
}

/// Cloneable view of the session registry.
#[derive(Clone)]
pub struct ServerControl {
    registry: SharedRegistry,
}

impl ServerControl {
    /// Status of every live session, ordered by key.
    pub async fn status(&self) -> Vec<SessionStatus> {
        let handles: Vec<SessionHandle> = lock(&self.registry).sessions.values().cloned().collect();
        let mut out = Vec::with_capacity(handles.len());
        for handle in handles {
            let (reply, rx) = oneshot::channel();
            if handle.tx.send(SessionEvent::Status { reply }).await.is_ok() {
                if let Ok(status) = rx.await {
                    out.push(status);
                }
            }
        }
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    pub fn session_count(&self) -> usize {
        lock(&self.registry).sessions.len()
    }
}

/// Returns the live session for `key`, starting one if needed.
fn session_for(key: &str, cfg: &Arc<PlazaConfig>, registry: &SharedRegistry) -> SessionHandle {
    let mut reg = lock(registry);
    if let Some(handle) = reg.sessions.get(key) {
        if !handle.tx.is_closed() {
            return handle.clone();
        }
    }
    reg.next_generation += 1;
    let generation = reg.next_generation;
    let (tx, rx) = mpsc::channel(256);
    let handle = SessionHandle { generation, tx };
    reg.sessions.insert(key.to_string(), handle.clone());

    let coordinator = SessionCoordinator::new(key, SessionLimits::from_config(cfg));
    tokio::spawn(run_session(
        coordinator,
        rx,
        cfg.tick_interval(),
        registry.clone(),
        generation,
    ));
    handle
}

async fn run_session(
    mut session: SessionCoordinator,
    mut rx: mpsc::Receiver<SessionEvent>,
    tick_interval: Duration,
    registry: SharedRegistry,
    generation: u64,
) {
    let mut ticker = tokio::time::interval(tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };
                handle_event(&mut session, event);
            }
            _ = ticker.tick() => {
                session.tick();
            }
        }
        if session.state() == SessionState::Disposed {
            break;
        }
    }

    {
        let mut reg = lock(&registry);
        if reg
            .sessions
            .get(session.key())
            .is_some_and(|h| h.generation == generation)
        {
            reg.sessions.remove(session.key());
        }
    }
    session.dispose();
    debug!(session = %session.key(), "Session task stopped");
}

fn handle_event(session: &mut SessionCoordinator, event: SessionEvent) {
    match event {
        SessionEvent::Join {
            conn,
            options,
            outbox,
            reply,
        } => {
            let _ = reply.send(session.on_join(conn, &options, outbox));
        }
        SessionEvent::Command { conn, msg } => {
            // Rejections are logged by the coordinator.
            let _ = session.on_command(conn, msg);
        }
        SessionEvent::Malformed { conn, error, reply } => {
            let close = session.on_malformed(conn, &error);
            let _ = reply.send(close);
        }
        SessionEvent::Leave { conn } => {
            session.on_leave(conn);
        }
        SessionEvent::Status { reply } => {
            let _ = reply.send(SessionStatus {
                key: session.key().to_string(),
                participants: session.participant_count(),
                tick: session.current_tick(),
            });
        }
    }
}

async fn handle_connection(
    conn: ReliableConn,
    peer: SocketAddr,
    cfg: Arc<PlazaConfig>,
    registry: SharedRegistry,
) -> anyhow::Result<()> {
    let conn_id = ConnectionId::new_unique();
    let (mut reader, mut writer) = conn.split();
    debug!(%peer, conn = %conn_id, "Connection accepted");

    let Some((key, options)) = await_join(&mut reader, &cfg, conn_id).await? else {
        return Ok(());
    };

    let outbox = Arc::new(Outbox::new(cfg.send_queue_capacity));
    let joined = join_session(&key, options, conn_id, outbox.clone(), &cfg, &registry).await;
    let (session, id) = match joined {
        Ok(joined) => joined,
        Err(e) => {
            info!(%peer, session = %key, error = %e, "Join rejected");
            let reason = e.to_string();
            writer
                .send(&encode_server(&ServerMsg::Rejected { reason }))
                .await?;
            writer.shutdown().await?;
            return Ok(());
        }
    };
    debug!(%peer, conn = %conn_id, player = %id, session = %key, "Joined");

    let mut writer_task = tokio::spawn(write_loop(writer, outbox.clone(), conn_id));
    let writer_done = read_loop(
        &mut reader,
        &mut writer_task,
        &session,
        conn_id,
        cfg.liveness_timeout(),
    )
    .await;

    // Exactly one leave per joined connection.
    let _ = session.tx.send(SessionEvent::Leave { conn: conn_id }).await;
    outbox.close();
    if !writer_done {
        let _ = writer_task.await;
    }
    Ok(())
}

/// Reads until the first `join`. Returns `None` if the peer went away first.
async fn await_join(
    reader: &mut FrameReader,
    cfg: &PlazaConfig,
    conn: ConnectionId,
) -> anyhow::Result<Option<(String, JoinOptions)>> {
    let mut malformed = 0u32;
    loop {
        let frame = match tokio::time::timeout(cfg.liveness_timeout(), reader.recv()).await {
            Err(_) => {
                debug!(%conn, "No join before liveness timeout");
                return Ok(None);
            }
            Ok(frame) => frame?,
        };
        let Some(frame) = frame else {
            return Ok(None);
        };
        match decode_client(&frame) {
            Ok(ClientMsg::Join { session, options }) => return Ok(Some((session, options))),
            Ok(ClientMsg::Leave) => return Ok(None),
            Ok(other) => {
                let e = SyncError::UnauthorizedMutation(conn);
                debug!(%conn, kind = other.kind(), error = %e, "Command before join dropped");
            }
            Err(e) => {
                malformed += 1;
                warn!(%conn, count = malformed, error = %e, "Malformed frame before join");
                if malformed > cfg.malformed_threshold {
                    return Ok(None);
                }
            }
        }
    }
}

async fn join_session(
    key: &str,
    options: JoinOptions,
    conn: ConnectionId,
    outbox: Arc<Outbox>,
    cfg: &Arc<PlazaConfig>,
    registry: &SharedRegistry,
) -> Result<(SessionHandle, PlayerId), SyncError> {
    for _ in 0..JOIN_ATTEMPTS {
        let session = session_for(key, cfg, registry);
        let (reply, rx) = oneshot::channel();
        let event = SessionEvent::Join {
            conn,
            options: options.clone(),
            outbox: outbox.clone(),
            reply,
        };
        if session.tx.send(event).await.is_err() {
            continue;
        }
        match rx.await {
            Ok(Ok(id)) => return Ok((session, id)),
            Ok(Err(SyncError::Disposed)) | Err(_) => continue,
            Ok(Err(e)) => return Err(e),
        }
    }
    Err(SyncError::Disposed)
}

/// Returns true if the writer task finished (and was joined) inside the loop.
async fn read_loop(
    reader: &mut FrameReader,
    writer_task: &mut JoinHandle<()>,
    session: &SessionHandle,
    conn: ConnectionId,
    liveness: Duration,
) -> bool {
    loop {
        let frame = tokio::select! {
            frame = tokio::time::timeout(liveness, reader.recv()) => frame,
            _ = &mut *writer_task => {
                debug!(%conn, "Writer stopped; closing connection");
                return true;
            }
        };
        let frame = match frame {
            Err(_) => {
                info!(%conn, "Liveness timeout");
                return false;
            }
            Ok(Ok(Some(frame))) => frame,
            Ok(Ok(None)) => return false,
            Ok(Err(e)) => {
                debug!(%conn, error = %e, "Read failed");
                return false;
            }
        };

        match decode_client(&frame) {
            Ok(ClientMsg::Leave) => return false,
            Ok(msg) => {
                if session
                    .tx
                    .send(SessionEvent::Command { conn, msg })
                    .await
                    .is_err()
                {
                    return false;
                }
            }
            Err(error) => {
                let (reply, rx) = oneshot::channel();
                let sent = session
                    .tx
                    .send(SessionEvent::Malformed { conn, error, reply })
                    .await;
                if sent.is_err() || rx.await.unwrap_or(true) {
                    warn!(%conn, "Closing connection after repeated malformed frames");
                    return false;
                }
            }
        }
    }
}

async fn write_loop(mut writer: FrameWriter, outbox: Arc<Outbox>, conn: ConnectionId) {
    while let Some(msg) = outbox.pop().await {
        if let Err(e) = writer.send(&encode_server(&msg)).await {
            debug!(%conn, error = %e, "Write failed");
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// Helper for tests: bind to an ephemeral port.
pub async fn bind_ephemeral(tick_hz: u32) -> anyhow::Result<(GameServer, PlazaConfig)> {
    let cfg = PlazaConfig {
        server_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0).to_string(),
        tick_hz,
        ..Default::default()
    };
    bind_ephemeral_with(cfg).await
}

/// Like `bind_ephemeral`, keeping every other field of `cfg`.
pub async fn bind_ephemeral_with(mut cfg: PlazaConfig) -> anyhow::Result<(GameServer, PlazaConfig)> {
    cfg.server_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0).to_string();
    let server = GameServer::bind(cfg.clone()).await?;
    cfg.server_addr = server.local_addr()?.to_string();
    Ok((server, cfg))
}
