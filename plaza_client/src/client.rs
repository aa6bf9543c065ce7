//! Client implementation.
//!
//! The client maintains:
//! - One ordered stream to the server, split into a background receive task
//!   and a write half owned by the frame loop
//! - The synchronized store (server view of every entity)
//! - The local pipeline (optimistic own motion/activity)
//! - The remote reconciler (smoothed poses of everyone else)
//! - A chat log
//!
//! Received messages are applied only at the start of `frame`, so pipeline
//! and reconciler always see one stable state per frame.

use std::{
    net::SocketAddr,
    time::{Duration, Instant},
};

use anyhow::Context;
use chrono::{DateTime, Utc};
use plaza_shared::{
    codec::{decode_server, encode_client, ClientMsg, ServerMsg},
    config::PlazaConfig,
    entity::{JoinOptions, PlayerId},
    error::SyncError,
    net::{FrameReader, FrameWriter, ReliableConn},
    physics::{FlatGround, GroundProbe},
};
use tokio::{
    sync::mpsc::{self, error::TryRecvError},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    input::InputState,
    interp::RemoteReconciler,
    pipeline::{LocalPipeline, PipelineSettings},
    store::{StoreEvent, SyncedStore},
};

/// Chat lines kept in the log.
const CHAT_LOG_LEN: usize = 100;

/// Client connection state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientState {
    /// Joined; frames run normally.
    Connected,
    /// Connection gone. `frame` sends nothing.
    Disconnected,
}

/// One received chat line.
#[derive(Debug, Clone)]
pub struct ChatLine {
    pub received_at: DateTime<Utc>,
    pub sender: PlayerId,
    pub sender_name: String,
    pub text: String,
}

/// High-level game client.
pub struct GameClient {
    pub id: PlayerId,
    pub state: ClientState,
    pub store: SyncedStore,
    pub reconciler: RemoteReconciler,
    pub pipeline: LocalPipeline,
    chat_log: Vec<ChatLine>,
    chat_unread: usize,
    /// Store notifications drained during the last frame.
    frame_events: Vec<StoreEvent>,

    ground: Box<dyn GroundProbe>,
    writer: FrameWriter,
    inbound: mpsc::Receiver<ServerMsg>,
    recv_task: JoinHandle<()>,
    spawned: bool,
    awaiting_snapshot: bool,
    last_send: Instant,
    keepalive: Duration,
}

impl GameClient {
    /// Connects and joins `cfg.session_key`.
    ///
    /// A full session surfaces as `SyncError::CapacityExceeded` inside the
    /// returned error.
    pub async fn connect(cfg: &PlazaConfig) -> anyhow::Result<Self> {
        let server_addr: SocketAddr = cfg.server_addr.parse().context("parse server_addr")?;
        info!(server = %server_addr, session = %cfg.session_key, "Connecting to server");

        let conn = ReliableConn::connect(server_addr).await?;
        let (mut reader, mut writer) = conn.split();

        let join = ClientMsg::Join {
            session: cfg.session_key.clone(),
            options: JoinOptions::new(&cfg.display_name, &cfg.color, &cfg.appearance),
        };
        writer.send(&encode_client(&join)).await?;

        let first = tokio::time::timeout(cfg.liveness_timeout(), reader.recv())
            .await
            .context("timed out waiting for welcome")??
            .context("server closed the connection during join")?;
        let id = match decode_server(&first)? {
            ServerMsg::Welcome { id } => id,
            ServerMsg::Rejected { reason } => {
                info!(reason = %reason, "Join rejected");
                if reason == SyncError::CapacityExceeded.to_string() {
                    return Err(SyncError::CapacityExceeded.into());
                }
                anyhow::bail!("join rejected: {reason}");
            }
            other => anyhow::bail!("expected welcome, got {}", other.kind()),
        };
        info!(player = %id, "Joined session");

        let (tx, inbound) = mpsc::channel(1024);
        let recv_task = tokio::spawn(receive_loop(reader, tx));

        let mut store = SyncedStore::new();
        store.set_local_id(id.clone());

        Ok(Self {
            id,
            state: ClientState::Connected,
            store,
            reconciler: RemoteReconciler::new(cfg.interpolation_fraction),
            pipeline: LocalPipeline::new(PipelineSettings::from_config(cfg)),
            chat_log: Vec::new(),
            chat_unread: 0,
            frame_events: Vec::new(),
            ground: Box::new(FlatGround::default()),
            writer,
            inbound,
            recv_task,
            spawned: false,
            awaiting_snapshot: false,
            last_send: Instant::now(),
            keepalive: cfg.liveness_timeout() / 3,
        })
    }

    /// Replaces the grounding collaborator.
    pub fn set_ground(&mut self, ground: Box<dyn GroundProbe>) {
        self.ground = ground;
    }

    /// True once the local entity has arrived in a snapshot.
    pub fn is_spawned(&self) -> bool {
        self.spawned
    }

    pub fn chat_log(&self) -> &[ChatLine] {
        &self.chat_log
    }

    /// What changed in the store during the last frame.
    pub fn frame_events(&self) -> &[StoreEvent] {
        &self.frame_events
    }

    /// Lines received since the previous call.
    pub fn take_unread_chat(&mut self) -> &[ChatLine] {
        let start = self.chat_log.len() - self.chat_unread;
        self.chat_unread = 0;
        &self.chat_log[start..]
    }

    /// Runs one client frame: apply received state, then local input, then
    /// smoothing, then send.
    pub async fn frame(&mut self, input: &InputState, dt: f32) -> anyhow::Result<()> {
        if self.state == ClientState::Disconnected {
            return Ok(());
        }

        let mut outgoing = Vec::new();
        loop {
            match self.inbound.try_recv() {
                Ok(msg) => {
                    if let Some(cmd) = self.apply(msg) {
                        outgoing.push(cmd);
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    info!(player = %self.id, "Disconnected from server");
                    self.state = ClientState::Disconnected;
                    return Ok(());
                }
            }
        }
        if self.state == ClientState::Disconnected {
            return Ok(());
        }

        if self.spawned {
            let commands = self
                .pipeline
                .step(input, dt, self.ground.as_ref(), &mut self.store);
            outgoing.extend(commands);
        }

        self.frame_events = self.store.drain_events();
        self.reconciler
            .apply_events(&self.store, &self.frame_events, Some(&self.id));
        self.reconciler.advance();

        if outgoing.is_empty() && self.last_send.elapsed() >= self.keepalive {
            outgoing.push(ClientMsg::Ping);
        }
        for cmd in outgoing {
            self.send(&cmd).await?;
        }
        Ok(())
    }

    /// Applies one server message; may return a command to send back.
    fn apply(&mut self, msg: ServerMsg) -> Option<ClientMsg> {
        match msg {
            ServerMsg::Snapshot(entities) => {
                self.store.apply_snapshot(entities);
                self.awaiting_snapshot = false;
                if !self.spawned {
                    if let Some(me) = self.store.get(&self.id) {
                        self.pipeline.reset(me.position, me.rotation_y, me.activity);
                        self.spawned = true;
                        debug!(player = %self.id, x = me.position.x, z = me.position.z, "Spawned");
                    }
                }
            }
            ServerMsg::Patch(patch) => {
                if let Err(e) = self.store.apply_patch(&patch) {
                    warn!(player = %self.id, error = %e, "Requesting fresh snapshot");
                    if !self.awaiting_snapshot {
                        self.awaiting_snapshot = true;
                        return Some(ClientMsg::RequestSnapshot);
                    }
                }
            }
            ServerMsg::Add(entity) => self.store.apply_add(entity),
            ServerMsg::Remove(id) => self.store.apply_remove(&id),
            ServerMsg::Chat(chat) => {
                info!(from = %chat.sender_name, text = %chat.text, "Chat");
                if self.chat_log.len() == CHAT_LOG_LEN {
                    self.chat_log.remove(0);
                }
                self.chat_log.push(ChatLine {
                    received_at: Utc::now(),
                    sender: chat.sender,
                    sender_name: chat.sender_name,
                    text: chat.text,
                });
                self.chat_unread = (self.chat_unread + 1).min(self.chat_log.len());
            }
            ServerMsg::Rejected { reason } => {
                warn!(reason = %reason, "Server rejected us");
                self.state = ClientState::Disconnected;
            }
            ServerMsg::Welcome { .. } => debug!("Duplicate welcome ignored"),
        }
        None
    }

    /// Sends a chat line.
    pub async fn say(&mut self, text: &str) -> anyhow::Result<()> {
        self.send(&ClientMsg::Chat {
            text: text.to_string(),
        })
        .await
    }

    /// Leaves the session and closes the connection.
    pub async fn leave(&mut self) -> anyhow::Result<()> {
        if self.state == ClientState::Disconnected {
            return Ok(());
        }
        self.send(&ClientMsg::Leave).await?;
        self.state = ClientState::Disconnected;
        self.writer.shutdown().await
    }

    async fn send(&mut self, cmd: &ClientMsg) -> anyhow::Result<()> {
        if self.state == ClientState::Disconnected {
            return Ok(());
        }
        if let Err(e) = self.writer.send(&encode_client(cmd)).await {
            warn!(player = %self.id, error = %e, "Send failed; disconnecting");
            self.state = ClientState::Disconnected;
            return Ok(());
        }
        self.last_send = Instant::now();
        Ok(())
    }
}

impl Drop for GameClient {
    fn drop(&mut self) {
        self.recv_task.abort();
    }
}

async fn receive_loop(mut reader: FrameReader, tx: mpsc::Sender<ServerMsg>) {
    loop {
        let frame = match reader.recv().await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "Receive failed");
                break;
            }
        };
        match decode_server(&frame) {
            Ok(msg) => {
                if tx.send(msg).await.is_err() {
                    break;
                }
            }
            Err(e) => warn!(error = %e, "Dropping malformed server message"),
        }
    }
}
