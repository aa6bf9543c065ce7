//! Wire codec.
//!
//! Frame layout (all integers big-endian):
//!
//! ```text
//! envelope := kind_len:u16 kind:utf8 payload_len:u32 payload
//! payload  := field*
//! field    := tag:u8 len:u16 value
//! ```
//!
//! Floats are `f32`, strings are raw UTF-8 (the field length prefixes them),
//! nested records are a `payload` inside a field. Readers skip tags they do not
//! know, so new fields can be added without breaking older peers. Anything
//! truncated, non-UTF-8 or missing a required field is `MalformedMessage`.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{
    chat::ChatMessage,
    entity::{ActivityState, AppearanceVariant, Entity, JoinOptions, PlayerId},
    error::SyncError,
    math::Vec3,
    patch::{ChangeRecord, EntityPatch, Patch},
};

pub mod kind {
    //! Message kinds on the wire.

    pub const JOIN: &str = "join";
    pub const MOVE: &str = "move";
    pub const ROTATE: &str = "rotate";
    pub const CHANGE_STATE: &str = "changeState";
    pub const CHAT: &str = "chat";
    pub const REQUEST_SNAPSHOT: &str = "requestSnapshot";
    pub const LEAVE: &str = "leave";
    pub const PING: &str = "ping";

    pub const WELCOME: &str = "welcome";
    pub const REJECTED: &str = "rejected";
    pub const SNAPSHOT: &str = "snapshot";
    pub const PATCH: &str = "patch";
    pub const ADD: &str = "add";
    pub const REMOVE: &str = "remove";
}

type Result<T> = std::result::Result<T, SyncError>;

/// Client -> server messages.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMsg {
    Join {
        session: String,
        options: JoinOptions,
    },
    Move {
        position: Vec3,
        rotation_y: f32,
    },
    Rotate {
        rotation_y: f32,
    },
    /// Raw state name; validated by the session, not the codec.
    ChangeState {
        state: String,
    },
    Chat {
        text: String,
    },
    RequestSnapshot,
    Leave,
    /// Keepalive; carries nothing.
    Ping,
}

impl ClientMsg {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMsg::Join { .. } => kind::JOIN,
            ClientMsg::Move { .. } => kind::MOVE,
            ClientMsg::Rotate { .. } => kind::ROTATE,
            ClientMsg::ChangeState { .. } => kind::CHANGE_STATE,
            ClientMsg::Chat { .. } => kind::CHAT,
            ClientMsg::RequestSnapshot => kind::REQUEST_SNAPSHOT,
            ClientMsg::Leave => kind::LEAVE,
            ClientMsg::Ping => kind::PING,
        }
    }
}

/// Server -> client messages.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMsg {
    Welcome { id: PlayerId },
    Rejected { reason: String },
    Snapshot(Vec<Entity>),
    Patch(Patch),
    Add(Entity),
    Remove(PlayerId),
    Chat(ChatMessage),
}

impl ServerMsg {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMsg::Welcome { .. } => kind::WELCOME,
            ServerMsg::Rejected { .. } => kind::REJECTED,
            ServerMsg::Snapshot(_) => kind::SNAPSHOT,
            ServerMsg::Patch(_) => kind::PATCH,
            ServerMsg::Add(_) => kind::ADD,
            ServerMsg::Remove(_) => kind::REMOVE,
            ServerMsg::Chat(_) => kind::CHAT,
        }
    }
}

/// Decoded outer frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub kind: String,
    pub payload: Bytes,
}

pub fn encode_envelope(kind: &str, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(2 + kind.len() + 4 + payload.len());
    buf.put_u16(kind.len() as u16);
    buf.extend_from_slice(kind.as_bytes());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(payload);
    buf.freeze()
}

pub fn decode_envelope(mut b: &[u8]) -> Result<Envelope> {
    if b.remaining() < 2 {
        return Err(SyncError::malformed("truncated kind length"));
    }
    let kind_len = b.get_u16() as usize;
    if b.remaining() < kind_len {
        return Err(SyncError::malformed("truncated kind"));
    }
    let kind = std::str::from_utf8(&b[..kind_len])
        .map_err(|_| SyncError::malformed("kind is not utf-8"))?
        .to_string();
    b.advance(kind_len);
    if b.remaining() < 4 {
        return Err(SyncError::malformed("truncated payload length"));
    }
    let payload_len = b.get_u32() as usize;
    if b.remaining() < payload_len {
        return Err(SyncError::malformed("truncated payload"));
    }
    Ok(Envelope {
        kind,
        payload: Bytes::copy_from_slice(&b[..payload_len]),
    })
}

// ─── Field writer/reader ───

#[derive(Default)]
struct FieldWriter {
    buf: BytesMut,
}

impl FieldWriter {
    fn raw(&mut self, tag: u8, value: &[u8]) {
        self.buf.put_u8(tag);
        self.buf.put_u16(value.len() as u16);
        self.buf.extend_from_slice(value);
    }

    fn f32(&mut self, tag: u8, v: f32) {
        self.raw(tag, &v.to_be_bytes());
    }

    fn u32(&mut self, tag: u8, v: u32) {
        self.raw(tag, &v.to_be_bytes());
    }

    /// Strings longer than a field can hold are cut at a char boundary.
    fn str(&mut self, tag: u8, s: &str) {
        let mut end = s.len().min(u16::MAX as usize);
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        self.raw(tag, &s.as_bytes()[..end]);
    }

    fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

struct FieldReader<'a> {
    buf: &'a [u8],
}

impl<'a> FieldReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn next_field(&mut self) -> Result<Option<(u8, &'a [u8])>> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        if self.buf.len() < 3 {
            return Err(SyncError::malformed("truncated field header"));
        }
        let tag = self.buf[0];
        let len = u16::from_be_bytes([self.buf[1], self.buf[2]]) as usize;
        let rest = &self.buf[3..];
        if rest.len() < len {
            return Err(SyncError::malformed(format!("truncated field {tag}")));
        }
        let (value, tail) = rest.split_at(len);
        self.buf = tail;
        Ok(Some((tag, value)))
    }
}

fn read_f32(tag: u8, v: &[u8]) -> Result<f32> {
    let bytes: [u8; 4] = v
        .try_into()
        .map_err(|_| SyncError::malformed(format!("field {tag} is not f32")))?;
    Ok(f32::from_be_bytes(bytes))
}

fn read_u32(tag: u8, v: &[u8]) -> Result<u32> {
    let bytes: [u8; 4] = v
        .try_into()
        .map_err(|_| SyncError::malformed(format!("field {tag} is not u32")))?;
    Ok(u32::from_be_bytes(bytes))
}

fn read_str(tag: u8, v: &[u8]) -> Result<String> {
    std::str::from_utf8(v)
        .map(str::to_string)
        .map_err(|_| SyncError::malformed(format!("field {tag} is not utf-8")))
}

fn required<T>(value: Option<T>, what: &str) -> Result<T> {
    value.ok_or_else(|| SyncError::malformed(format!("missing {what}")))
}

fn read_activity(tag: u8, v: &[u8]) -> Result<ActivityState> {
    let s = read_str(tag, v)?;
    ActivityState::parse(&s).ok_or_else(|| SyncError::malformed(format!("bad activity {s:?}")))
}

// ─── Records ───

mod tag {
    pub const ID: u8 = 1;
    pub const NAME: u8 = 2;
    pub const COLOR: u8 = 3;
    pub const APPEARANCE: u8 = 4;
    pub const ACTIVITY: u8 = 5;
    pub const X: u8 = 6;
    pub const Y: u8 = 7;
    pub const Z: u8 = 8;
    pub const ROTATION: u8 = 9;
}

fn write_entity(e: &Entity) -> Bytes {
    let mut w = FieldWriter::default();
    w.str(tag::ID, e.id.as_str());
    w.str(tag::NAME, &e.display_name);
    w.str(tag::COLOR, &e.color);
    w.str(tag::APPEARANCE, e.appearance.as_str());
    w.str(tag::ACTIVITY, e.activity.as_str());
    w.f32(tag::X, e.position.x);
    w.f32(tag::Y, e.position.y);
    w.f32(tag::Z, e.position.z);
    w.f32(tag::ROTATION, e.rotation_y);
    w.finish()
}

fn read_entity(b: &[u8]) -> Result<Entity> {
    let mut r = FieldReader::new(b);
    let (mut id, mut name, mut color, mut appearance, mut activity) = (None, None, None, None, None);
    let (mut x, mut y, mut z, mut rot) = (None, None, None, None);
    while let Some((t, v)) = r.next_field()? {
        match t {
            tag::ID => id = Some(PlayerId(read_str(t, v)?)),
            tag::NAME => name = Some(read_str(t, v)?),
            tag::COLOR => color = Some(read_str(t, v)?),
            tag::APPEARANCE => appearance = Some(AppearanceVariant::from_name(&read_str(t, v)?)),
            tag::ACTIVITY => activity = Some(read_activity(t, v)?),
            tag::X => x = Some(read_f32(t, v)?),
            tag::Y => y = Some(read_f32(t, v)?),
            tag::Z => z = Some(read_f32(t, v)?),
            tag::ROTATION => rot = Some(read_f32(t, v)?),
            _ => {}
        }
    }
    Ok(Entity {
        id: required(id, "entity id")?,
        display_name: required(name, "display name")?,
        color: required(color, "color")?,
        appearance: appearance.unwrap_or_default(),
        activity: activity.unwrap_or_default(),
        position: Vec3::new(
            required(x, "x")?,
            required(y, "y")?,
            required(z, "z")?,
        ),
        rotation_y: required(rot, "rotation")?,
    })
}

fn write_entity_patch(p: &EntityPatch) -> Bytes {
    let mut w = FieldWriter::default();
    w.str(tag::ID, p.id.as_str());
    if let Some(activity) = p.activity {
        w.str(tag::ACTIVITY, activity.as_str());
    }
    if let Some(pos) = p.position {
        w.f32(tag::X, pos.x);
        w.f32(tag::Y, pos.y);
        w.f32(tag::Z, pos.z);
    }
    if let Some(rot) = p.rotation_y {
        w.f32(tag::ROTATION, rot);
    }
    w.finish()
}

fn read_entity_patch(b: &[u8]) -> Result<EntityPatch> {
    let mut r = FieldReader::new(b);
    let mut patch = EntityPatch::default();
    let mut id = None;
    let (mut x, mut y, mut z) = (None, None, None);
    while let Some((t, v)) = r.next_field()? {
        match t {
            tag::ID => id = Some(PlayerId(read_str(t, v)?)),
            tag::ACTIVITY => patch.activity = Some(read_activity(t, v)?),
            tag::X => x = Some(read_f32(t, v)?),
            tag::Y => y = Some(read_f32(t, v)?),
            tag::Z => z = Some(read_f32(t, v)?),
            tag::ROTATION => patch.rotation_y = Some(read_f32(t, v)?),
            _ => {}
        }
    }
    patch.id = required(id, "patch id")?;
    patch.position = match (x, y, z) {
        (Some(x), Some(y), Some(z)) => Some(Vec3::new(x, y, z)),
        (None, None, None) => None,
        _ => return Err(SyncError::malformed("partial position")),
    };
    Ok(patch)
}

// ─── Server messages ───

const LIST_ITEM: u8 = 1;
const PATCH_TICK: u8 = 1;
const PATCH_CHANGED: u8 = 2;
const PATCH_REMOVED: u8 = 3;

/// Full state, sent once at join (and on resync).
pub fn encode_snapshot(entities: &[Entity]) -> Bytes {
    let mut w = FieldWriter::default();
    write_entity_list(&mut w, entities);
    encode_envelope(kind::SNAPSHOT, &w.finish())
}

fn write_entity_list(w: &mut FieldWriter, entities: &[Entity]) {
    for e in entities {
        w.raw(LIST_ITEM, &write_entity(e));
    }
}

/// Per-tick patch built from a drained change record.
pub fn encode_patch(tick: u32, record: &ChangeRecord) -> Bytes {
    encode_server(&ServerMsg::Patch(Patch::from_record(tick, record)))
}

fn server_payload(msg: &ServerMsg) -> Bytes {
    let mut w = FieldWriter::default();
    match msg {
        ServerMsg::Welcome { id } => w.str(1, id.as_str()),
        ServerMsg::Rejected { reason } => w.str(1, reason),
        ServerMsg::Snapshot(entities) => write_entity_list(&mut w, entities),
        ServerMsg::Patch(patch) => {
            w.u32(PATCH_TICK, patch.tick);
            for p in &patch.changed {
                w.raw(PATCH_CHANGED, &write_entity_patch(p));
            }
            for id in &patch.removed {
                w.str(PATCH_REMOVED, id.as_str());
            }
        }
        ServerMsg::Add(e) => return write_entity(e),
        ServerMsg::Remove(id) => w.str(1, id.as_str()),
        ServerMsg::Chat(chat) => {
            w.str(1, chat.sender.as_str());
            w.str(2, &chat.sender_name);
            w.str(3, &chat.text);
        }
    }
    w.finish()
}

pub fn encode_server(msg: &ServerMsg) -> Bytes {
    encode_envelope(msg.kind(), &server_payload(msg))
}

fn single_str(payload: &[u8], want: u8, what: &str) -> Result<String> {
    let mut r = FieldReader::new(payload);
    let mut out = None;
    while let Some((t, v)) = r.next_field()? {
        if t == want {
            out = Some(read_str(t, v)?);
        }
    }
    required(out, what)
}

pub fn decode_server(bytes: &[u8]) -> Result<ServerMsg> {
    let env = decode_envelope(bytes)?;
    let payload = &env.payload[..];
    match env.kind.as_str() {
        kind::WELCOME => Ok(ServerMsg::Welcome {
            id: PlayerId(single_str(payload, 1, "welcome id")?),
        }),
        kind::REJECTED => Ok(ServerMsg::Rejected {
            reason: single_str(payload, 1, "reason")?,
        }),
        kind::SNAPSHOT => {
            let mut r = FieldReader::new(payload);
            let mut entities = Vec::new();
            while let Some((t, v)) = r.next_field()? {
                if t == LIST_ITEM {
                    entities.push(read_entity(v)?);
                }
            }
            Ok(ServerMsg::Snapshot(entities))
        }
        kind::PATCH => {
            let mut r = FieldReader::new(payload);
            let mut patch = Patch::default();
            let mut tick = None;
            while let Some((t, v)) = r.next_field()? {
                match t {
                    PATCH_TICK => tick = Some(read_u32(t, v)?),
                    PATCH_CHANGED => patch.changed.push(read_entity_patch(v)?),
                    PATCH_REMOVED => patch.removed.push(PlayerId(read_str(t, v)?)),
                    _ => {}
                }
            }
            patch.tick = required(tick, "tick")?;
            Ok(ServerMsg::Patch(patch))
        }
        kind::ADD => Ok(ServerMsg::Add(read_entity(payload)?)),
        kind::REMOVE => Ok(ServerMsg::Remove(PlayerId(single_str(
            payload,
            1,
            "removed id",
        )?))),
        kind::CHAT => {
            let mut r = FieldReader::new(payload);
            let (mut sender, mut name, mut text) = (None, None, None);
            while let Some((t, v)) = r.next_field()? {
                match t {
                    1 => sender = Some(PlayerId(read_str(t, v)?)),
                    2 => name = Some(read_str(t, v)?),
                    3 => text = Some(read_str(t, v)?),
                    _ => {}
                }
            }
            Ok(ServerMsg::Chat(ChatMessage {
                sender: required(sender, "chat sender")?,
                sender_name: required(name, "chat name")?,
                text: required(text, "chat text")?,
            }))
        }
        other => Err(SyncError::malformed(format!("unknown server kind {other:?}"))),
    }
}

// ─── Client messages ───

pub fn encode_client(msg: &ClientMsg) -> Bytes {
    let mut w = FieldWriter::default();
    match msg {
        ClientMsg::Join { session, options } => {
            w.str(1, session);
            w.str(2, &options.display_name);
            w.str(3, &options.color);
            w.str(4, &options.appearance);
        }
        ClientMsg::Move {
            position,
            rotation_y,
        } => {
            w.f32(1, position.x);
            w.f32(2, position.y);
            w.f32(3, position.z);
            w.f32(4, *rotation_y);
        }
        ClientMsg::Rotate { rotation_y } => w.f32(1, *rotation_y),
        ClientMsg::ChangeState { state } => w.str(1, state),
        ClientMsg::Chat { text } => w.str(1, text),
        ClientMsg::RequestSnapshot | ClientMsg::Leave | ClientMsg::Ping => {}
    }
    encode_envelope(msg.kind(), &w.finish())
}

pub fn decode_client(bytes: &[u8]) -> Result<ClientMsg> {
    let env = decode_envelope(bytes)?;
    let mut r = FieldReader::new(&env.payload);
    match env.kind.as_str() {
        kind::JOIN => {
            let mut session = None;
            let mut options = JoinOptions::default();
            while let Some((t, v)) = r.next_field()? {
                match t {
                    1 => session = Some(read_str(t, v)?),
                    2 => options.display_name = read_str(t, v)?,
                    3 => options.color = read_str(t, v)?,
                    4 => options.appearance = read_str(t, v)?,
                    _ => {}
                }
            }
            Ok(ClientMsg::Join {
                session: required(session, "session key")?,
                options,
            })
        }
        kind::MOVE => {
            let mut f = [None; 4];
            while let Some((t, v)) = r.next_field()? {
                if (1..=4).contains(&t) {
                    f[(t - 1) as usize] = Some(read_f32(t, v)?);
                }
            }
            Ok(ClientMsg::Move {
                position: Vec3::new(
                    required(f[0], "x")?,
                    required(f[1], "y")?,
                    required(f[2], "z")?,
                ),
                rotation_y: required(f[3], "rotation")?,
            })
        }
        kind::ROTATE => {
            let mut rot = None;
            while let Some((t, v)) = r.next_field()? {
                if t == 1 {
                    rot = Some(read_f32(t, v)?);
                }
            }
            Ok(ClientMsg::Rotate {
                rotation_y: required(rot, "rotation")?,
            })
        }
        kind::CHANGE_STATE => Ok(ClientMsg::ChangeState {
            state: single_str(&env.payload, 1, "state")?,
        }),
        kind::CHAT => Ok(ClientMsg::Chat {
            text: single_str(&env.payload, 1, "text")?,
        }),
        kind::REQUEST_SNAPSHOT => Ok(ClientMsg::RequestSnapshot),
        kind::LEAVE => Ok(ClientMsg::Leave),
        kind::PING => Ok(ClientMsg::Ping),
        other => Err(SyncError::malformed(format!("unknown client kind {other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(id: &str) -> Entity {
        Entity::spawn(
            PlayerId::from(id),
            &JoinOptions::new("Ann", "#ff0000", "spiderman"),
            Vec3::new(1.0, 0.0, -2.0),
        )
    }

    #[test]
    fn snapshot_roundtrip_preserves_entities() {
        let entities = vec![entity("p1"), entity("p2")];
        let msg = decode_server(&encode_snapshot(&entities)).unwrap();
        assert_eq!(msg, ServerMsg::Snapshot(entities));
    }

    #[test]
    fn patch_carries_only_changed_fields() {
        let record = ChangeRecord {
            added: vec![],
            removed: vec![PlayerId::from("p9")],
            changed: vec![EntityPatch {
                position: Some(Vec3::new(1.0, 0.0, 2.0)),
                rotation_y: Some(0.5),
                ..EntityPatch::new(PlayerId::from("p1"))
            }],
        };
        let ServerMsg::Patch(patch) = decode_server(&encode_patch(7, &record)).unwrap() else {
            panic!("expected patch");
        };
        assert_eq!(patch.tick, 7);
        assert_eq!(patch.changed, record.changed);
        assert_eq!(patch.changed[0].activity, None);
        assert_eq!(patch.removed, vec![PlayerId::from("p9")]);
    }

    #[test]
    fn unknown_fields_are_skipped() {
        let mut w = FieldWriter::default();
        w.f32(1, 0.5);
        w.str(42, "from the future");
        let bytes = encode_envelope(kind::ROTATE, &w.finish());
        assert_eq!(
            decode_client(&bytes).unwrap(),
            ClientMsg::Rotate { rotation_y: 0.5 }
        );
    }

    #[test]
    fn truncated_and_unknown_messages_are_malformed() {
        let bytes = encode_client(&ClientMsg::Move {
            position: Vec3::new(1.0, 2.0, 3.0),
            rotation_y: 0.0,
        });
        let cut = &bytes[..bytes.len() - 2];
        assert!(matches!(decode_client(cut), Err(SyncError::MalformedMessage(_))));

        let bogus = encode_envelope("teleport", &[]);
        assert!(matches!(decode_client(&bogus), Err(SyncError::MalformedMessage(_))));

        let missing = encode_envelope(kind::MOVE, &[]);
        assert!(matches!(decode_client(&missing), Err(SyncError::MalformedMessage(_))));
    }

    #[test]
    fn change_state_keeps_raw_name() {
        let msg = ClientMsg::ChangeState {
            state: "Flying".to_string(),
        };
        assert_eq!(decode_client(&encode_client(&msg)).unwrap(), msg);
    }

    #[test]
    fn ping_has_empty_payload() {
        let bytes = encode_client(&ClientMsg::Ping);
        assert_eq!(decode_client(&bytes).unwrap(), ClientMsg::Ping);
    }
}
