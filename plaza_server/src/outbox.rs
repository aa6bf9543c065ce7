//! Bounded per-connection send queue.
//!
//! The session pushes without ever awaiting; a writer task pops and writes to
//! the socket. When the queue is full, chat is dropped first and patches are
//! folded together (patches hold current values, so folding an older patch
//! into a newer one loses nothing). Data only ever moves later in the queue,
//! never ahead of an `add` it depends on. Control messages are never dropped;
//! if only those are queued the push reports `Overflow` and the connection is
//! considered dead.

use std::collections::VecDeque;
use std::sync::Mutex;

use plaza_shared::codec::ServerMsg;
use tokio::sync::Notify;

/// Result of a push into a full or non-full queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after discarding the oldest chat line.
    DroppedChat,
    /// Queued after folding two patches into one.
    Coalesced,
    /// The message itself was discarded (chat into a full queue).
    Discarded,
    /// Full of messages that cannot be dropped.
    Overflow,
}

#[derive(Default)]
struct Queue {
    items: VecDeque<ServerMsg>,
    closed: bool,
}

pub struct Outbox {
    queue: Mutex<Queue>,
    notify: Notify,
    capacity: usize,
}

impl Outbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(Queue::default()),
            notify: Notify::new(),
            capacity: capacity.max(2),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueues without blocking.
    pub fn push(&self, msg: ServerMsg) -> PushOutcome {
        let outcome = {
            let mut q = self.lock();
            if q.closed {
                return PushOutcome::Discarded;
            }
            if q.items.len() < self.capacity {
                q.items.push_back(msg);
                PushOutcome::Queued
            } else {
                make_room_and_push(&mut q.items, msg)
            }
        };
        if !matches!(outcome, PushOutcome::Discarded | PushOutcome::Overflow) {
            self.notify.notify_one();
        }
        outcome
    }

    /// Next message, waiting if empty. `None` once closed and drained.
    pub async fn pop(&self) -> Option<ServerMsg> {
        loop {
            {
                let mut q = self.lock();
                if let Some(msg) = q.items.pop_front() {
                    return Some(msg);
                }
                if q.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Non-blocking pop.
    pub fn try_pop(&self) -> Option<ServerMsg> {
        self.lock().items.pop_front()
    }

    /// Stops accepting messages; the writer drains what is queued and exits.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }
}

fn make_room_and_push(items: &mut VecDeque<ServerMsg>, msg: ServerMsg) -> PushOutcome {
    if let Some(i) = items.iter().position(|m| matches!(m, ServerMsg::Chat(_))) {
        items.remove(i);
        items.push_back(msg);
        return PushOutcome::DroppedChat;
    }

    if matches!(msg, ServerMsg::Chat(_)) {
        return PushOutcome::Discarded;
    }

    if let ServerMsg::Patch(newer) = msg {
        // Fold the newest queued patch forward into this one.
        let last = items.iter().rposition(|m| matches!(m, ServerMsg::Patch(_)));
        return match last.and_then(|i| items.remove(i)) {
            Some(ServerMsg::Patch(mut older)) => {
                older.coalesce(newer);
                items.push_back(ServerMsg::Patch(older));
                PushOutcome::Coalesced
            }
            _ => PushOutcome::Overflow,
        };
    }

    // Fold the oldest patch into the next one to free a slot.
    let mut patches = items
        .iter()
        .enumerate()
        .filter(|(_, m)| matches!(m, ServerMsg::Patch(_)))
        .map(|(i, _)| i);
    let (Some(first), Some(second)) = (patches.next(), patches.next()) else {
        return PushOutcome::Overflow;
    };
    let Some(ServerMsg::Patch(mut older)) = items.remove(first) else {
        return PushOutcome::Overflow;
    };
    if let Some(ServerMsg::Patch(newer)) = items.get_mut(second - 1) {
        older.coalesce(std::mem::take(newer));
        *newer = older;
    }
    items.push_back(msg);
    PushOutcome::Coalesced
}

#[cfg(test)]
mod tests {
    use super::*;
    use plaza_shared::{
        chat::ChatMessage,
        entity::PlayerId,
        math::Vec3,
        patch::{EntityPatch, Patch},
    };

    fn patch(tick: u32, id: &str, x: f32) -> ServerMsg {
        ServerMsg::Patch(Patch {
            tick,
            changed: vec![EntityPatch {
                position: Some(Vec3::new(x, 0.0, 0.0)),
                ..EntityPatch::new(PlayerId::from(id))
            }],
            removed: vec![],
        })
    }

    fn chat(text: &str) -> ServerMsg {
        ServerMsg::Chat(ChatMessage {
            sender: PlayerId::from("p1"),
            sender_name: "Ann".to_string(),
            text: text.to_string(),
        })
    }

    #[test]
    fn full_queue_coalesces_patches() {
        let outbox = Outbox::new(2);
        outbox.push(ServerMsg::Remove(PlayerId::from("gone")));
        outbox.push(patch(1, "a", 1.0));
        assert_eq!(outbox.push(patch(2, "a", 2.0)), PushOutcome::Coalesced);
        assert_eq!(outbox.len(), 2);

        assert!(matches!(outbox.try_pop(), Some(ServerMsg::Remove(_))));
        let Some(ServerMsg::Patch(p)) = outbox.try_pop() else {
            panic!("expected patch");
        };
        assert_eq!(p.tick, 2);
        assert_eq!(p.changed[0].position, Some(Vec3::new(2.0, 0.0, 0.0)));
    }

    #[test]
    fn chat_is_dropped_before_anything_else() {
        let outbox = Outbox::new(2);
        outbox.push(chat("one"));
        outbox.push(patch(1, "a", 1.0));
        assert_eq!(outbox.push(patch(2, "b", 1.0)), PushOutcome::DroppedChat);
        assert_eq!(outbox.len(), 2);
        assert!(matches!(outbox.try_pop(), Some(ServerMsg::Patch(_))));
    }

    #[test]
    fn control_messages_make_room_by_folding_patches() {
        let outbox = Outbox::new(3);
        outbox.push(patch(1, "a", 1.0));
        outbox.push(patch(2, "b", 2.0));
        outbox.push(patch(3, "a", 3.0));
        let add = ServerMsg::Remove(PlayerId::from("c"));
        assert_eq!(outbox.push(add), PushOutcome::Coalesced);
        assert_eq!(outbox.len(), 3);
        let Some(ServerMsg::Patch(folded)) = outbox.try_pop() else {
            panic!("expected patch");
        };
        assert_eq!(folded.tick, 2);
        assert_eq!(folded.changed.len(), 2);
    }

    #[test]
    fn overflow_when_nothing_can_go() {
        let outbox = Outbox::new(2);
        outbox.push(ServerMsg::Remove(PlayerId::from("a")));
        outbox.push(ServerMsg::Remove(PlayerId::from("b")));
        assert_eq!(
            outbox.push(ServerMsg::Remove(PlayerId::from("c"))),
            PushOutcome::Overflow
        );
    }

    #[tokio::test]
    async fn pop_returns_none_after_close_and_drain() {
        let outbox = Outbox::new(4);
        outbox.push(chat("hi"));
        outbox.close();
        assert!(outbox.pop().await.is_some());
        assert!(outbox.pop().await.is_none());
    }
}
