use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, broadcast};
use tracing::trace;
use uuid::Uuid;

use circle_types::events::{RealtimeEvent, Room};

use crate::notifier::Notifier;

/// An event on its way to one room, serialized once for every session.
#[derive(Debug, Clone)]
pub struct RoomMessage {
    pub room: Room,
    pub except: Option<Uuid>,
    pub event: RealtimeEvent,
    pub json: Arc<str>,
}

impl RoomMessage {
    /// Whether a session of `user_id` that has joined `room` should get this.
    pub fn is_for(&self, user_id: Uuid) -> bool {
        self.except != Some(user_id)
    }
}

/// Fans events out to connected sessions. Each session filters the shared
/// stream down to the rooms it has joined.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// Broadcast channel for room messages. All sessions see all messages
    /// and drop the ones for rooms they are not in.
    broadcast_tx: broadcast::Sender<RoomMessage>,

    /// Live session count per user.
    sessions: RwLock<HashMap<Uuid, usize>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(DispatcherInner {
                broadcast_tx,
                sessions: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Subscribe to room messages. Returns a broadcast receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<RoomMessage> {
        self.inner.broadcast_tx.subscribe()
    }

    pub async fn session_opened(&self, user_id: Uuid) {
        *self.inner.sessions.write().await.entry(user_id).or_default() += 1;
    }

    pub async fn session_closed(&self, user_id: Uuid) {
        let mut sessions = self.inner.sessions.write().await;
        if let Some(count) = sessions.get_mut(&user_id) {
            *count -= 1;
            if *count == 0 {
                sessions.remove(&user_id);
            }
        }
    }

    pub async fn online_count(&self) -> usize {
        self.inner.sessions.read().await.len()
    }
}

impl Notifier for Dispatcher {
    fn emit(&self, room: Room, event: RealtimeEvent, except: Option<Uuid>) -> anyhow::Result<()> {
        let json: Arc<str> = serde_json::to_string(&event)?.into();
        let message = RoomMessage {
            room,
            except,
            event,
            json,
        };

        // Err only means nobody is connected right now.
        if self.inner.broadcast_tx.send(message).is_err() {
            trace!("No live sessions, dropped event for room {}", room);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_without_sessions_is_ok() {
        let dispatcher = Dispatcher::new();
        let result = dispatcher.emit(
            Room::User(Uuid::new_v4()),
            RealtimeEvent::Error {
                message: "nobody home".into(),
            },
            None,
        );
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_subscriber_sees_room_and_exclusion() {
        let dispatcher = Dispatcher::new();
        let mut rx = dispatcher.subscribe();
        let (conversation, sender) = (Uuid::new_v4(), Uuid::new_v4());

        dispatcher
            .emit(
                Room::Conversation(conversation),
                RealtimeEvent::Joined {
                    conversation_id: conversation,
                },
                Some(sender),
            )
            .unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.room, Room::Conversation(conversation));
        assert!(!msg.is_for(sender));
        assert!(msg.is_for(Uuid::new_v4()));
        assert!(msg.json.contains("\"type\":\"joined\""));
    }

    #[tokio::test]
    async fn test_session_counting() {
        let dispatcher = Dispatcher::new();
        let user = Uuid::new_v4();
        dispatcher.session_opened(user).await;
        dispatcher.session_opened(user).await;
        dispatcher.session_closed(user).await;
        assert_eq!(dispatcher.online_count().await, 1);
        dispatcher.session_closed(user).await;
        assert_eq!(dispatcher.online_count().await, 0);
    }
}
