pub mod auth;
pub mod conversations;
pub mod error;
pub mod graph;
pub mod media;
pub mod messages;
pub mod middleware;
pub mod posts;
pub mod routes;
pub mod state;
pub mod storage;
pub mod users;

pub use error::{ApiError, ApiResult};
pub use routes::router;
pub use state::{AppState, AppStateInner};

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use bytes::Bytes;
    use uuid::Uuid;

    use circle_db::{Database, users};
    use circle_gateway::Notifier;
    use circle_types::events::{RealtimeEvent, Room};

    use crate::storage::ObjectStore;

    /// Notifier that keeps every emitted event for later inspection.
    #[derive(Default)]
    pub struct RecordingNotifier {
        events: Mutex<Vec<(Room, RealtimeEvent, Option<Uuid>)>>,
    }

    impl Notifier for RecordingNotifier {
        fn emit(&self, room: Room, event: RealtimeEvent, except: Option<Uuid>) -> anyhow::Result<()> {
            self.events.lock().unwrap().push((room, event, except));
            Ok(())
        }
    }

    impl RecordingNotifier {
        pub fn take(&self) -> Vec<(Room, RealtimeEvent, Option<Uuid>)> {
            std::mem::take(&mut *self.events.lock().unwrap())
        }

        /// Events delivered to one room, in emit order.
        pub fn for_room(&self, room: Room) -> Vec<RealtimeEvent> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|(r, _, _)| *r == room)
                .map(|(_, event, _)| event.clone())
                .collect()
        }
    }

    #[derive(Default)]
    pub struct MemoryObjectStore {
        pub objects: Mutex<HashMap<String, (Bytes, String)>>,
    }

    #[async_trait]
    impl ObjectStore for MemoryObjectStore {
        async fn put_object(&self, key: &str, data: Bytes, content_type: &str) -> anyhow::Result<String> {
            self.objects
                .lock()
                .unwrap()
                .insert(key.to_string(), (data, content_type.to_string()));
            Ok(format!("memory://{}", key))
        }
    }

    pub fn user(db: &Database, username: &str) -> Uuid {
        let id = Uuid::new_v4();
        db.with_conn(|conn| {
            users::insert_user(
                conn,
                &users::NewUser {
                    id,
                    username,
                    display_name: None,
                    email: &format!("{}@example.com", username),
                    password_hash: "hash",
                },
            )
        })
        .unwrap();
        id
    }
}
