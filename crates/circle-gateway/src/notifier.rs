use tracing::warn;
use uuid::Uuid;

use circle_types::events::{RealtimeEvent, Room};

/// Room-scoped publish capability handed to every handler that needs to
/// tell connected clients about a change.
///
/// Delivery is at-most-once: an event emitted to a room with no live
/// session is dropped.
pub trait Notifier: Send + Sync {
    /// Publish `event` to every session in `room`, skipping sessions that
    /// belong to `except` when given.
    fn emit(&self, room: Room, event: RealtimeEvent, except: Option<Uuid>) -> anyhow::Result<()>;
}

/// Emit to a room, logging instead of failing. Persistence has already
/// happened by the time we notify, so the caller never sees this error.
pub fn notify(notifier: &dyn Notifier, room: Room, event: RealtimeEvent) {
    emit_logged(notifier, room, event, None);
}

/// Like [`notify`], but the acting user's own sessions don't get an echo.
pub fn notify_except(notifier: &dyn Notifier, room: Room, event: RealtimeEvent, sender: Uuid) {
    emit_logged(notifier, room, event, Some(sender));
}

fn emit_logged(notifier: &dyn Notifier, room: Room, event: RealtimeEvent, except: Option<Uuid>) {
    let name = event.name();
    if let Err(e) = notifier.emit(room, event, except) {
        warn!("Failed to emit {} to room {}: {:#}", name, room, e);
    }
}
