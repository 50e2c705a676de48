use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, Stream, StreamExt};
use jsonwebtoken::{DecodingKey, Validation, decode};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use circle_db::{Database, DbError, conversations};
use circle_types::api::Claims;
use circle_types::events::{GatewayCommand, RealtimeEvent, Room};

use crate::dispatcher::Dispatcher;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// How long a fresh socket has to send `Identify`.
const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(10);

type Rooms = Arc<std::sync::RwLock<HashSet<Room>>>;

/// Handle a single WebSocket connection: Identify handshake, then relay
/// room messages until either side goes away.
pub async fn handle_connection(
    socket: WebSocket,
    dispatcher: Dispatcher,
    db: Arc<Database>,
    jwt_secret: String,
) {
    let (mut sender, mut receiver) = socket.split();

    let identified = wait_for_identify(&mut receiver, &jwt_secret, IDENTIFY_TIMEOUT).await;
    let (user_id, username) = match identified {
        Some(id) => id,
        None => {
            warn!("WebSocket client failed to identify, closing");
            return;
        }
    };

    info!("{} ({}) connected to gateway", username, user_id);

    let ready = RealtimeEvent::Ready {
        user_id,
        username: username.clone(),
    };
    if send_event(&mut sender, &ready).await.is_err() {
        return;
    }

    dispatcher.session_opened(user_id).await;
    run_connection_loop(sender, receiver, &dispatcher, db, user_id, &username).await;
    dispatcher.session_closed(user_id).await;

    info!("{} ({}) disconnected from gateway", username, user_id);
}

async fn run_connection_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    dispatcher: &Dispatcher,
    db: Arc<Database>,
    user_id: Uuid,
    username: &str,
) {
    let rooms = session_rooms(user_id);
    let send_rooms = rooms.clone();

    // Replies to this session only (join/leave acks, command errors).
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<RealtimeEvent>();

    let mut broadcast_rx = dispatcher.subscribe();

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward room messages + replies -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = broadcast_rx.recv() => {
                    let msg = match result {
                        Ok(msg) => msg,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Broadcast receiver lagged by {} messages", n);
                            continue;
                        }
                        Err(_) => break,
                    };

                    if !msg.is_for(user_id) || !in_room(&send_rooms, &msg.room) {
                        continue;
                    }

                    if sender.send(Message::Text(msg.json.to_string().into())).await.is_err() {
                        break;
                    }
                }
                reply = reply_rx.recv() => {
                    let Some(event) = reply else { break };
                    if send_event(&mut sender, &event).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from client
    let username_recv = username.to_string();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(cmd) => {
                        let reply = handle_command(&db, user_id, cmd, &rooms).await;
                        if reply_tx.send(reply).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(
                            "{} ({}) bad command: {} -- raw: {}",
                            username_recv,
                            user_id,
                            e,
                            text.chars().take(200).collect::<String>()
                        );
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
}

/// Every session sits in its owner's personal room from the start.
fn session_rooms(user_id: Uuid) -> Rooms {
    Arc::new(std::sync::RwLock::new(HashSet::from([Room::User(user_id)])))
}

fn in_room(rooms: &Rooms, room: &Room) -> bool {
    rooms
        .read()
        .map(|joined| joined.contains(room))
        .unwrap_or(false)
}

async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &RealtimeEvent,
) -> Result<(), ()> {
    let text = serde_json::to_string(event).map_err(|e| {
        error!("Failed to serialize {} event: {}", event.name(), e);
    })?;
    sender.send(Message::Text(text.into())).await.map_err(|_| ())
}

/// Validate an `Identify` token and return who it belongs to.
fn authenticate(token: &str, jwt_secret: &str) -> Option<(Uuid, String)> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(jwt_secret.as_bytes()),
        &Validation::default(),
    )
    .ok()?;
    Some((token_data.claims.sub, token_data.claims.username))
}

/// Wait for the first `Identify` frame. Other frames are skipped; a bad
/// token, a closed socket or the deadline ends the wait.
async fn wait_for_identify<S>(
    receiver: &mut S,
    jwt_secret: &str,
    deadline: Duration,
) -> Option<(Uuid, String)>
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let identify = async {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                if let Ok(GatewayCommand::Identify { token }) =
                    serde_json::from_str::<GatewayCommand>(&text)
                {
                    return authenticate(&token, jwt_secret);
                }
            }
        }
        None
    };

    tokio::time::timeout(deadline, identify).await.ok().flatten()
}

/// Apply one client command and produce the reply for this session.
async fn handle_command(
    db: &Arc<Database>,
    user_id: Uuid,
    cmd: GatewayCommand,
    rooms: &Rooms,
) -> RealtimeEvent {
    match cmd {
        GatewayCommand::Identify { .. } => RealtimeEvent::Error {
            message: "Already identified".into(),
        },

        GatewayCommand::Join { conversation_id } => {
            match may_join(db.clone(), user_id, conversation_id).await {
                Ok(true) => {
                    if let Ok(mut joined) = rooms.write() {
                        joined.insert(Room::Conversation(conversation_id));
                    }
                    RealtimeEvent::Joined { conversation_id }
                }
                Ok(false) => RealtimeEvent::Error {
                    message: "You are not part of this conversation".into(),
                },
                Err(e) => {
                    error!("Join check for {} failed: {}", conversation_id, e);
                    RealtimeEvent::Error {
                        message: "Internal server error".into(),
                    }
                }
            }
        }

        GatewayCommand::Leave { conversation_id } => {
            if let Ok(mut joined) = rooms.write() {
                joined.remove(&Room::Conversation(conversation_id));
            }
            RealtimeEvent::Left { conversation_id }
        }
    }
}

/// Only participants of a live conversation may listen to its room.
async fn may_join(db: Arc<Database>, user_id: Uuid, conversation_id: Uuid) -> anyhow::Result<bool> {
    let conversation = tokio::task::spawn_blocking(move || {
        db.with_conn(|conn| conversations::find_conversation(conn, conversation_id))
    })
    .await?
    .map_err(|e: DbError| anyhow::anyhow!(e))?;

    Ok(conversation.is_some_and(|c| !c.is_deleted && c.has_participant(user_id)))
}
