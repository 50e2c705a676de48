use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware,
    routing::{delete, get, post},
};

use crate::middleware::require_auth;
use crate::posts::MAX_UPLOAD_BYTES;
use crate::state::AppState;
use crate::{auth, conversations, graph, media, messages, posts, users};

/// Every HTTP route of the service. The WebSocket gateway, health check and
/// static files are mounted by the server binary.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/auth/sign-up", post(auth::register))
        .route("/auth/sign-in", post(auth::login));

    let protected_routes = Router::new()
        .route("/users/{user_id}", get(users::get).put(users::update))
        // Follow graph
        .route("/follow/follow", post(graph::follow))
        .route("/follow/unfollow", post(graph::unfollow))
        .route("/follow/block", post(graph::block))
        .route("/follow/follow-list", get(graph::follow_list))
        .route("/follow/follower-list", get(graph::follower_list))
        .route("/follow/friend-list", get(graph::friend_list))
        .route("/follow/block-list", get(graph::block_list))
        // Conversations and messages
        .route("/conversations", get(conversations::list))
        .route("/conversations/{conversation_id}", delete(conversations::delete))
        .route(
            "/messages/{conversation_id}",
            get(messages::get_messages).post(messages::send_message),
        )
        .route(
            "/messages/receiver/{receiver_id}",
            post(messages::send_to_receiver),
        )
        // Posts and media
        .route(
            "/posts",
            post(posts::create).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/posts/all", get(posts::all))
        .route("/posts/me", get(posts::mine))
        .route("/posts/friends", get(posts::friends))
        .route("/posts/user/{user_id}", get(posts::by_user))
        .route("/posts/{post_id}", get(posts::get).delete(posts::delete))
        .route("/media/user/{user_id}", get(media::by_user))
        .route("/media/{media_id}", get(media::get))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .with_state(state)
}
