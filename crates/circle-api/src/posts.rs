//! Posts with a single embedded media object, and who gets to see them.

use axum::{
    Extension, Json,
    extract::{
        Multipart, Path, State,
        multipart::MultipartRejection,
        rejection::PathRejection,
    },
    http::StatusCode,
    response::IntoResponse,
};
use bytes::Bytes;
use chrono::Utc;
use rusqlite::Connection;
use tracing::{debug, info};
use uuid::Uuid;

use circle_db::models::PostRow;
use circle_db::{Database, posts};
use circle_gateway::{Notifier, notify};
use circle_types::api::{ApiResponse, Claims};
use circle_types::events::{RealtimeEvent, Room};
use circle_types::models::{Media, MediaType, Post, Visibility};

use crate::error::{ApiError, ApiResult};
use crate::graph::{are_friends, ensure_active, friend_ids};
use crate::state::{AppState, blocking};
use crate::storage::{ObjectStore, sanitize_filename};

/// Largest accepted upload, in bytes.
pub const MAX_UPLOAD_BYTES: usize = 25 * 1024 * 1024;

const MAX_CAPTION_LEN: usize = 255;

const ALL_VISIBILITIES: [Visibility; 3] =
    [Visibility::Public, Visibility::Private, Visibility::Friends];
const SHARED_WITH_FRIENDS: [Visibility; 2] = [Visibility::Public, Visibility::Friends];

/// Whether `viewer` may see `post`: public posts are open to everyone,
/// private ones only to their author, friends-only ones to the author and
/// accepted friends.
pub fn can_view(conn: &Connection, viewer: Uuid, post: &Post) -> ApiResult<bool> {
    if post.author.id == viewer {
        return Ok(true);
    }
    match post.visibility {
        Visibility::Public => Ok(true),
        Visibility::Private => Ok(false),
        Visibility::Friends => are_friends(conn, viewer, post.author.id),
    }
}

fn live_post(conn: &Connection, post_id: Uuid) -> ApiResult<PostRow> {
    posts::find_post(conn, post_id)?
        .filter(|row| !row.is_deleted)
        .ok_or_else(|| ApiError::not_found("Post not found"))
}

/// A live post the viewer is allowed to see.
pub fn visible_post(conn: &Connection, viewer: Uuid, post_id: Uuid) -> ApiResult<Post> {
    let row = live_post(conn, post_id)?;
    if !can_view(conn, viewer, &row.post)? {
        return Err(ApiError::forbidden("You cannot view this post"));
    }
    Ok(row.post)
}

/// An uploaded object, ready to be recorded as a post's media.
pub struct StoredMedia {
    pub storage_key: String,
    pub url: String,
    pub content_type: String,
    pub size_bytes: i64,
}

pub fn publish_post(
    db: &Database,
    notifier: &dyn Notifier,
    author: Uuid,
    stored: StoredMedia,
    caption: Option<String>,
    visibility: Visibility,
) -> ApiResult<Post> {
    let now = Utc::now();
    let media = Media {
        id: Uuid::new_v4(),
        user_id: author,
        media_type: MediaType::from_mime(&stored.content_type),
        storage_key: stored.storage_key,
        url: stored.url,
        size_bytes: stored.size_bytes,
        created_at: now,
    };
    let post_id = Uuid::new_v4();

    let (post, audience) = db.with_tx(|tx| -> ApiResult<(Post, Vec<Uuid>)> {
        posts::insert_media(tx, &media)?;
        posts::insert_post(
            tx,
            &posts::NewPost {
                id: post_id,
                user_id: author,
                media_id: media.id,
                caption: caption.as_deref(),
                visibility,
                created_at: now,
            },
        )?;
        let post = live_post(tx, post_id)?.post;
        let audience = friend_ids(tx, author)?.into_iter().collect();
        Ok((post, audience))
    })?;

    info!("{} published post {} ({})", author, post.id, visibility);

    if visibility != Visibility::Private {
        for user_id in std::iter::once(author).chain(audience) {
            notify(
                notifier,
                Room::User(user_id),
                RealtimeEvent::NewPost { post: post.clone() },
            );
        }
    }
    Ok(post)
}

pub fn get_post(db: &Database, viewer: Uuid, post_id: Uuid) -> ApiResult<Post> {
    db.with_conn(|conn| visible_post(conn, viewer, post_id))
}

/// The viewer's own posts plus everything their friends shared with them,
/// newest first.
pub fn feed(db: &Database, viewer: Uuid) -> ApiResult<Vec<Post>> {
    db.with_conn(|conn| {
        let friends: Vec<Uuid> = friend_ids(conn, viewer)?.into_iter().collect();
        let mut all = posts::posts_by(conn, &[viewer], &ALL_VISIBILITIES)?;
        all.extend(posts::posts_by(conn, &friends, &SHARED_WITH_FRIENDS)?);
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(all)
    })
}

pub fn own_posts(db: &Database, viewer: Uuid) -> ApiResult<Vec<Post>> {
    db.with_conn(|conn| posts::posts_by(conn, &[viewer], &ALL_VISIBILITIES))
        .map_err(ApiError::from)
}

pub fn friends_posts(db: &Database, viewer: Uuid) -> ApiResult<Vec<Post>> {
    db.with_conn(|conn| {
        let friends: Vec<Uuid> = friend_ids(conn, viewer)?.into_iter().collect();
        Ok(posts::posts_by(conn, &friends, &SHARED_WITH_FRIENDS)?)
    })
}

/// Posts by `author`, narrowed to what `viewer` may see.
pub fn posts_of_user(db: &Database, viewer: Uuid, author: Uuid) -> ApiResult<Vec<Post>> {
    db.with_conn(|conn| {
        ensure_active(conn, author)?;
        let visibilities: &[Visibility] = if viewer == author {
            &ALL_VISIBILITIES
        } else if are_friends(conn, viewer, author)? {
            &SHARED_WITH_FRIENDS
        } else {
            &[Visibility::Public]
        };
        Ok(posts::posts_by(conn, &[author], visibilities)?)
    })
}

/// Soft-delete a post and its media. Only the author may do this.
pub fn delete_post(db: &Database, user_id: Uuid, post_id: Uuid) -> ApiResult<()> {
    db.with_tx(|tx| -> ApiResult<()> {
        let row = live_post(tx, post_id)?;
        if row.post.author.id != user_id {
            return Err(ApiError::forbidden("Only the author can delete this post"));
        }
        posts::soft_delete_post(tx, post_id)?;
        posts::soft_delete_media(tx, row.media_id)?;
        Ok(())
    })?;
    info!("{} deleted post {}", user_id, post_id);
    Ok(())
}

// -- Multipart form --

struct Upload {
    file_name: String,
    content_type: String,
    data: Bytes,
}

#[derive(Default)]
struct PostForm {
    media: Option<Upload>,
    caption: Option<String>,
    visibility: Option<String>,
}

async fn read_post_form(mut multipart: Multipart) -> ApiResult<PostForm> {
    let mut form = PostForm::default();

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "media" => {
                let file_name = field.file_name().unwrap_or("upload").to_string();
                let content_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let data = field.bytes().await?;
                form.media = Some(Upload {
                    file_name,
                    content_type,
                    data,
                });
            }
            "caption" => form.caption = Some(field.text().await?),
            "visibility" => form.visibility = Some(field.text().await?),
            other => debug!("Ignoring multipart field {:?}", other),
        }
    }
    Ok(form)
}

fn parse_visibility(raw: Option<&str>) -> ApiResult<Visibility> {
    match raw.map(str::trim).filter(|v| !v.is_empty()) {
        Some(value) => value
            .to_lowercase()
            .parse()
            .map_err(|_| ApiError::validation("visibility must be public, private or friends")),
        None => Ok(Visibility::default()),
    }
}

fn is_media_mime(content_type: &str) -> bool {
    ["image/", "video/", "audio/"]
        .iter()
        .any(|prefix| content_type.starts_with(prefix))
}

/// Check an uploaded file and hand it to object storage under the owner's
/// upload prefix.
async fn store_upload(
    storage: &dyn ObjectStore,
    owner: Uuid,
    upload: Upload,
) -> ApiResult<StoredMedia> {
    if upload.data.is_empty() {
        return Err(ApiError::validation("The media file is empty"));
    }
    if !is_media_mime(&upload.content_type) {
        return Err(ApiError::validation(format!(
            "Unsupported media type {}",
            upload.content_type
        )));
    }

    let storage_key = format!(
        "uploads/{}/{}_{}",
        owner,
        Utc::now().timestamp_millis(),
        sanitize_filename(&upload.file_name)
    );
    let size_bytes = upload.data.len() as i64;
    let url = storage
        .put_object(&storage_key, upload.data, &upload.content_type)
        .await?;

    Ok(StoredMedia {
        storage_key,
        url,
        content_type: upload.content_type,
        size_bytes,
    })
}

// -- Handlers --

pub async fn create(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    multipart: Result<Multipart, MultipartRejection>,
) -> ApiResult<impl IntoResponse> {
    let form = read_post_form(multipart?).await?;

    let upload = form
        .media
        .ok_or_else(|| ApiError::validation("A media file is required"))?;

    let caption = form
        .caption
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty());
    if caption
        .as_ref()
        .is_some_and(|c| c.chars().count() > MAX_CAPTION_LEN)
    {
        return Err(ApiError::validation("Caption must be at most 255 characters"));
    }
    let visibility = parse_visibility(form.visibility.as_deref())?;

    let stored = store_upload(state.storage.as_ref(), claims.sub, upload).await?;
    let post = blocking(move || {
        publish_post(
            &state.db,
            state.notifier(),
            claims.sub,
            stored,
            caption,
            visibility,
        )
    })
    .await?;

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::ok_with_message("Post created", post)),
    ))
}

pub async fn get(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    path: Result<Path<Uuid>, PathRejection>,
) -> ApiResult<impl IntoResponse> {
    let Path(post_id) = path?;
    let post = blocking(move || get_post(&state.db, claims.sub, post_id)).await?;
    Ok(Json(ApiResponse::ok(post)))
}

pub async fn all(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let posts = blocking(move || feed(&state.db, claims.sub)).await?;
    Ok(Json(ApiResponse::ok(posts)))
}

pub async fn mine(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let posts = blocking(move || own_posts(&state.db, claims.sub)).await?;
    Ok(Json(ApiResponse::ok(posts)))
}

pub async fn friends(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let posts = blocking(move || friends_posts(&state.db, claims.sub)).await?;
    Ok(Json(ApiResponse::ok(posts)))
}

pub async fn by_user(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    path: Result<Path<Uuid>, PathRejection>,
) -> ApiResult<impl IntoResponse> {
    let Path(author) = path?;
    let posts = blocking(move || posts_of_user(&state.db, claims.sub, author)).await?;
    Ok(Json(ApiResponse::ok(posts)))
}

pub async fn delete(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    path: Result<Path<Uuid>, PathRejection>,
) -> ApiResult<impl IntoResponse> {
    let Path(post_id) = path?;
    blocking(move || delete_post(&state.db, claims.sub, post_id)).await?;
    Ok(Json(ApiResponse::message("Post deleted")))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::graph::follow_user;
    use crate::test_support::{self, MemoryObjectStore, RecordingNotifier};

    pub(crate) fn stored(name: &str) -> StoredMedia {
        StoredMedia {
            storage_key: format!("uploads/test/{}", name),
            url: format!("memory://uploads/test/{}", name),
            content_type: "image/png".into(),
            size_bytes: 4,
        }
    }

    pub(crate) fn publish(db: &Database, author: Uuid, visibility: Visibility) -> Post {
        publish_post(
            db,
            &RecordingNotifier::default(),
            author,
            stored("p.png"),
            Some("caption".into()),
            visibility,
        )
        .unwrap()
    }

    fn befriend(db: &Database, a: Uuid, b: Uuid) {
        let notifier = RecordingNotifier::default();
        follow_user(db, &notifier, a, Some(b)).unwrap();
        follow_user(db, &notifier, b, Some(a)).unwrap();
    }

    #[test]
    fn test_friends_post_visibility() {
        let db = Database::open_in_memory().unwrap();
        let owner = test_support::user(&db, "owner");
        let friend = test_support::user(&db, "friend");
        let stranger = test_support::user(&db, "stranger");
        befriend(&db, owner, friend);

        let post = publish(&db, owner, Visibility::Friends);
        assert!(matches!(
            get_post(&db, stranger, post.id),
            Err(ApiError::Forbidden(_))
        ));
        assert_eq!(get_post(&db, friend, post.id).unwrap().id, post.id);
        assert_eq!(get_post(&db, owner, post.id).unwrap().id, post.id);

        let private = publish(&db, owner, Visibility::Private);
        assert!(matches!(
            get_post(&db, friend, private.id),
            Err(ApiError::Forbidden(_))
        ));
        assert!(matches!(
            get_post(&db, friend, Uuid::new_v4()),
            Err(ApiError::NotFound(_))
        ));
    }

    #[test]
    fn test_new_post_reaches_author_and_friends_unless_private() {
        let db = Database::open_in_memory().unwrap();
        let owner = test_support::user(&db, "owner");
        let friend = test_support::user(&db, "friend");
        let stranger = test_support::user(&db, "stranger");
        befriend(&db, owner, friend);

        let notifier = RecordingNotifier::default();
        publish_post(&db, &notifier, owner, stored("a.png"), None, Visibility::Public).unwrap();
        assert_eq!(notifier.for_room(Room::User(owner)).len(), 1);
        assert_eq!(notifier.for_room(Room::User(friend)).len(), 1);
        assert!(notifier.for_room(Room::User(stranger)).is_empty());

        notifier.take();
        publish_post(&db, &notifier, owner, stored("b.png"), None, Visibility::Private).unwrap();
        assert!(notifier.take().is_empty());
    }

    #[test]
    fn test_feed_and_user_listing() {
        let db = Database::open_in_memory().unwrap();
        let me = test_support::user(&db, "me");
        let friend = test_support::user(&db, "friend");
        let stranger = test_support::user(&db, "stranger");
        befriend(&db, me, friend);

        publish(&db, me, Visibility::Private);
        publish(&db, friend, Visibility::Friends);
        publish(&db, friend, Visibility::Private);
        publish(&db, stranger, Visibility::Public);

        let feed = feed(&db, me).unwrap();
        assert_eq!(feed.len(), 2);
        assert!(feed.windows(2).all(|w| w[0].created_at >= w[1].created_at));

        assert_eq!(own_posts(&db, me).unwrap().len(), 1);
        assert_eq!(friends_posts(&db, me).unwrap().len(), 1);
        assert_eq!(posts_of_user(&db, me, friend).unwrap().len(), 1);
        assert_eq!(posts_of_user(&db, friend, friend).unwrap().len(), 2);
        assert!(posts_of_user(&db, stranger, friend).unwrap().is_empty());
        assert_eq!(posts_of_user(&db, me, stranger).unwrap().len(), 1);
    }

    #[test]
    fn test_delete_post_owner_only() {
        let db = Database::open_in_memory().unwrap();
        let owner = test_support::user(&db, "owner");
        let other = test_support::user(&db, "other");
        let post = publish(&db, owner, Visibility::Public);

        assert!(matches!(
            delete_post(&db, other, post.id),
            Err(ApiError::Forbidden(_))
        ));
        delete_post(&db, owner, post.id).unwrap();
        assert!(matches!(
            get_post(&db, owner, post.id),
            Err(ApiError::NotFound(_))
        ));
        assert!(own_posts(&db, owner).unwrap().is_empty());
    }

    #[test]
    fn test_parse_visibility() {
        assert_eq!(parse_visibility(None).unwrap(), Visibility::Public);
        assert_eq!(parse_visibility(Some(" Friends ")).unwrap(), Visibility::Friends);
        assert!(matches!(
            parse_visibility(Some("everyone")),
            Err(ApiError::Validation(_))
        ));
    }

    fn upload(file_name: &str, content_type: &str, data: &'static [u8]) -> Upload {
        Upload {
            file_name: file_name.into(),
            content_type: content_type.into(),
            data: Bytes::from_static(data),
        }
    }

    #[tokio::test]
    async fn test_store_upload_writes_under_owner_prefix() {
        let storage = MemoryObjectStore::default();
        let owner = Uuid::new_v4();

        let stored = store_upload(&storage, owner, upload("../my clip.mp4", "video/mp4", b"MP4"))
            .await
            .unwrap();
        assert!(stored.storage_key.starts_with(&format!("uploads/{}/", owner)));
        assert!(stored.storage_key.ends_with("_my_clip.mp4"));
        assert_eq!(stored.url, format!("memory://{}", stored.storage_key));
        assert_eq!(stored.size_bytes, 3);

        let objects = storage.objects.lock().unwrap();
        let (data, content_type) = &objects[&stored.storage_key];
        assert_eq!(data.as_ref(), b"MP4");
        assert_eq!(content_type, "video/mp4");
    }

    #[tokio::test]
    async fn test_store_upload_rejects_empty_and_non_media() {
        let storage = MemoryObjectStore::default();
        let owner = Uuid::new_v4();

        assert!(matches!(
            store_upload(&storage, owner, upload("a.png", "image/png", b"")).await,
            Err(ApiError::Validation(_))
        ));
        assert!(matches!(
            store_upload(&storage, owner, upload("a.pdf", "application/pdf", b"%PDF")).await,
            Err(ApiError::Validation(_))
        ));
        assert!(storage.objects.lock().unwrap().is_empty());
    }
}
