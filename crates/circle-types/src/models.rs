use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Returned when a stored enum column holds a value we don't know.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant(pub String);

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown variant '{}'", self.0)
    }
}

impl std::error::Error for UnknownVariant {}

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(UnknownVariant(other.to_string())),
                }
            }
        }
    };
}

// -- Users --

/// The public slice of a user embedded in lists, messages and posts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: Uuid,
    pub username: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: Uuid,
    pub username: String,
    pub display_name: Option<String>,
    pub email: String,
    pub avatar_url: Option<String>,
    pub roles: Vec<RoleRef>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
}

/// A role attached to a user: either the bare id, or the record once it
/// has been through a population step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RoleRef {
    Reference(Uuid),
    Expanded(Role),
}

impl RoleRef {
    pub fn id(&self) -> Uuid {
        match self {
            Self::Reference(id) => *id,
            Self::Expanded(role) => role.id,
        }
    }

    /// Role name, available only once expanded.
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Reference(_) => None,
            Self::Expanded(role) => Some(&role.name),
        }
    }
}

// -- Relationships --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationStatus {
    Pending,
    Accepted,
    Blocked,
}

string_enum!(RelationStatus {
    Pending => "pending",
    Accepted => "accepted",
    Blocked => "blocked",
});

/// A directed follow edge between two users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relationship {
    pub id: Uuid,
    pub requester_id: Uuid,
    pub target_id: Uuid,
    pub status: RelationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Relationship {
    /// The user on the other end of this edge, seen from `user_id`.
    pub fn counterpart(&self, user_id: Uuid) -> Option<Uuid> {
        if self.requester_id == user_id {
            Some(self.target_id)
        } else if self.target_id == user_id {
            Some(self.requester_id)
        } else {
            None
        }
    }
}

// -- Media & posts --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Image,
    Video,
    Audio,
}

string_enum!(MediaType {
    Image => "image",
    Video => "video",
    Audio => "audio",
});

impl MediaType {
    /// Classify an upload by its MIME type. Anything that isn't video or
    /// audio is stored as an image.
    pub fn from_mime(mime: &str) -> Self {
        if mime.starts_with("video/") {
            Self::Video
        } else if mime.starts_with("audio/") {
            Self::Audio
        } else {
            Self::Image
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Media {
    pub id: Uuid,
    pub user_id: Uuid,
    pub media_type: MediaType,
    pub storage_key: String,
    pub url: String,
    pub size_bytes: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Public,
    Private,
    Friends,
}

string_enum!(Visibility {
    Public => "public",
    Private => "private",
    Friends => "friends",
});

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub id: Uuid,
    pub author: UserSummary,
    pub caption: Option<String>,
    pub visibility: Visibility,
    pub media: Option<Media>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Denormalized view of a post shared inside a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostSnippet {
    pub post_id: Uuid,
    pub caption: Option<String>,
    pub media_url: Option<String>,
}

// -- Conversations & messages --

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    Video,
    Post,
}

string_enum!(MessageType {
    Text => "text",
    Image => "image",
    Video => "video",
    Post => "post",
});

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender: UserSummary,
    pub content: String,
    pub message_type: MessageType,
    pub post: Option<PostSnippet>,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastMessage {
    pub id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// One row of a user's conversation list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: Uuid,
    pub is_group: bool,
    pub peer: Option<UserSummary>,
    pub last_message: Option<LastMessage>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_text() {
        for status in [RelationStatus::Pending, RelationStatus::Accepted, RelationStatus::Blocked] {
            assert_eq!(status.as_str().parse::<RelationStatus>().unwrap(), status);
        }
        assert!("friend".parse::<Visibility>().is_err());
    }

    #[test]
    fn test_media_type_from_mime() {
        assert_eq!(MediaType::from_mime("video/mp4"), MediaType::Video);
        assert_eq!(MediaType::from_mime("audio/ogg"), MediaType::Audio);
        assert_eq!(MediaType::from_mime("image/png"), MediaType::Image);
        assert_eq!(MediaType::from_mime("application/octet-stream"), MediaType::Image);
    }

    #[test]
    fn test_role_ref_serializes_as_id_or_record() {
        let id = Uuid::new_v4();
        let bare = serde_json::to_value(RoleRef::Reference(id)).unwrap();
        assert_eq!(bare, serde_json::json!(id));

        let expanded = RoleRef::Expanded(Role {
            id,
            name: "USER".into(),
            description: None,
        });
        assert_eq!(expanded.name(), Some("USER"));
        assert_eq!(serde_json::to_value(&expanded).unwrap()["name"], "USER");
    }

    #[test]
    fn test_counterpart() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let now = Utc::now();
        let edge = Relationship {
            id: Uuid::new_v4(),
            requester_id: a,
            target_id: b,
            status: RelationStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        assert_eq!(edge.counterpart(a), Some(b));
        assert_eq!(edge.counterpart(b), Some(a));
        assert_eq!(edge.counterpart(Uuid::new_v4()), None);
    }
}
