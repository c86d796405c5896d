use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Generates a random 128-bit identifier (UUID v4).
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Current UTC time truncated to millisecond precision.
///
/// Every timestamp in the system passes through here so that the JSON
/// rendering and the stored integer milliseconds always agree.
pub fn now_millis() -> DateTime<Utc> {
    let ms = Utc::now().timestamp_millis();
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// User is a tenant - every note and todo belongs to exactly one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    #[serde(skip_serializing, default)]
    pub password_hash: String,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
}

/// Note is a rich text document. A note with `deleted_at` set is a
/// tombstone: invisible to list/get/search but still served to sync
/// clients so the deletion propagates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Note {
    pub id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(rename = "type", default = "default_note_type")]
    pub note_type: String,
    pub modified_at: DateTime<Utc>,
    #[serde(default)]
    pub modified_by_device: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

fn default_note_type() -> String {
    "note".to_string()
}

/// Todo is a completable task, optionally anchored to a line of a note.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Todo {
    pub id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line_ref: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed: bool,
    pub modified_at: DateTime<Utc>,
    #[serde(default)]
    pub modified_by_device: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// RefreshToken tracks an issued refresh token for rotation and
/// revocation. `id` matches the token's `jti` claim; only the SHA-256
/// digest of the token itself is kept.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshToken {
    pub id: String,
    pub user_id: String,
    pub device_id: String,
    #[serde(skip_serializing, default)]
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

// Request types

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterRequest {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub display_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoginRequest {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub device_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RefreshRequest {
    #[serde(default)]
    pub refresh_token: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateNoteRequest {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(rename = "type", default)]
    pub note_type: String,
    #[serde(default)]
    pub device_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateNoteRequest {
    pub title: Option<String>,
    pub content: Option<String>,
    #[serde(rename = "type")]
    pub note_type: Option<String>,
    #[serde(default)]
    pub device_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateTodoRequest {
    pub note_id: Option<String>,
    pub line_ref: Option<String>,
    #[serde(default)]
    pub content: String,
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub device_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateTodoRequest {
    pub content: Option<String>,
    pub due_date: Option<DateTime<Utc>>,
    pub completed: Option<bool>,
    pub note_id: Option<String>,
    pub line_ref: Option<String>,
    #[serde(default)]
    pub device_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncPushRequest {
    #[serde(default)]
    pub notes: Vec<Note>,
    #[serde(default)]
    pub todos: Vec<Todo>,
    #[serde(default)]
    pub device_id: String,
}

// Response types

#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub user: User,
}

#[derive(Debug, Serialize)]
pub struct NoteListResponse {
    pub notes: Vec<Note>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Serialize)]
pub struct TodoListResponse {
    pub todos: Vec<Todo>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Serialize)]
pub struct SyncChangesResponse {
    pub notes: Vec<Note>,
    pub todos: Vec<Todo>,
    pub sync_timestamp: i64,
}

#[derive(Debug, Serialize)]
pub struct SyncPushResponse {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<SyncConflict>,
    pub accepted: i64,
    pub sync_timestamp: i64,
}

/// A record the server refused because its copy is at least as new.
/// The server copy rides along so the client can reconcile locally.
#[derive(Debug, Serialize)]
pub struct SyncConflict {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_note: Option<Note>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_todo: Option<Todo>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(msg: impl Into<String>) -> Self {
        Self { error: msg.into() }
    }
}
