//! Delta synchronization between the server and offline-first clients.
//!
//! Pull: the client presents the `sync_timestamp` from its previous pull
//! and receives every record modified after it, tombstones included.
//! Push: the client sends locally-modified records and each one is
//! accepted or rejected under last-write-wins on `modified_at`.

use std::sync::Arc;

use crate::models::{now_millis, Note, SyncChangesResponse, SyncConflict, SyncPushResponse, Todo};
use crate::store::{Store, StoreResult};

pub struct SyncEngine {
    store: Arc<Store>,
}

impl SyncEngine {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Every note and todo of `user_id` modified strictly after
    /// `since_ms`. The returned `sync_timestamp` is read after both
    /// queries complete, so it is safe as the next pull's cursor.
    pub fn changes_since(&self, user_id: &str, since_ms: i64) -> StoreResult<SyncChangesResponse> {
        let notes = self.store.note_changes_since(user_id, since_ms)?;
        let todos = self.store.todo_changes_since(user_id, since_ms)?;

        Ok(SyncChangesResponse {
            notes,
            todos,
            sync_timestamp: now_millis().timestamp_millis(),
        })
    }

    /// Apply a pushed batch under LWW. The record's `user_id` is forced
    /// to the authenticated user before anything touches the store; the
    /// body is never trusted for tenancy. A record with a strictly newer
    /// `modified_at` than the server copy overwrites it (including
    /// `deleted_at`, so deletions and undeletes propagate); anything
    /// else is reported back as a conflict carrying the server copy.
    ///
    /// Errors abort the whole call. The batch is idempotent under LWW,
    /// so the client simply retries it.
    pub fn apply_batch(
        &self,
        user_id: &str,
        mut notes: Vec<Note>,
        mut todos: Vec<Todo>,
    ) -> StoreResult<SyncPushResponse> {
        let mut conflicts = Vec::new();
        let mut accepted = 0;

        for note in &mut notes {
            note.user_id = user_id.to_string();
            match self.store.upsert_note(note)? {
                None => accepted += 1,
                Some(server_copy) => conflicts.push(SyncConflict {
                    kind: "note".to_string(),
                    id: note.id.clone(),
                    server_note: Some(server_copy),
                    server_todo: None,
                }),
            }
        }

        for todo in &mut todos {
            todo.user_id = user_id.to_string();
            match self.store.upsert_todo(todo)? {
                None => accepted += 1,
                Some(server_copy) => conflicts.push(SyncConflict {
                    kind: "todo".to_string(),
                    id: todo.id.clone(),
                    server_note: None,
                    server_todo: Some(server_copy),
                }),
            }
        }

        Ok(SyncPushResponse {
            conflicts,
            accepted,
            sync_timestamp: now_millis().timestamp_millis(),
        })
    }
}
