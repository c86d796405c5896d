use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

use crate::models::{now_millis, Note, RefreshToken, Todo, User};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Thread-safe SQLite store. All note/todo queries are scoped to a
/// `user_id` so one tenant can never observe another's records.
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the database at the given path.
    pub fn new(db_path: &str) -> StoreResult<Self> {
        let conn = Connection::open(db_path)?;
        Self::init(conn)
    }

    /// In-memory store for tests.
    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> StoreResult<Self> {
        let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.busy_timeout(Duration::from_secs(5))?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id            TEXT PRIMARY KEY,
                email         TEXT UNIQUE NOT NULL,
                password_hash TEXT NOT NULL,
                display_name  TEXT NOT NULL,
                created_at    INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS notes (
                id                 TEXT PRIMARY KEY,
                user_id            TEXT NOT NULL REFERENCES users(id),
                title              TEXT NOT NULL DEFAULT '',
                content            TEXT NOT NULL DEFAULT '',
                type               TEXT NOT NULL DEFAULT 'note' CHECK(type IN ('note', 'todo_list')),
                modified_at        INTEGER NOT NULL,
                modified_by_device TEXT NOT NULL,
                deleted_at         INTEGER,
                created_at         INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_notes_user_id ON notes(user_id);
            CREATE INDEX IF NOT EXISTS idx_notes_modified_at ON notes(modified_at);
            CREATE INDEX IF NOT EXISTS idx_notes_deleted_at ON notes(deleted_at);

            CREATE TABLE IF NOT EXISTS todos (
                id                 TEXT PRIMARY KEY,
                user_id            TEXT NOT NULL REFERENCES users(id),
                note_id            TEXT REFERENCES notes(id),
                line_ref           TEXT,
                content            TEXT NOT NULL DEFAULT '',
                due_date           INTEGER,
                completed          INTEGER NOT NULL DEFAULT 0,
                modified_at        INTEGER NOT NULL,
                modified_by_device TEXT NOT NULL,
                deleted_at         INTEGER,
                created_at         INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_todos_user_id ON todos(user_id);
            CREATE INDEX IF NOT EXISTS idx_todos_modified_at ON todos(modified_at);
            CREATE INDEX IF NOT EXISTS idx_todos_deleted_at ON todos(deleted_at);
            CREATE INDEX IF NOT EXISTS idx_todos_due_date ON todos(due_date);

            CREATE TABLE IF NOT EXISTS refresh_tokens (
                id         TEXT PRIMARY KEY,
                user_id    TEXT NOT NULL REFERENCES users(id),
                device_id  TEXT NOT NULL,
                token_hash TEXT NOT NULL,
                expires_at INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_refresh_tokens_user_id ON refresh_tokens(user_id);
            "#,
        )?;
        Ok(())
    }

    // ==================== User Operations ====================

    pub fn create_user(&self, user: &User) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let result = conn.execute(
            r#"INSERT INTO users (id, email, password_hash, display_name, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5)"#,
            params![
                &user.id,
                &user.email,
                &user.password_hash,
                &user.display_name,
                to_millis(user.created_at),
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::Conflict(format!("email {}", user.email)))
            }
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    pub fn get_user(&self, id: &str) -> StoreResult<User> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, email, password_hash, display_name, created_at FROM users WHERE id = ?1",
            params![id],
            row_to_user,
        )
        .map_err(|e| not_found_or(e, format!("user {}", id)))
    }

    pub fn get_user_by_email(&self, email: &str) -> StoreResult<User> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, email, password_hash, display_name, created_at FROM users WHERE email = ?1",
            params![email],
            row_to_user,
        )
        .map_err(|e| not_found_or(e, format!("user {}", email)))
    }

    // ==================== Note Operations ====================

    pub fn create_note(&self, note: &Note) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"INSERT INTO notes (id, user_id, title, content, type, modified_at,
               modified_by_device, deleted_at, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"#,
            params![
                &note.id,
                &note.user_id,
                &note.title,
                &note.content,
                &note.note_type,
                to_millis(note.modified_at),
                &note.modified_by_device,
                note.deleted_at.map(to_millis),
                to_millis(note.created_at),
            ],
        )?;
        Ok(())
    }

    /// Visible notes only. Sync paths use [`Store::get_note_any`].
    pub fn get_note(&self, id: &str, user_id: &str) -> StoreResult<Note> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!("{} WHERE id = ?1 AND user_id = ?2 AND deleted_at IS NULL", SELECT_NOTE),
            params![id, user_id],
            row_to_note,
        )
        .map_err(|e| not_found_or(e, format!("note {}", id)))
    }

    /// Like [`Store::get_note`] but ignores the tombstone flag.
    pub fn get_note_any(&self, id: &str, user_id: &str) -> StoreResult<Note> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!("{} WHERE id = ?1 AND user_id = ?2", SELECT_NOTE),
            params![id, user_id],
            row_to_note,
        )
        .map_err(|e| not_found_or(e, format!("note {}", id)))
    }

    pub fn list_notes(&self, user_id: &str, limit: i64, offset: i64) -> StoreResult<(Vec<Note>, i64)> {
        let conn = self.conn.lock().unwrap();
        let total: i64 = conn.query_row(
            "SELECT COUNT(*) FROM notes WHERE user_id = ?1 AND deleted_at IS NULL",
            params![user_id],
            |row| row.get(0),
        )?;

        let mut stmt = conn.prepare(&format!(
            "{} WHERE user_id = ?1 AND deleted_at IS NULL
             ORDER BY modified_at DESC LIMIT ?2 OFFSET ?3",
            SELECT_NOTE
        ))?;
        let rows = stmt.query_map(params![user_id, limit, offset], row_to_note)?;

        let mut notes = Vec::new();
        for row in rows {
            notes.push(row?);
        }
        Ok((notes, total))
    }

    pub fn update_note(&self, note: &Note) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let rows = conn.execute(
            r#"UPDATE notes SET title = ?1, content = ?2, type = ?3, modified_at = ?4,
               modified_by_device = ?5
               WHERE id = ?6 AND user_id = ?7 AND deleted_at IS NULL"#,
            params![
                &note.title,
                &note.content,
                &note.note_type,
                to_millis(note.modified_at),
                &note.modified_by_device,
                &note.id,
                &note.user_id,
            ],
        )?;
        if rows == 0 {
            return Err(StoreError::NotFound(format!("note {}", note.id)));
        }
        Ok(())
    }

    /// Soft delete: stamps `deleted_at` and `modified_at` with the same
    /// value so the tombstone sorts correctly in the change feed.
    pub fn delete_note(&self, id: &str, user_id: &str, deleted_at: DateTime<Utc>, device_id: &str) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let ms = to_millis(deleted_at);
        let rows = conn.execute(
            r#"UPDATE notes SET deleted_at = ?1, modified_at = ?2, modified_by_device = ?3
               WHERE id = ?4 AND user_id = ?5 AND deleted_at IS NULL"#,
            params![ms, ms, device_id, id, user_id],
        )?;
        if rows == 0 {
            return Err(StoreError::NotFound(format!("note {}", id)));
        }
        Ok(())
    }

    /// Byte-wise substring match on title or content of visible notes.
    /// `instr()` rather than LIKE keeps the match case-sensitive.
    pub fn search_notes(&self, user_id: &str, query: &str, limit: i64, offset: i64) -> StoreResult<(Vec<Note>, i64)> {
        let conn = self.conn.lock().unwrap();
        let total: i64 = conn.query_row(
            r#"SELECT COUNT(*) FROM notes
               WHERE user_id = ?1 AND deleted_at IS NULL
                 AND (instr(title, ?2) > 0 OR instr(content, ?2) > 0)"#,
            params![user_id, query],
            |row| row.get(0),
        )?;

        let mut stmt = conn.prepare(&format!(
            "{} WHERE user_id = ?1 AND deleted_at IS NULL
               AND (instr(title, ?2) > 0 OR instr(content, ?2) > 0)
             ORDER BY modified_at DESC LIMIT ?3 OFFSET ?4",
            SELECT_NOTE
        ))?;
        let rows = stmt.query_map(params![user_id, query, limit, offset], row_to_note)?;

        let mut notes = Vec::new();
        for row in rows {
            notes.push(row?);
        }
        Ok((notes, total))
    }

    /// Every note modified strictly after `since_ms`, tombstones
    /// included, oldest first. Strictly greater-than keeps a cursor
    /// taken from a previous pull safe to replay.
    pub fn note_changes_since(&self, user_id: &str, since_ms: i64) -> StoreResult<Vec<Note>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "{} WHERE user_id = ?1 AND modified_at > ?2 ORDER BY modified_at ASC",
            SELECT_NOTE
        ))?;
        let rows = stmt.query_map(params![user_id, since_ms], row_to_note)?;

        let mut notes = Vec::new();
        for row in rows {
            notes.push(row?);
        }
        Ok(notes)
    }

    /// Insert-or-update under last-write-wins. Returns the server copy
    /// when the incoming record loses (equal timestamps lose too), or
    /// `None` when it was accepted.
    pub fn upsert_note(&self, note: &Note) -> StoreResult<Option<Note>> {
        let existing = match self.get_note_any(&note.id, &note.user_id) {
            Ok(n) => n,
            Err(StoreError::NotFound(_)) => {
                self.create_note(note)?;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        if note.modified_at > existing.modified_at {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                r#"UPDATE notes SET title = ?1, content = ?2, type = ?3, modified_at = ?4,
                   modified_by_device = ?5, deleted_at = ?6
                   WHERE id = ?7 AND user_id = ?8"#,
                params![
                    &note.title,
                    &note.content,
                    &note.note_type,
                    to_millis(note.modified_at),
                    &note.modified_by_device,
                    note.deleted_at.map(to_millis),
                    &note.id,
                    &note.user_id,
                ],
            )?;
            return Ok(None);
        }

        Ok(Some(existing))
    }

    // ==================== Todo Operations ====================

    pub fn create_todo(&self, todo: &Todo) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"INSERT INTO todos (id, user_id, note_id, line_ref, content, due_date, completed,
               modified_at, modified_by_device, deleted_at, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"#,
            params![
                &todo.id,
                &todo.user_id,
                &todo.note_id,
                &todo.line_ref,
                &todo.content,
                todo.due_date.map(to_millis),
                todo.completed,
                to_millis(todo.modified_at),
                &todo.modified_by_device,
                todo.deleted_at.map(to_millis),
                to_millis(todo.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_todo(&self, id: &str, user_id: &str) -> StoreResult<Todo> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!("{} WHERE id = ?1 AND user_id = ?2 AND deleted_at IS NULL", SELECT_TODO),
            params![id, user_id],
            row_to_todo,
        )
        .map_err(|e| not_found_or(e, format!("todo {}", id)))
    }

    pub fn get_todo_any(&self, id: &str, user_id: &str) -> StoreResult<Todo> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!("{} WHERE id = ?1 AND user_id = ?2", SELECT_TODO),
            params![id, user_id],
            row_to_todo,
        )
        .map_err(|e| not_found_or(e, format!("todo {}", id)))
    }

    pub fn list_todos(&self, user_id: &str, limit: i64, offset: i64) -> StoreResult<(Vec<Todo>, i64)> {
        let conn = self.conn.lock().unwrap();
        let total: i64 = conn.query_row(
            "SELECT COUNT(*) FROM todos WHERE user_id = ?1 AND deleted_at IS NULL",
            params![user_id],
            |row| row.get(0),
        )?;

        let mut stmt = conn.prepare(&format!(
            "{} WHERE user_id = ?1 AND deleted_at IS NULL
             ORDER BY modified_at DESC LIMIT ?2 OFFSET ?3",
            SELECT_TODO
        ))?;
        let rows = stmt.query_map(params![user_id, limit, offset], row_to_todo)?;

        let mut todos = Vec::new();
        for row in rows {
            todos.push(row?);
        }
        Ok((todos, total))
    }

    pub fn update_todo(&self, todo: &Todo) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let rows = conn.execute(
            r#"UPDATE todos SET note_id = ?1, line_ref = ?2, content = ?3, due_date = ?4,
               completed = ?5, modified_at = ?6, modified_by_device = ?7
               WHERE id = ?8 AND user_id = ?9 AND deleted_at IS NULL"#,
            params![
                &todo.note_id,
                &todo.line_ref,
                &todo.content,
                todo.due_date.map(to_millis),
                todo.completed,
                to_millis(todo.modified_at),
                &todo.modified_by_device,
                &todo.id,
                &todo.user_id,
            ],
        )?;
        if rows == 0 {
            return Err(StoreError::NotFound(format!("todo {}", todo.id)));
        }
        Ok(())
    }

    pub fn delete_todo(&self, id: &str, user_id: &str, deleted_at: DateTime<Utc>, device_id: &str) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let ms = to_millis(deleted_at);
        let rows = conn.execute(
            r#"UPDATE todos SET deleted_at = ?1, modified_at = ?2, modified_by_device = ?3
               WHERE id = ?4 AND user_id = ?5 AND deleted_at IS NULL"#,
            params![ms, ms, device_id, id, user_id],
        )?;
        if rows == 0 {
            return Err(StoreError::NotFound(format!("todo {}", id)));
        }
        Ok(())
    }

    /// Visible, uncompleted todos whose due date has passed, soonest first.
    pub fn overdue_todos(&self, user_id: &str) -> StoreResult<Vec<Todo>> {
        let conn = self.conn.lock().unwrap();
        let now = to_millis(now_millis());
        let mut stmt = conn.prepare(&format!(
            "{} WHERE user_id = ?1 AND deleted_at IS NULL AND completed = 0
               AND due_date IS NOT NULL AND due_date < ?2
             ORDER BY due_date ASC",
            SELECT_TODO
        ))?;
        let rows = stmt.query_map(params![user_id, now], row_to_todo)?;

        let mut todos = Vec::new();
        for row in rows {
            todos.push(row?);
        }
        Ok(todos)
    }

    pub fn todo_changes_since(&self, user_id: &str, since_ms: i64) -> StoreResult<Vec<Todo>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "{} WHERE user_id = ?1 AND modified_at > ?2 ORDER BY modified_at ASC",
            SELECT_TODO
        ))?;
        let rows = stmt.query_map(params![user_id, since_ms], row_to_todo)?;

        let mut todos = Vec::new();
        for row in rows {
            todos.push(row?);
        }
        Ok(todos)
    }

    pub fn upsert_todo(&self, todo: &Todo) -> StoreResult<Option<Todo>> {
        let existing = match self.get_todo_any(&todo.id, &todo.user_id) {
            Ok(t) => t,
            Err(StoreError::NotFound(_)) => {
                self.create_todo(todo)?;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        if todo.modified_at > existing.modified_at {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                r#"UPDATE todos SET note_id = ?1, line_ref = ?2, content = ?3, due_date = ?4,
                   completed = ?5, modified_at = ?6, modified_by_device = ?7, deleted_at = ?8
                   WHERE id = ?9 AND user_id = ?10"#,
                params![
                    &todo.note_id,
                    &todo.line_ref,
                    &todo.content,
                    todo.due_date.map(to_millis),
                    todo.completed,
                    to_millis(todo.modified_at),
                    &todo.modified_by_device,
                    todo.deleted_at.map(to_millis),
                    &todo.id,
                    &todo.user_id,
                ],
            )?;
            return Ok(None);
        }

        Ok(Some(existing))
    }

    // ==================== Refresh Token Operations ====================

    pub fn create_refresh_token(&self, token: &RefreshToken) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"INSERT INTO refresh_tokens (id, user_id, device_id, token_hash, expires_at, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6)"#,
            params![
                &token.id,
                &token.user_id,
                &token.device_id,
                &token.token_hash,
                to_millis(token.expires_at),
                to_millis(token.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_refresh_token_by_hash(&self, token_hash: &str) -> StoreResult<RefreshToken> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            r#"SELECT id, user_id, device_id, token_hash, expires_at, created_at
               FROM refresh_tokens WHERE token_hash = ?1"#,
            params![token_hash],
            |row| {
                Ok(RefreshToken {
                    id: row.get("id")?,
                    user_id: row.get("user_id")?,
                    device_id: row.get("device_id")?,
                    token_hash: row.get("token_hash")?,
                    expires_at: from_millis(row.get("expires_at")?),
                    created_at: from_millis(row.get("created_at")?),
                })
            },
        )
        .map_err(|e| not_found_or(e, "refresh token".to_string()))
    }

    pub fn delete_refresh_token(&self, id: &str) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM refresh_tokens WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub fn delete_refresh_tokens_for_user(&self, user_id: &str) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM refresh_tokens WHERE user_id = ?1",
            params![user_id],
        )?;
        Ok(())
    }

    /// Purge expired token rows. Returns the number removed.
    pub fn delete_expired_refresh_tokens(&self) -> StoreResult<usize> {
        let conn = self.conn.lock().unwrap();
        let now = to_millis(now_millis());
        let rows = conn.execute(
            "DELETE FROM refresh_tokens WHERE expires_at < ?1",
            params![now],
        )?;
        Ok(rows)
    }
}

const SELECT_NOTE: &str = "SELECT id, user_id, title, content, type, modified_at, \
     modified_by_device, deleted_at, created_at FROM notes";

const SELECT_TODO: &str = "SELECT id, user_id, note_id, line_ref, content, due_date, completed, \
     modified_at, modified_by_device, deleted_at, created_at FROM todos";

// Timestamp helpers: DateTime<Utc> <-> INTEGER unix milliseconds.

fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn from_null_millis(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.and_then(DateTime::from_timestamp_millis)
}

fn not_found_or(e: rusqlite::Error, what: String) -> StoreError {
    match e {
        rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound(what),
        _ => StoreError::Database(e),
    }
}

fn row_to_user(row: &rusqlite::Row) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get("id")?,
        email: row.get("email")?,
        password_hash: row.get("password_hash")?,
        display_name: row.get("display_name")?,
        created_at: from_millis(row.get("created_at")?),
    })
}

fn row_to_note(row: &rusqlite::Row) -> rusqlite::Result<Note> {
    Ok(Note {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        title: row.get("title")?,
        content: row.get("content")?,
        note_type: row.get("type")?,
        modified_at: from_millis(row.get("modified_at")?),
        modified_by_device: row.get("modified_by_device")?,
        deleted_at: from_null_millis(row.get("deleted_at")?),
        created_at: from_millis(row.get("created_at")?),
    })
}

fn row_to_todo(row: &rusqlite::Row) -> rusqlite::Result<Todo> {
    Ok(Todo {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        note_id: row.get("note_id")?,
        line_ref: row.get("line_ref")?,
        content: row.get("content")?,
        due_date: from_null_millis(row.get("due_date")?),
        completed: row.get("completed")?,
        modified_at: from_millis(row.get("modified_at")?),
        modified_by_device: row.get("modified_by_device")?,
        deleted_at: from_null_millis(row.get("deleted_at")?),
        created_at: from_millis(row.get("created_at")?),
    })
}
