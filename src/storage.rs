//! SQLite persistence for users, chats, messages and friendships.
//!
//! The relay only ever talks to storage through the [`Store`] trait, so the
//! in-memory registries never depend on how records are kept. [`SqliteStore`]
//! is the production implementation.

use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::info;

use crate::error::StorageError;
use crate::model::{Chat, FriendRequest, FriendRequestStatus, Message, User};

pub type StorageResult<T> = Result<T, StorageError>;

/// Narrow storage contract used by the relay.
///
/// Every call may fail independently of the in-memory state; callers must
/// not mutate registries based on a failed call.
pub trait Store: Send + Sync {
    /// Create the user, or update its name if it already exists.
    fn upsert_user(&self, user: &User) -> StorageResult<()>;
    fn get_user(&self, id: &str) -> StorageResult<Option<User>>;
    /// Full roster, ordered by id.
    fn list_users(&self) -> StorageResult<Vec<User>>;

    /// Insert the chat if no chat with that id exists. Existing records are left untouched.
    fn ensure_chat(&self, chat: &Chat) -> StorageResult<()>;
    fn get_chat(&self, id: &str) -> StorageResult<Option<Chat>>;
    /// Chats the user participates in plus every public chat.
    fn chats_for_user(&self, user_id: &str) -> StorageResult<Vec<Chat>>;

    /// Append a message. Storage assigns the id and a timestamp that never
    /// goes backwards within the chat.
    fn insert_message(&self, chat_id: &str, sender_id: &str, content: &str) -> StorageResult<Message>;
    /// [`Store::ensure_chat`] plus [`Store::insert_message`] in one
    /// transaction, so a failed insert leaves no new chat behind.
    fn insert_message_creating_chat(&self, chat: &Chat, sender_id: &str, content: &str) -> StorageResult<Message>;
    /// All messages of a chat, oldest first.
    fn chat_messages(&self, chat_id: &str) -> StorageResult<Vec<Message>>;

    /// Create a pending request. Returns `None` if one is already pending
    /// for this ordered pair.
    fn create_friend_request(&self, sender_id: &str, receiver_id: &str) -> StorageResult<Option<FriendRequest>>;
    fn pending_request(&self, sender_id: &str, receiver_id: &str) -> StorageResult<Option<FriendRequest>>;
    /// Pending requests where the user is either sender or receiver.
    fn pending_requests_for(&self, user_id: &str) -> StorageResult<Vec<FriendRequest>>;
    /// Mark a pending request accepted and record the friendship, atomically.
    /// Returns false if the request was not pending.
    fn accept_friend_request(&self, request_id: i64) -> StorageResult<bool>;
    /// Mark a pending request rejected. Returns false if it was not pending.
    fn reject_friend_request(&self, request_id: i64) -> StorageResult<bool>;

    fn are_friends(&self, a: &str, b: &str) -> StorageResult<bool>;
    /// Remove the friendship in either ordering. Returns true if a row was deleted.
    fn remove_friendship(&self, a: &str, b: &str) -> StorageResult<bool>;
    fn friends_of(&self, user_id: &str) -> StorageResult<Vec<User>>;
}

/// Persistent storage backed by SQLite.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the database at the given path.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrent read/write performance.
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        let store = Self::with_connection(conn)?;
        info!("Database opened: {}", path.display());
        Ok(store)
    }

    /// Fresh in-memory database. Used by tests and ephemeral deployments.
    pub fn open_in_memory() -> StorageResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> StorageResult<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                id   TEXT PRIMARY KEY,
                name TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS chats (
                id           TEXT PRIMARY KEY,
                participants TEXT NOT NULL DEFAULT '[]',
                is_private   INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS messages (
                id        INTEGER PRIMARY KEY AUTOINCREMENT,
                chat_id   TEXT NOT NULL,
                sender_id TEXT NOT NULL,
                content   TEXT NOT NULL,
                timestamp INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_messages_chat
                ON messages(chat_id, timestamp, id);

            -- Friendships are stored once per pair with user_a < user_b.
            CREATE TABLE IF NOT EXISTS friendships (
                user_a     TEXT NOT NULL,
                user_b     TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (user_a, user_b)
            );

            CREATE TABLE IF NOT EXISTS friend_requests (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                sender_id   TEXT NOT NULL,
                receiver_id TEXT NOT NULL,
                status      TEXT NOT NULL DEFAULT 'pending',
                created_at  INTEGER NOT NULL,
                updated_at  INTEGER NOT NULL
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_friend_requests_pending
                ON friend_requests(sender_id, receiver_id)
                WHERE status = 'pending';
            CREATE INDEX IF NOT EXISTS idx_friend_requests_receiver
                ON friend_requests(receiver_id, status);",
        )?;

        Ok(Self { conn: Mutex::new(conn) })
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StorageError::Poisoned)
    }

    /// Run raw SQL against the database. Tests use this to simulate a
    /// failing backing store.
    #[cfg(test)]
    pub(crate) fn execute_raw(&self, sql: &str) -> StorageResult<()> {
        self.lock()?.execute_batch(sql)?;
        Ok(())
    }
}

/// Order a pair so a friendship has exactly one row.
fn ordered<'a>(a: &'a str, b: &'a str) -> (&'a str, &'a str) {
    if a <= b { (a, b) } else { (b, a) }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn encode_participants(chat: &Chat) -> StorageResult<String> {
    serde_json::to_string(&chat.participants).map_err(|e| StorageError::Corrupt {
        column: "chats.participants",
        reason: e.to_string(),
    })
}

/// Append to a chat's log. The timestamp is clamped to the chat's latest
/// one so the log never goes backwards when the wall clock does.
fn append_message(conn: &Connection, chat_id: &str, sender_id: &str, content: &str) -> StorageResult<Message> {
    let last: i64 = conn.query_row(
        "SELECT COALESCE(MAX(timestamp), 0) FROM messages WHERE chat_id = ?1",
        params![chat_id],
        |row| row.get(0),
    )?;
    let timestamp = now_millis().max(last as u64);
    conn.execute(
        "INSERT INTO messages (chat_id, sender_id, content, timestamp) VALUES (?1, ?2, ?3, ?4)",
        params![chat_id, sender_id, content, timestamp as i64],
    )?;
    Ok(Message {
        id: conn.last_insert_rowid(),
        chat_id: chat_id.to_string(),
        sender_id: sender_id.to_string(),
        content: content.to_string(),
        timestamp,
    })
}

/// Raw chat row, decoded outside the rusqlite row closure so JSON errors
/// keep their own error variant.
type ChatRow = (String, String, bool);

fn decode_chat((id, participants, is_private): ChatRow) -> StorageResult<Chat> {
    let participants: Vec<String> =
        serde_json::from_str(&participants).map_err(|e| StorageError::Corrupt {
            column: "chats.participants",
            reason: e.to_string(),
        })?;
    Ok(Chat { id, participants, is_private })
}

fn map_message_row(row: &rusqlite::Row) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        sender_id: row.get(2)?,
        content: row.get(3)?,
        timestamp: row.get::<_, i64>(4)? as u64,
    })
}

type RequestRow = (i64, String, String, String);

fn decode_request((id, sender_id, receiver_id, status): RequestRow) -> StorageResult<FriendRequest> {
    let status = status
        .parse::<FriendRequestStatus>()
        .map_err(|reason| StorageError::Corrupt { column: "friend_requests.status", reason })?;
    Ok(FriendRequest { id, sender_id, receiver_id, status })
}

impl Store for SqliteStore {
    fn upsert_user(&self, user: &User) -> StorageResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO users (id, name) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET name = ?2",
            params![user.id, user.name],
        )?;
        Ok(())
    }

    fn get_user(&self, id: &str) -> StorageResult<Option<User>> {
        let conn = self.lock()?;
        let user = conn
            .query_row(
                "SELECT id, name FROM users WHERE id = ?1",
                params![id],
                |row| Ok(User { id: row.get(0)?, name: row.get(1)? }),
            )
            .optional()?;
        Ok(user)
    }

    fn list_users(&self) -> StorageResult<Vec<User>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT id, name FROM users ORDER BY id")?;
        let users = stmt
            .query_map([], |row| Ok(User { id: row.get(0)?, name: row.get(1)? }))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(users)
    }

    fn ensure_chat(&self, chat: &Chat) -> StorageResult<()> {
        let participants = encode_participants(chat)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO chats (id, participants, is_private) VALUES (?1, ?2, ?3)",
            params![chat.id, participants, chat.is_private],
        )?;
        Ok(())
    }

    fn get_chat(&self, id: &str) -> StorageResult<Option<Chat>> {
        let row: Option<ChatRow> = {
            let conn = self.lock()?;
            conn.query_row(
                "SELECT id, participants, is_private FROM chats WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?
        };
        row.map(decode_chat).transpose()
    }

    fn chats_for_user(&self, user_id: &str) -> StorageResult<Vec<Chat>> {
        let rows: Vec<ChatRow> = {
            let conn = self.lock()?;
            let mut stmt = conn.prepare("SELECT id, participants, is_private FROM chats ORDER BY id")?;
            stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
                .collect::<Result<Vec<_>, _>>()?
        };
        let mut chats = Vec::new();
        for row in rows {
            let chat = decode_chat(row)?;
            if !chat.is_private || chat.has_participant(user_id) {
                chats.push(chat);
            }
        }
        Ok(chats)
    }

    fn insert_message(&self, chat_id: &str, sender_id: &str, content: &str) -> StorageResult<Message> {
        let conn = self.lock()?;
        append_message(&conn, chat_id, sender_id, content)
    }

    fn insert_message_creating_chat(&self, chat: &Chat, sender_id: &str, content: &str) -> StorageResult<Message> {
        let participants = encode_participants(chat)?;
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO chats (id, participants, is_private) VALUES (?1, ?2, ?3)",
            params![chat.id, participants, chat.is_private],
        )?;
        let message = append_message(&tx, &chat.id, sender_id, content)?;
        tx.commit()?;
        Ok(message)
    }

    fn chat_messages(&self, chat_id: &str) -> StorageResult<Vec<Message>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, chat_id, sender_id, content, timestamp FROM messages
             WHERE chat_id = ?1
             ORDER BY timestamp ASC, id ASC",
        )?;
        let messages = stmt
            .query_map(params![chat_id], map_message_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(messages)
    }

    fn create_friend_request(&self, sender_id: &str, receiver_id: &str) -> StorageResult<Option<FriendRequest>> {
        let conn = self.lock()?;
        let now = now_millis() as i64;
        let rows = conn.execute(
            "INSERT OR IGNORE INTO friend_requests (sender_id, receiver_id, status, created_at, updated_at)
             VALUES (?1, ?2, 'pending', ?3, ?3)",
            params![sender_id, receiver_id, now],
        )?;
        if rows == 0 {
            return Ok(None);
        }
        Ok(Some(FriendRequest {
            id: conn.last_insert_rowid(),
            sender_id: sender_id.to_string(),
            receiver_id: receiver_id.to_string(),
            status: FriendRequestStatus::Pending,
        }))
    }

    fn pending_request(&self, sender_id: &str, receiver_id: &str) -> StorageResult<Option<FriendRequest>> {
        let row: Option<RequestRow> = {
            let conn = self.lock()?;
            conn.query_row(
                "SELECT id, sender_id, receiver_id, status FROM friend_requests
                 WHERE sender_id = ?1 AND receiver_id = ?2 AND status = 'pending'",
                params![sender_id, receiver_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?
        };
        row.map(decode_request).transpose()
    }

    fn pending_requests_for(&self, user_id: &str) -> StorageResult<Vec<FriendRequest>> {
        let rows: Vec<RequestRow> = {
            let conn = self.lock()?;
            let mut stmt = conn.prepare(
                "SELECT id, sender_id, receiver_id, status FROM friend_requests
                 WHERE (sender_id = ?1 OR receiver_id = ?1) AND status = 'pending'
                 ORDER BY id ASC",
            )?;
            stmt.query_map(params![user_id], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?
            .collect::<Result<Vec<_>, _>>()?
        };
        rows.into_iter().map(decode_request).collect()
    }

    fn accept_friend_request(&self, request_id: i64) -> StorageResult<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let now = now_millis() as i64;

        let pair: Option<(String, String)> = tx
            .query_row(
                "SELECT sender_id, receiver_id FROM friend_requests WHERE id = ?1 AND status = 'pending'",
                params![request_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((sender_id, receiver_id)) = pair else {
            return Ok(false);
        };

        tx.execute(
            "UPDATE friend_requests SET status = 'accepted', updated_at = ?2 WHERE id = ?1",
            params![request_id, now],
        )?;
        // A crossing request in the other direction is settled by this one.
        tx.execute(
            "UPDATE friend_requests SET status = 'accepted', updated_at = ?3
             WHERE sender_id = ?1 AND receiver_id = ?2 AND status = 'pending'",
            params![receiver_id, sender_id, now],
        )?;
        let (a, b) = ordered(&sender_id, &receiver_id);
        tx.execute(
            "INSERT OR IGNORE INTO friendships (user_a, user_b, created_at) VALUES (?1, ?2, ?3)",
            params![a, b, now],
        )?;
        tx.commit()?;
        Ok(true)
    }

    fn reject_friend_request(&self, request_id: i64) -> StorageResult<bool> {
        let conn = self.lock()?;
        let rows = conn.execute(
            "UPDATE friend_requests SET status = 'rejected', updated_at = ?2
             WHERE id = ?1 AND status = 'pending'",
            params![request_id, now_millis() as i64],
        )?;
        Ok(rows > 0)
    }

    fn are_friends(&self, a: &str, b: &str) -> StorageResult<bool> {
        let conn = self.lock()?;
        let (a, b) = ordered(a, b);
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM friendships WHERE user_a = ?1 AND user_b = ?2",
            params![a, b],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn remove_friendship(&self, a: &str, b: &str) -> StorageResult<bool> {
        let conn = self.lock()?;
        let (a, b) = ordered(a, b);
        let rows = conn.execute(
            "DELETE FROM friendships WHERE user_a = ?1 AND user_b = ?2",
            params![a, b],
        )?;
        Ok(rows > 0)
    }

    fn friends_of(&self, user_id: &str) -> StorageResult<Vec<User>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT u.id, u.name FROM friendships f
             JOIN users u ON u.id = CASE WHEN f.user_a = ?1 THEN f.user_b ELSE f.user_a END
             WHERE f.user_a = ?1 OR f.user_b = ?1
             ORDER BY u.name, u.id",
        )?;
        let friends = stmt
            .query_map(params![user_id], |row| Ok(User { id: row.get(0)?, name: row.get(1)? }))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(friends)
    }
}
