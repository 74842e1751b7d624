//! Storage layer for the moderation core
//!
//! Thin accessors over a handful of SQLite tables: the global ban list,
//! per-chat enforcement settings, per-user chat connections with a bounded
//! history, and the registry of chats the bot has seen.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use thiserror::Error;
use tracing::info;

/// Maximum number of connection-history entries kept per user
pub const HISTORY_LIMIT: i64 = 5;

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StoreError {
    /// Underlying database error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// A globally banned user
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct GbanEntry {
    /// Telegram user ID
    pub user_id: i64,
    /// Last known display name
    pub display_name: String,
    /// Ban reason, if one was given
    pub reason: Option<String>,
}

/// One entry of a user's connection history, newest first
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct HistoryEntry {
    /// Chat the user connected to
    pub chat_id: i64,
    /// Chat title at the time of connecting
    pub chat_name: String,
    /// When the connection was made
    pub connected_at: DateTime<Utc>,
}

/// SQLite-backed store owning all moderation-core tables
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) the database at `url` and run the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the database is unreachable.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(sqlx::Error::from)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        info!("Store initialized at {}", url);
        Ok(store)
    }

    /// In-memory store, used by tests.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool cannot be created.
    pub async fn in_memory() -> Result<Self, StoreError> {
        // A single connection so every query sees the same memory database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(
            r"
            CREATE TABLE IF NOT EXISTS gbans (
                user_id      INTEGER PRIMARY KEY,
                display_name TEXT NOT NULL,
                reason       TEXT
            );
            CREATE TABLE IF NOT EXISTS gban_settings (
                chat_id INTEGER PRIMARY KEY,
                enforce INTEGER NOT NULL DEFAULT 1
            );
            CREATE TABLE IF NOT EXISTS connection_settings (
                chat_id       INTEGER PRIMARY KEY,
                allow_members INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS connections (
                user_id INTEGER PRIMARY KEY,
                chat_id INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS connection_history (
                user_id      INTEGER NOT NULL,
                chat_id      INTEGER NOT NULL,
                chat_name    TEXT NOT NULL,
                connected_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS known_chats (
                chat_id INTEGER PRIMARY KEY,
                title   TEXT
            );
            ",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ---- global ban list ----

    /// Insert or overwrite a ban entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn add_gban(
        &self,
        user_id: i64,
        display_name: &str,
        reason: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO gbans (user_id, display_name, reason) VALUES (?, ?, ?)
             ON CONFLICT(user_id) DO UPDATE SET display_name = excluded.display_name,
                                                reason = excluded.reason",
        )
        .bind(user_id)
        .bind(display_name)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Replace the reason of an existing ban, returning the previous reason.
    ///
    /// # Errors
    ///
    /// Returns an error if the read or write fails.
    pub async fn update_gban_reason(
        &self,
        user_id: i64,
        display_name: &str,
        reason: &str,
    ) -> Result<Option<String>, StoreError> {
        let old: Option<Option<String>> =
            sqlx::query_scalar("SELECT reason FROM gbans WHERE user_id = ?")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        sqlx::query("UPDATE gbans SET display_name = ?, reason = ? WHERE user_id = ?")
            .bind(display_name)
            .bind(reason)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(old.flatten())
    }

    /// Delete a ban entry. Returns whether one existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn remove_gban(&self, user_id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM gbans WHERE user_id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Whether the user is globally banned.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub async fn is_gbanned(&self, user_id: i64) -> Result<bool, StoreError> {
        Ok(self.gban_entry(user_id).await?.is_some())
    }

    /// Fetch the ban entry for one user.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub async fn gban_entry(&self, user_id: i64) -> Result<Option<GbanEntry>, StoreError> {
        let entry = sqlx::query_as::<_, GbanEntry>(
            "SELECT user_id, display_name, reason FROM gbans WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(entry)
    }

    /// The whole ban list.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub async fn gban_list(&self) -> Result<Vec<GbanEntry>, StoreError> {
        let entries = sqlx::query_as::<_, GbanEntry>(
            "SELECT user_id, display_name, reason FROM gbans ORDER BY user_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }

    /// Number of globally banned users.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub async fn gban_count(&self) -> Result<i64, StoreError> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM gbans")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    // ---- per-chat gban enforcement ----

    /// Whether a chat enforces global bans. Defaults to true for chats
    /// that never toggled the setting.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub async fn chat_enforces_gban(&self, chat_id: i64) -> Result<bool, StoreError> {
        let enforce: Option<bool> =
            sqlx::query_scalar("SELECT enforce FROM gban_settings WHERE chat_id = ?")
                .bind(chat_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(enforce.unwrap_or(true))
    }

    /// Toggle gban enforcement for a chat.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn set_gban_enforcement(&self, chat_id: i64, enforce: bool) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO gban_settings (chat_id, enforce) VALUES (?, ?)
             ON CONFLICT(chat_id) DO UPDATE SET enforce = excluded.enforce",
        )
        .bind(chat_id)
        .bind(enforce)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ---- per-chat connection permissions ----

    /// Whether non-admin members may connect to this chat. Defaults to false.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub async fn allows_member_connections(&self, chat_id: i64) -> Result<bool, StoreError> {
        let allow: Option<bool> =
            sqlx::query_scalar("SELECT allow_members FROM connection_settings WHERE chat_id = ?")
                .bind(chat_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(allow.unwrap_or(false))
    }

    /// Toggle member connections for a chat.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn set_member_connections(&self, chat_id: i64, allow: bool) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO connection_settings (chat_id, allow_members) VALUES (?, ?)
             ON CONFLICT(chat_id) DO UPDATE SET allow_members = excluded.allow_members",
        )
        .bind(chat_id)
        .bind(allow)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ---- connections ----

    /// Create or overwrite the single active connection for a user.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn set_connection(&self, user_id: i64, chat_id: i64) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO connections (user_id, chat_id) VALUES (?, ?)
             ON CONFLICT(user_id) DO UPDATE SET chat_id = excluded.chat_id",
        )
        .bind(user_id)
        .bind(chat_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The chat a user is currently connected to, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub async fn connected_chat(&self, user_id: i64) -> Result<Option<i64>, StoreError> {
        let chat_id = sqlx::query_scalar("SELECT chat_id FROM connections WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(chat_id)
    }

    /// Delete the user's connection. Returns whether one existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn remove_connection(&self, user_id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM connections WHERE user_id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ---- connection history ----

    /// Append a history entry, evicting the oldest beyond [`HISTORY_LIMIT`].
    ///
    /// # Errors
    ///
    /// Returns an error if a write fails.
    pub async fn add_history(
        &self,
        user_id: i64,
        chat_id: i64,
        chat_name: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO connection_history (user_id, chat_id, chat_name, connected_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(chat_id)
        .bind(chat_name)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "DELETE FROM connection_history WHERE user_id = ? AND rowid NOT IN (
                 SELECT rowid FROM connection_history WHERE user_id = ?
                 ORDER BY connected_at DESC, rowid DESC LIMIT ?
             )",
        )
        .bind(user_id)
        .bind(user_id)
        .bind(HISTORY_LIMIT)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Connection history for a user, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub async fn history(&self, user_id: i64) -> Result<Vec<HistoryEntry>, StoreError> {
        let entries = sqlx::query_as::<_, HistoryEntry>(
            "SELECT chat_id, chat_name, connected_at FROM connection_history
             WHERE user_id = ? ORDER BY connected_at DESC, rowid DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }

    /// Delete the user's entire connection history.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn clear_history(&self, user_id: i64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM connection_history WHERE user_id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ---- known chats ----

    /// Remember a chat the bot has seen. Used as the gban fan-out universe.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn record_chat(&self, chat_id: i64, title: Option<&str>) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO known_chats (chat_id, title) VALUES (?, ?)
             ON CONFLICT(chat_id) DO UPDATE SET title = excluded.title",
        )
        .bind(chat_id)
        .bind(title)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Every chat ID the bot has ever seen.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub async fn known_chat_ids(&self) -> Result<Vec<i64>, StoreError> {
        let ids = sqlx::query_scalar("SELECT chat_id FROM known_chats ORDER BY chat_id")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    /// Rewrite every reference to a chat ID after a group migration.
    ///
    /// # Errors
    ///
    /// Returns an error if a write fails.
    pub async fn migrate_chat(&self, old_chat_id: i64, new_chat_id: i64) -> Result<(), StoreError> {
        for table in [
            "gban_settings",
            "connection_settings",
            "connections",
            "connection_history",
            "known_chats",
        ] {
            sqlx::query(&format!(
                "UPDATE OR REPLACE {table} SET chat_id = ? WHERE chat_id = ?"
            ))
            .bind(new_chat_id)
            .bind(old_chat_id)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_single_connection_per_user() -> Result<(), StoreError> {
        let store = Store::in_memory().await?;

        store.set_connection(1, 100).await?;
        store.set_connection(1, 200).await?;
        assert_eq!(store.connected_chat(1).await?, Some(200));

        assert!(store.remove_connection(1).await?);
        assert_eq!(store.connected_chat(1).await?, None);
        // Second disconnect is a no-op
        assert!(!store.remove_connection(1).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_history_keeps_five_newest() -> Result<(), StoreError> {
        let store = Store::in_memory().await?;

        for i in 1..=6 {
            store.add_history(1, i, &format!("chat {i}")).await?;
        }

        let history = store.history(1).await?;
        assert_eq!(history.len(), 5);
        let ids: Vec<i64> = history.iter().map(|h| h.chat_id).collect();
        assert_eq!(ids, vec![6, 5, 4, 3, 2]);

        // Other users are unaffected
        store.add_history(2, 99, "other").await?;
        assert_eq!(store.history(1).await?.len(), 5);
        assert_eq!(store.history(2).await?.len(), 1);

        store.clear_history(1).await?;
        assert!(store.history(1).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_gban_lifecycle() -> Result<(), StoreError> {
        let store = Store::in_memory().await?;

        assert!(!store.is_gbanned(42).await?);
        store.add_gban(42, "spammer", Some("spam")).await?;
        assert!(store.is_gbanned(42).await?);

        let old = store.update_gban_reason(42, "spammer", "worse spam").await?;
        assert_eq!(old.as_deref(), Some("spam"));

        let list = store.gban_list().await?;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].reason.as_deref(), Some("worse spam"));
        assert_eq!(store.gban_count().await?, 1);

        assert!(store.remove_gban(42).await?);
        assert!(!store.remove_gban(42).await?);
        assert!(!store.is_gbanned(42).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_enforcement_defaults_on() -> Result<(), StoreError> {
        let store = Store::in_memory().await?;

        assert!(store.chat_enforces_gban(-100).await?);
        store.set_gban_enforcement(-100, false).await?;
        assert!(!store.chat_enforces_gban(-100).await?);
        store.set_gban_enforcement(-100, true).await?;
        assert!(store.chat_enforces_gban(-100).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_member_connections_default_off() -> Result<(), StoreError> {
        let store = Store::in_memory().await?;

        assert!(!store.allows_member_connections(-100).await?);
        store.set_member_connections(-100, true).await?;
        assert!(store.allows_member_connections(-100).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_known_chats_deduplicated() -> Result<(), StoreError> {
        let store = Store::in_memory().await?;

        store.record_chat(-1, Some("a")).await?;
        store.record_chat(-1, Some("a renamed")).await?;
        store.record_chat(-2, None).await?;
        assert_eq!(store.known_chat_ids().await?, vec![-2, -1]);
        Ok(())
    }

    #[tokio::test]
    async fn test_migrate_chat() -> Result<(), StoreError> {
        let store = Store::in_memory().await?;

        store.set_gban_enforcement(-100, false).await?;
        store.set_member_connections(-100, true).await?;
        store.set_connection(7, -100).await?;
        store.record_chat(-100, Some("old")).await?;

        store.migrate_chat(-100, -200).await?;

        assert!(!store.chat_enforces_gban(-200).await?);
        assert!(store.allows_member_connections(-200).await?);
        assert_eq!(store.connected_chat(7).await?, Some(-200));
        assert_eq!(store.known_chat_ids().await?, vec![-200]);
        // Old ID falls back to defaults
        assert!(store.chat_enforces_gban(-100).await?);
        Ok(())
    }
}
