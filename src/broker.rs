//! Per-user chat connection broker
//!
//! Lets a user link their private chat to one group they administer (or one
//! that allows member connections) so admin commands can be issued remotely.
//! Authorization is re-checked on every use: a connection whose grounds have
//! lapsed is torn down on the spot rather than left dangling.

use crate::directory::{ChatDirectory, ChatInfo, ChatTarget, Notifier};
use crate::store::{HistoryEntry, Store, StoreError};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Errors surfaced to the user by broker operations
#[derive(Error, Debug)]
pub enum BrokerError {
    /// The target does not resolve to any known chat
    #[error("chat not found")]
    NotFound,
    /// The target exists but the caller may not connect to it
    #[error("connection to this chat is not allowed")]
    Unauthorized,
    /// Storage failure
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outcome of resolving a user's active connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The user is connected to this chat and still authorized
    Connected(i64),
    /// No applicable connection (not a private chat, or none stored)
    NotConnected,
    /// A stale connection was found and torn down
    Revoked,
}

/// The connection broker
pub struct Broker {
    store: Store,
    directory: Arc<dyn ChatDirectory>,
    notifier: Arc<dyn Notifier>,
    sudo_users: HashSet<i64>,
}

impl Broker {
    /// Build a broker over its collaborators.
    #[must_use]
    pub fn new(
        store: Store,
        directory: Arc<dyn ChatDirectory>,
        notifier: Arc<dyn Notifier>,
        sudo_users: HashSet<i64>,
    ) -> Self {
        Self {
            store,
            directory,
            notifier,
            sudo_users,
        }
    }

    /// Connect `user_id` to `target`, replacing any previous connection.
    ///
    /// Permitted when the caller is an admin of the target, the target allows
    /// member connections and the caller is a member, or the caller is sudo.
    ///
    /// # Errors
    ///
    /// [`BrokerError::NotFound`] when the target (or the caller's membership
    /// in it) cannot be resolved, [`BrokerError::Unauthorized`] when the
    /// caller lacks rights.
    pub async fn connect(&self, user_id: i64, target: ChatTarget) -> Result<ChatInfo, BrokerError> {
        let chat = self
            .directory
            .resolve_chat(target)
            .await
            .map_err(|_| BrokerError::NotFound)?;

        if !self.sudo_users.contains(&user_id) {
            let status = self
                .directory
                .member_status(chat.id, user_id)
                .await
                .map_err(|_| BrokerError::NotFound)?;
            let allowed = status.is_admin()
                || (status.is_member() && self.store.allows_member_connections(chat.id).await?);
            if !allowed {
                return Err(BrokerError::Unauthorized);
            }
        }

        self.store.set_connection(user_id, chat.id).await?;
        self.store.add_history(user_id, chat.id, &chat.title).await?;
        info!("User {} connected to chat {}", user_id, chat.id);
        Ok(chat)
    }

    /// Drop the user's connection. Returns whether one existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store write fails.
    pub async fn disconnect(&self, user_id: i64) -> Result<bool, BrokerError> {
        Ok(self.store.remove_connection(user_id).await?)
    }

    /// Resolve which chat a private-chat command targets.
    ///
    /// Re-validates authorization exactly as [`Broker::connect`] did; a
    /// connection whose grounds no longer hold is deleted and the user is
    /// told, so a stale link never survives its own authorization check.
    ///
    /// # Errors
    ///
    /// Returns an error if a store access fails.
    pub async fn resolve(
        &self,
        user_id: i64,
        in_private_chat: bool,
        require_admin: bool,
    ) -> Result<Resolution, BrokerError> {
        if !in_private_chat {
            return Ok(Resolution::NotConnected);
        }
        let Some(chat_id) = self.store.connected_chat(user_id).await? else {
            return Ok(Resolution::NotConnected);
        };
        if self.sudo_users.contains(&user_id) {
            return Ok(Resolution::Connected(chat_id));
        }

        // Membership lookup failures count as lost authorization
        let status = self.directory.member_status(chat_id, user_id).await.ok();
        let allowed = match status {
            Some(s) if s.is_admin() => true,
            Some(s) if s.is_member() && !require_admin => {
                self.store.allows_member_connections(chat_id).await?
            }
            _ => false,
        };

        if allowed {
            return Ok(Resolution::Connected(chat_id));
        }

        self.store.remove_connection(user_id).await?;
        self.notifier
            .notify(
                user_id,
                "The group changed its connection rights or you are no longer an admin. \
                 I've disconnected you.",
            )
            .await;
        info!("Revoked stale connection of user {} to {}", user_id, chat_id);
        Ok(Resolution::Revoked)
    }

    /// Connection history for a user, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub async fn history(&self, user_id: i64) -> Result<Vec<HistoryEntry>, BrokerError> {
        Ok(self.store.history(user_id).await?)
    }

    /// Forget the user's connection history.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn clear_history(&self, user_id: i64) -> Result<(), BrokerError> {
        Ok(self.store.clear_history(user_id).await?)
    }

    /// The chat the user is connected to, without re-validation. Display only.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub async fn connected_chat(&self, user_id: i64) -> Result<Option<i64>, BrokerError> {
        Ok(self.store.connected_chat(user_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{DirectoryError, MemberStatus, MockChatDirectory};
    use crate::testing::{chat, quiet_notifier, recording_notifier};

    const ADMIN: i64 = 10;
    const MEMBER: i64 = 20;
    const CHAT: i64 = -100;

    fn broker(store: Store, directory: MockChatDirectory) -> Broker {
        Broker::new(
            store,
            Arc::new(directory),
            Arc::new(quiet_notifier()),
            HashSet::new(),
        )
    }

    #[tokio::test]
    async fn test_admin_can_connect() -> Result<(), BrokerError> {
        let store = Store::in_memory().await?;
        let mut directory = MockChatDirectory::new();
        directory
            .expect_resolve_chat()
            .returning(|_| Ok(chat(CHAT, "The Group")));
        directory
            .expect_member_status()
            .returning(|_, _| Ok(MemberStatus::Administrator));

        let broker = broker(store.clone(), directory);
        let info = broker.connect(ADMIN, ChatTarget::Id(CHAT)).await?;
        assert_eq!(info.id, CHAT);
        assert_eq!(info.title, "The Group");

        assert_eq!(store.connected_chat(ADMIN).await?, Some(CHAT));
        let history = broker.history(ADMIN).await?;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].chat_id, CHAT);
        Ok(())
    }

    #[tokio::test]
    async fn test_member_refused_when_chat_does_not_allow() -> Result<(), BrokerError> {
        let store = Store::in_memory().await?;
        let mut directory = MockChatDirectory::new();
        directory
            .expect_resolve_chat()
            .returning(|_| Ok(chat(CHAT, "The Group")));
        directory
            .expect_member_status()
            .returning(|_, _| Ok(MemberStatus::Member));

        let broker = broker(store.clone(), directory);
        let err = broker
            .connect(MEMBER, ChatTarget::Id(CHAT))
            .await
            .expect_err("member must be refused");
        assert!(matches!(err, BrokerError::Unauthorized));
        // No row was created
        assert_eq!(store.connected_chat(MEMBER).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_member_allowed_when_chat_opts_in() -> Result<(), BrokerError> {
        let store = Store::in_memory().await?;
        store.set_member_connections(CHAT, true).await?;
        let mut directory = MockChatDirectory::new();
        directory
            .expect_resolve_chat()
            .returning(|_| Ok(chat(CHAT, "The Group")));
        directory
            .expect_member_status()
            .returning(|_, _| Ok(MemberStatus::Member));

        let broker = broker(store.clone(), directory);
        broker.connect(MEMBER, ChatTarget::Id(CHAT)).await?;
        assert_eq!(store.connected_chat(MEMBER).await?, Some(CHAT));
        Ok(())
    }

    #[tokio::test]
    async fn test_unresolvable_target_is_not_found() -> Result<(), BrokerError> {
        let store = Store::in_memory().await?;
        let mut directory = MockChatDirectory::new();
        directory
            .expect_resolve_chat()
            .returning(|_| Err(DirectoryError::ChatNotFound));

        let broker = broker(store.clone(), directory);
        let err = broker
            .connect(ADMIN, ChatTarget::Handle("@nowhere".to_string()))
            .await
            .expect_err("unknown chat must not connect");
        assert!(matches!(err, BrokerError::NotFound));
        Ok(())
    }

    #[tokio::test]
    async fn test_sudo_bypasses_membership() -> Result<(), BrokerError> {
        let store = Store::in_memory().await?;
        let mut directory = MockChatDirectory::new();
        directory
            .expect_resolve_chat()
            .returning(|_| Ok(chat(CHAT, "The Group")));
        // member_status is never consulted for sudo users

        let broker = Broker::new(
            store.clone(),
            Arc::new(directory),
            Arc::new(quiet_notifier()),
            HashSet::from([ADMIN]),
        );
        broker.connect(ADMIN, ChatTarget::Id(CHAT)).await?;
        assert_eq!(store.connected_chat(ADMIN).await?, Some(CHAT));
        Ok(())
    }

    #[tokio::test]
    async fn test_resolve_only_applies_in_private_chats() -> Result<(), BrokerError> {
        let store = Store::in_memory().await?;
        store.set_connection(ADMIN, CHAT).await?;
        let broker = broker(store, MockChatDirectory::new());

        let resolution = broker.resolve(ADMIN, false, true).await?;
        assert_eq!(resolution, Resolution::NotConnected);
        Ok(())
    }

    #[tokio::test]
    async fn test_resolve_without_connection() -> Result<(), BrokerError> {
        let store = Store::in_memory().await?;
        let broker = broker(store, MockChatDirectory::new());

        assert_eq!(broker.resolve(ADMIN, true, true).await?, Resolution::NotConnected);
        Ok(())
    }

    #[tokio::test]
    async fn test_connect_then_resolve_while_still_admin() -> Result<(), BrokerError> {
        let store = Store::in_memory().await?;
        let mut directory = MockChatDirectory::new();
        directory
            .expect_resolve_chat()
            .returning(|_| Ok(chat(CHAT, "The Group")));
        directory
            .expect_member_status()
            .returning(|_, _| Ok(MemberStatus::Administrator));

        let broker = broker(store, directory);
        broker.connect(ADMIN, ChatTarget::Id(CHAT)).await?;
        assert_eq!(
            broker.resolve(ADMIN, true, true).await?,
            Resolution::Connected(CHAT)
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_resolve_self_heals_after_demotion() -> Result<(), BrokerError> {
        let store = Store::in_memory().await?;
        let mut directory = MockChatDirectory::new();
        directory
            .expect_resolve_chat()
            .returning(|_| Ok(chat(CHAT, "The Group")));
        // Admin at connect time, plain member afterwards
        directory
            .expect_member_status()
            .times(1)
            .returning(|_, _| Ok(MemberStatus::Administrator));
        directory
            .expect_member_status()
            .returning(|_, _| Ok(MemberStatus::Member));

        let (notifier, notices) = recording_notifier();
        let broker = Broker::new(
            store.clone(),
            Arc::new(directory),
            notifier,
            HashSet::new(),
        );

        broker.connect(ADMIN, ChatTarget::Id(CHAT)).await?;
        let resolution = broker.resolve(ADMIN, true, true).await?;
        assert_eq!(resolution, Resolution::Revoked);

        // The stale row is gone and the user was told
        assert_eq!(store.connected_chat(ADMIN).await?, None);
        let notices = notices.lock().expect("notifier lock");
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].0, ADMIN);
        Ok(())
    }

    #[tokio::test]
    async fn test_resolve_member_connection_survives_without_admin() -> Result<(), BrokerError> {
        let store = Store::in_memory().await?;
        store.set_member_connections(CHAT, true).await?;
        store.set_connection(MEMBER, CHAT).await?;
        let mut directory = MockChatDirectory::new();
        directory
            .expect_member_status()
            .returning(|_, _| Ok(MemberStatus::Member));

        let broker = broker(store.clone(), directory);
        // Non-admin operations keep working
        assert_eq!(
            broker.resolve(MEMBER, true, false).await?,
            Resolution::Connected(CHAT)
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_resolve_revokes_when_membership_lookup_fails() -> Result<(), BrokerError> {
        let store = Store::in_memory().await?;
        store.set_connection(ADMIN, CHAT).await?;
        let mut directory = MockChatDirectory::new();
        directory
            .expect_member_status()
            .returning(|_, _| Err(DirectoryError::ChatNotFound));

        let broker = broker(store.clone(), directory);
        assert_eq!(broker.resolve(ADMIN, true, false).await?, Resolution::Revoked);
        assert_eq!(store.connected_chat(ADMIN).await?, None);
        Ok(())
    }
}
