//! Global-ban list and cross-chat propagation
//!
//! Maintains the authoritative set of globally banned users and applies it,
//! best effort, across every known chat that has not opted out. Chat-local
//! errors (bot missing, no rights, user absent) are skipped; any other error
//! aborts the fan-out and rolls back the ban-list mutation. Chats actioned
//! before the abort keep their state: the fan-out is not transactional, and
//! the rollback intentionally mirrors the long-standing behaviour of the
//! bots this design descends from (see DESIGN.md).

use crate::directory::{ChatDirectory, DirectoryError, MemberStatus, Notifier, UserInfo};
use crate::store::{GbanEntry, Store, StoreError};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// The privileged user performing a ban or unban, for audit messages
#[derive(Debug, Clone)]
pub struct Actor {
    /// Telegram user ID
    pub id: i64,
    /// Display name used in broadcasts
    pub name: String,
}

/// Errors surfaced to the caller of gban operations
#[derive(Error, Debug)]
pub enum GbanError {
    /// The target is a sudo user
    #[error("sudo users cannot be globally banned")]
    TargetIsSudo,
    /// The target is a support user
    #[error("support users cannot be globally banned")]
    TargetIsSupport,
    /// The target is the bot itself
    #[error("I am not going to ban myself")]
    TargetIsSelf,
    /// The target ID does not resolve to a user account
    #[error("that does not look like a user")]
    NotAUser,
    /// The target account was deleted
    #[error("that is a deleted account")]
    DeletedAccount,
    /// Re-ban of an already banned user without a new reason
    #[error("user is already gbanned and no new reason was given")]
    AlreadyBanned,
    /// Unban of a user who is not banned
    #[error("user is not gbanned")]
    NotBanned,
    /// The fan-out hit an unexpected error and was abandoned
    #[error("fan-out aborted in chat {chat_id}: {source}")]
    FanOutAborted {
        /// Chat in which the unexpected error occurred
        chat_id: i64,
        /// The error itself
        source: DirectoryError,
    },
    /// Storage failure
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of a successful [`Propagator::gban`]
#[derive(Debug)]
pub enum GbanOutcome {
    /// A new ban was recorded and fanned out
    Banned {
        /// The banned user
        user: UserInfo,
        /// Number of chats the user was removed from
        chats_banned: usize,
    },
    /// The user was already banned; only the reason changed, no fan-out
    ReasonUpdated {
        /// The banned user
        user: UserInfo,
        /// The reason that was replaced
        previous: Option<String>,
    },
}

/// The global-ban propagator
pub struct Propagator {
    store: Store,
    directory: Arc<dyn ChatDirectory>,
    notifier: Arc<dyn Notifier>,
    sudo_users: HashSet<i64>,
    support_users: HashSet<i64>,
    bot_id: i64,
    log_chat: Option<i64>,
}

impl Propagator {
    /// Build a propagator over its collaborators.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        directory: Arc<dyn ChatDirectory>,
        notifier: Arc<dyn Notifier>,
        sudo_users: HashSet<i64>,
        support_users: HashSet<i64>,
        bot_id: i64,
        log_chat: Option<i64>,
    ) -> Self {
        Self {
            store,
            directory,
            notifier,
            sudo_users,
            support_users,
            bot_id,
            log_chat,
        }
    }

    /// Whether this user may issue gban commands.
    #[must_use]
    pub fn is_privileged(&self, user_id: i64) -> bool {
        self.sudo_users.contains(&user_id) || self.support_users.contains(&user_id)
    }

    /// Globally ban a user and remove them from every enforcing chat.
    ///
    /// Banning an already-banned user replaces the reason in place and skips
    /// the fan-out; the user is assumed already removed everywhere.
    ///
    /// # Errors
    ///
    /// Rejects protected targets, unresolvable targets, and re-bans without a
    /// new reason. An unexpected error during fan-out aborts the operation,
    /// rolls back the ban-list entry, and is reported as
    /// [`GbanError::FanOutAborted`].
    pub async fn gban(
        &self,
        actor: &Actor,
        user_id: i64,
        reason: Option<&str>,
    ) -> Result<GbanOutcome, GbanError> {
        if self.sudo_users.contains(&user_id) {
            return Err(GbanError::TargetIsSudo);
        }
        if self.support_users.contains(&user_id) {
            return Err(GbanError::TargetIsSupport);
        }
        if user_id == self.bot_id {
            return Err(GbanError::TargetIsSelf);
        }
        let user = self
            .directory
            .user_info(user_id)
            .await
            .map_err(|_| GbanError::NotAUser)?;
        if user.is_deleted() {
            return Err(GbanError::DeletedAccount);
        }
        let display_name = user.display_name();

        if self.store.is_gbanned(user_id).await? {
            let Some(reason) = reason else {
                return Err(GbanError::AlreadyBanned);
            };
            let previous = self
                .store
                .update_gban_reason(user_id, &display_name, reason)
                .await?;
            self.broadcast(&format!(
                "{} changed the gban reason of {} (<code>{}</code>)\n\
                 Previous reason: {}\nNew reason: {}",
                escape(&actor.name),
                escape(&display_name),
                user_id,
                escape(previous.as_deref().unwrap_or("None")),
                escape(reason),
            ))
            .await;
            info!("Gban reason of {} updated by {}", user_id, actor.id);
            return Ok(GbanOutcome::ReasonUpdated { user, previous });
        }

        self.store.add_gban(user_id, &display_name, reason).await?;

        let mut chats_banned = 0usize;
        for chat_id in self.store.known_chat_ids().await? {
            if !self.store.chat_enforces_gban(chat_id).await? {
                continue;
            }
            match self.directory.ban(chat_id, user_id).await {
                Ok(()) => chats_banned += 1,
                Err(e) if e.is_chat_local() => {
                    debug!("Skipping chat {} during gban of {}: {}", chat_id, user_id, e);
                }
                Err(e) => {
                    // Roll the list mutation back and give up. Chats already
                    // actioned keep the ban; the fan-out is not transactional.
                    self.store.remove_gban(user_id).await?;
                    self.broadcast(&format!("Could not gban due to: {e}")).await;
                    warn!("Gban of {} aborted in chat {}: {}", user_id, chat_id, e);
                    return Err(GbanError::FanOutAborted { chat_id, source: e });
                }
            }
        }

        let announcement = format!(
            "{} gbanned {} (<code>{}</code>)\nReason: {}",
            escape(&actor.name),
            escape(&display_name),
            user_id,
            escape(reason.unwrap_or("No reason given")),
        );
        if let Some(log_chat) = self.log_chat {
            self.notifier
                .notify(log_chat, &format!("#GBANNED\n{announcement}"))
                .await;
        }
        self.broadcast(&announcement).await;
        info!(
            "User {} gbanned by {} across {} chats",
            user_id, actor.id, chats_banned
        );
        Ok(GbanOutcome::Banned { user, chats_banned })
    }

    /// Lift a global ban and unban the user in every enforcing chat where
    /// they are currently banned. Returns the number of chats restored.
    ///
    /// # Errors
    ///
    /// [`GbanError::NotBanned`] when the user is not on the list; an
    /// unexpected fan-out error aborts, re-records the ban entry, and is
    /// reported as [`GbanError::FanOutAborted`].
    pub async fn ungban(&self, actor: &Actor, user_id: i64) -> Result<usize, GbanError> {
        let Some(entry) = self.store.gban_entry(user_id).await? else {
            return Err(GbanError::NotBanned);
        };
        let display_name = match self.directory.user_info(user_id).await {
            Ok(user) => user.display_name(),
            Err(_) => entry.display_name.clone(),
        };

        self.broadcast(&format!(
            "{} has ungbanned {} (<code>{}</code>)",
            escape(&actor.name),
            escape(&display_name),
            user_id,
        ))
        .await;
        self.store.remove_gban(user_id).await?;

        let mut chats_restored = 0usize;
        for chat_id in self.store.known_chat_ids().await? {
            if !self.store.chat_enforces_gban(chat_id).await? {
                continue;
            }
            let status = match self.directory.member_status(chat_id, user_id).await {
                Ok(status) => status,
                Err(e) if e.is_chat_local() => continue,
                Err(e) => {
                    self.rollback_ungban(&entry).await?;
                    self.broadcast(&format!("Could not ungban due to: {e}")).await;
                    warn!("Ungban of {} aborted in chat {}: {}", user_id, chat_id, e);
                    return Err(GbanError::FanOutAborted { chat_id, source: e });
                }
            };
            if status != MemberStatus::Banned {
                continue;
            }
            match self.directory.unban(chat_id, user_id).await {
                Ok(()) => chats_restored += 1,
                Err(e) if e.is_chat_local() => {
                    debug!("Skipping chat {} during ungban of {}: {}", chat_id, user_id, e);
                }
                Err(e) => {
                    self.rollback_ungban(&entry).await?;
                    self.broadcast(&format!("Could not ungban due to: {e}")).await;
                    warn!("Ungban of {} aborted in chat {}: {}", user_id, chat_id, e);
                    return Err(GbanError::FanOutAborted { chat_id, source: e });
                }
            }
        }

        if let Some(log_chat) = self.log_chat {
            self.notifier
                .notify(
                    log_chat,
                    &format!(
                        "#UNGBANNED\n{} ungbanned {} (<code>{}</code>)",
                        escape(&actor.name),
                        escape(&display_name),
                        user_id,
                    ),
                )
                .await;
        }
        info!(
            "User {} ungbanned by {}, restored in {} chats",
            user_id, actor.id, chats_restored
        );
        Ok(chats_restored)
    }

    async fn rollback_ungban(&self, entry: &GbanEntry) -> Result<(), StoreError> {
        self.store
            .add_gban(entry.user_id, &entry.display_name, entry.reason.as_deref())
            .await
    }

    /// Reactive enforcement: remove a globally banned user from a chat the
    /// moment they act or arrive there. Safety net for chats that joined the
    /// bot (or that the bot joined) after the ban was issued.
    ///
    /// Returns whether the user was on the ban list. Removal failures are
    /// logged, never propagated; the next event retries naturally.
    ///
    /// # Errors
    ///
    /// Returns an error if a store read fails.
    pub async fn enforce(&self, chat_id: i64, user_id: i64) -> Result<bool, GbanError> {
        if !self.store.chat_enforces_gban(chat_id).await? {
            return Ok(false);
        }
        if !self.store.is_gbanned(user_id).await? {
            return Ok(false);
        }
        match self.directory.ban(chat_id, user_id).await {
            Ok(()) => info!("Enforced gban of {} in chat {}", user_id, chat_id),
            Err(e) if e.is_chat_local() => {
                debug!("Could not enforce gban of {} in {}: {}", user_id, chat_id, e);
            }
            Err(e) => warn!("Gban enforcement of {} in {} failed: {}", user_id, chat_id, e),
        }
        Ok(true)
    }

    /// Plain-text export of the whole ban list, or `None` when it is empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub async fn export_list(&self) -> Result<Option<String>, GbanError> {
        let entries = self.store.gban_list().await?;
        if entries.is_empty() {
            return Ok(None);
        }
        let mut out = String::from("Currently gbanned users:\n");
        for entry in entries {
            out.push_str(&format!("[x] {} - {}\n", entry.display_name, entry.user_id));
            if let Some(reason) = &entry.reason {
                out.push_str(&format!("Reason: {reason}\n"));
            }
        }
        Ok(Some(out))
    }

    /// Ban entry for one user, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub async fn entry(&self, user_id: i64) -> Result<Option<GbanEntry>, GbanError> {
        Ok(self.store.gban_entry(user_id).await?)
    }

    /// Number of globally banned users.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub async fn count(&self) -> Result<i64, GbanError> {
        Ok(self.store.gban_count().await?)
    }

    /// Whether a chat enforces global bans.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub async fn enforces(&self, chat_id: i64) -> Result<bool, GbanError> {
        Ok(self.store.chat_enforces_gban(chat_id).await?)
    }

    /// Toggle gban enforcement for a chat.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn set_enforcement(&self, chat_id: i64, enforce: bool) -> Result<(), GbanError> {
        Ok(self.store.set_gban_enforcement(chat_id, enforce).await?)
    }

    async fn broadcast(&self, text: &str) {
        for user_id in self.sudo_users.union(&self.support_users) {
            self.notifier.notify(*user_id, text).await;
        }
    }
}

/// HTML-escape user-controlled text before interpolating it into a message.
#[must_use]
pub fn escape(text: &str) -> String {
    html_escape::encode_text(text).into_owned()
}
