//! Collaborator interfaces over the Telegram API
//!
//! The broker and the gban propagator never talk to teloxide directly; they
//! go through [`ChatDirectory`] and [`Notifier`], which return a closed set
//! of typed error kinds instead of raw API error strings. The teloxide
//! implementations live here too.

use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{ChatId, ChatMemberKind, ParseMode, Recipient, UserId};
use teloxide::{ApiError, RequestError};
use thiserror::Error;
use tracing::warn;

/// Closed set of error kinds every external chat/member call is folded into
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    /// The chat does not exist or is not visible to the bot
    #[error("chat not found")]
    ChatNotFound,
    /// The user does not exist or does not resolve to a user account
    #[error("user not found")]
    UserNotFound,
    /// The group was deactivated
    #[error("group chat was deactivated")]
    ChatDeactivated,
    /// The bot is not (or no longer) a member of the chat
    #[error("bot is not in the chat")]
    NotInChat,
    /// The bot lacks the rights to restrict members in the chat
    #[error("not enough rights to restrict chat members")]
    NotEnoughRights,
    /// The recipient blocked the bot or cannot be messaged
    #[error("recipient cannot be contacted")]
    Blocked,
    /// Any other Telegram API error
    #[error("telegram api error: {0}")]
    Api(String),
    /// Transport-level failure (network, timeout, serialization)
    #[error("network error: {0}")]
    Network(String),
}

impl DirectoryError {
    /// Whether this error is a normal chat-specific condition that a gban
    /// fan-out skips over instead of aborting.
    #[must_use]
    pub const fn is_chat_local(&self) -> bool {
        matches!(
            self,
            Self::ChatNotFound
                | Self::UserNotFound
                | Self::ChatDeactivated
                | Self::NotInChat
                | Self::NotEnoughRights
        )
    }
}

/// Membership status of a user within one chat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberStatus {
    /// Chat creator
    Owner,
    /// Chat administrator
    Administrator,
    /// Ordinary member
    Member,
    /// Member with restrictions
    Restricted,
    /// Not in the chat
    Left,
    /// Banned from the chat
    Banned,
}

impl MemberStatus {
    /// Owner or administrator
    #[must_use]
    pub const fn is_admin(self) -> bool {
        matches!(self, Self::Owner | Self::Administrator)
    }

    /// An ordinary, unrestricted member
    #[must_use]
    pub const fn is_member(self) -> bool {
        matches!(self, Self::Member)
    }
}

/// A chat-connection target as typed by a user: numeric ID or `@`-handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatTarget {
    /// Numeric chat ID
    Id(i64),
    /// Public `@`-style handle
    Handle(String),
}

impl ChatTarget {
    /// Parse user input, accepting `-100123`, `@somegroup` or `somegroup`.
    #[must_use]
    pub fn parse(input: &str) -> Self {
        let input = input.trim();
        if let Ok(id) = input.parse::<i64>() {
            Self::Id(id)
        } else if let Some(handle) = input.strip_prefix('@') {
            Self::Handle(format!("@{handle}"))
        } else {
            Self::Handle(format!("@{input}"))
        }
    }
}

/// Resolved chat identity
#[derive(Debug, Clone)]
pub struct ChatInfo {
    /// Chat ID
    pub id: i64,
    /// Chat title
    pub title: String,
}

/// Resolved user identity
#[derive(Debug, Clone)]
pub struct UserInfo {
    /// User ID
    pub id: i64,
    /// First name; empty for deleted accounts
    pub first_name: String,
    /// Public username, if set
    pub username: Option<String>,
}

impl UserInfo {
    /// Name to store and show for this user: username if set, else first name.
    #[must_use]
    pub fn display_name(&self) -> String {
        self.username
            .clone()
            .unwrap_or_else(|| self.first_name.clone())
    }

    /// Deleted accounts resolve with an empty first name.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.first_name.is_empty() && self.username.is_none()
    }
}

/// Chat/member directory consumed by the broker and the propagator
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChatDirectory: Send + Sync {
    /// Resolve a target to a chat.
    async fn resolve_chat(&self, target: ChatTarget) -> Result<ChatInfo, DirectoryError>;
    /// Membership status of a user within a chat.
    async fn member_status(&self, chat_id: i64, user_id: i64)
        -> Result<MemberStatus, DirectoryError>;
    /// Ban (remove) a user from a chat.
    async fn ban(&self, chat_id: i64, user_id: i64) -> Result<(), DirectoryError>;
    /// Lift a ban in a chat.
    async fn unban(&self, chat_id: i64, user_id: i64) -> Result<(), DirectoryError>;
    /// Resolve a user ID to an account.
    async fn user_info(&self, user_id: i64) -> Result<UserInfo, DirectoryError>;
}

/// Best-effort notification sink. Failures are logged, never propagated:
/// an unreachable recipient must not abort the operation that notifies them.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Send `text` to a user or chat.
    async fn notify(&self, chat_id: i64, text: &str);
}

/// [`ChatDirectory`] implementation over the live bot API
pub struct TelegramDirectory {
    bot: Bot,
}

impl TelegramDirectory {
    /// Wrap a bot handle.
    #[must_use]
    pub const fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

fn classify(err: RequestError) -> DirectoryError {
    match err {
        RequestError::Api(api) => match api {
            ApiError::ChatNotFound => DirectoryError::ChatNotFound,
            ApiError::UserNotFound => DirectoryError::UserNotFound,
            ApiError::GroupDeactivated => DirectoryError::ChatDeactivated,
            ApiError::BotKicked | ApiError::BotKickedFromSupergroup => DirectoryError::NotInChat,
            ApiError::NotEnoughRightsToRestrict | ApiError::CantRestrictSelf => {
                DirectoryError::NotEnoughRights
            }
            ApiError::BotBlocked
            | ApiError::UserDeactivated
            | ApiError::CantInitiateConversation
            | ApiError::CantTalkWithBots => DirectoryError::Blocked,
            other => DirectoryError::Api(other.to_string()),
        },
        other => DirectoryError::Network(other.to_string()),
    }
}

#[async_trait]
impl ChatDirectory for TelegramDirectory {
    async fn resolve_chat(&self, target: ChatTarget) -> Result<ChatInfo, DirectoryError> {
        let recipient = match target {
            ChatTarget::Id(id) => Recipient::Id(ChatId(id)),
            ChatTarget::Handle(handle) => Recipient::ChannelUsername(handle),
        };
        let chat = self.bot.get_chat(recipient).await.map_err(classify)?;
        Ok(ChatInfo {
            id: chat.id.0,
            title: chat.title().unwrap_or("this chat").to_string(),
        })
    }

    async fn member_status(
        &self,
        chat_id: i64,
        user_id: i64,
    ) -> Result<MemberStatus, DirectoryError> {
        let member = self
            .bot
            .get_chat_member(ChatId(chat_id), UserId(user_id.cast_unsigned()))
            .await
            .map_err(classify)?;
        Ok(match member.kind {
            ChatMemberKind::Owner(_) => MemberStatus::Owner,
            ChatMemberKind::Administrator(_) => MemberStatus::Administrator,
            ChatMemberKind::Member(_) => MemberStatus::Member,
            ChatMemberKind::Restricted(_) => MemberStatus::Restricted,
            ChatMemberKind::Left => MemberStatus::Left,
            ChatMemberKind::Banned(_) => MemberStatus::Banned,
        })
    }

    async fn ban(&self, chat_id: i64, user_id: i64) -> Result<(), DirectoryError> {
        self.bot
            .ban_chat_member(ChatId(chat_id), UserId(user_id.cast_unsigned()))
            .await
            .map(drop)
            .map_err(classify)
    }

    async fn unban(&self, chat_id: i64, user_id: i64) -> Result<(), DirectoryError> {
        self.bot
            .unban_chat_member(ChatId(chat_id), UserId(user_id.cast_unsigned()))
            .await
            .map(drop)
            .map_err(classify)
    }

    async fn user_info(&self, user_id: i64) -> Result<UserInfo, DirectoryError> {
        let chat = self
            .bot
            .get_chat(Recipient::Id(ChatId(user_id)))
            .await
            .map_err(classify)?;
        if !chat.is_private() {
            // Group and channel IDs are not users
            return Err(DirectoryError::UserNotFound);
        }
        Ok(UserInfo {
            id: user_id,
            first_name: chat.first_name().unwrap_or_default().to_string(),
            username: chat.username().map(ToString::to_string),
        })
    }
}

/// [`Notifier`] implementation over the live bot API
pub struct TelegramNotifier {
    bot: Bot,
}

impl TelegramNotifier {
    /// Wrap a bot handle.
    #[must_use]
    pub const fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, chat_id: i64, text: &str) {
        if let Err(e) = self
            .bot
            .send_message(ChatId(chat_id), text)
            .parse_mode(ParseMode::Html)
            .await
        {
            warn!("Failed to notify {}: {}", chat_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_parsing() {
        assert_eq!(ChatTarget::parse("-1001234"), ChatTarget::Id(-1_001_234));
        assert_eq!(
            ChatTarget::parse("@mygroup"),
            ChatTarget::Handle("@mygroup".to_string())
        );
        assert_eq!(
            ChatTarget::parse("mygroup"),
            ChatTarget::Handle("@mygroup".to_string())
        );
        assert_eq!(ChatTarget::parse(" 42 "), ChatTarget::Id(42));
    }

    #[test]
    fn test_chat_local_classification() {
        assert!(DirectoryError::ChatNotFound.is_chat_local());
        assert!(DirectoryError::NotEnoughRights.is_chat_local());
        assert!(DirectoryError::NotInChat.is_chat_local());
        assert!(!DirectoryError::Network("timeout".to_string()).is_chat_local());
        assert!(!DirectoryError::Api("internal".to_string()).is_chat_local());
    }

    #[test]
    fn test_display_name_prefers_username() {
        let user = UserInfo {
            id: 1,
            first_name: "Ann".to_string(),
            username: Some("ann_b".to_string()),
        };
        assert_eq!(user.display_name(), "ann_b");

        let bare = UserInfo {
            id: 2,
            first_name: "Bob".to_string(),
            username: None,
        };
        assert_eq!(bare.display_name(), "Bob");
        assert!(!bare.is_deleted());

        let deleted = UserInfo {
            id: 3,
            first_name: String::new(),
            username: None,
        };
        assert!(deleted.is_deleted());
    }
}
