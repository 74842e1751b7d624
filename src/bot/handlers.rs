//! Telegram-facing command, callback, and message handlers.
//!
//! These functions translate updates into calls on [`Broker`] and
//! [`Propagator`] and render the results back as chat messages. All
//! authorization beyond "is this a group admin" lives in those two types;
//! handlers only do transport-level parsing.

use std::sync::Arc;

use anyhow::Result;
use teloxide::prelude::*;
use teloxide::types::{
    CallbackQuery, InlineKeyboardButton, InlineKeyboardMarkup, InputFile, ParseMode,
};
use teloxide::utils::command::BotCommands;
use tracing::{debug, warn};

use crate::broker::{Broker, BrokerError, Resolution};
use crate::config::Settings;
use crate::directory::{ChatDirectory, ChatTarget};
use crate::gban::{escape, Actor, GbanError, GbanOutcome, Propagator};
use crate::store::Store;

#[derive(BotCommands, Clone, Debug)]
#[command(rename_rule = "lowercase")]
pub enum Command {
    #[command(description = "connect to a chat by ID or @handle")]
    Connect(String),
    #[command(description = "show your current connection")]
    Connection,
    #[command(description = "disconnect from the connected chat")]
    Disconnect,
    #[command(description = "allow or forbid non-admin members to connect")]
    Allowconnect(String),
    #[command(description = "globally ban a user")]
    Gban(String),
    #[command(description = "lift a global ban")]
    Ungban(String),
    #[command(description = "export the global ban list")]
    Gbanlist,
    #[command(description = "toggle global ban enforcement in this chat")]
    Gbanstat(String),
    #[command(description = "look up a user's global ban status")]
    Gbaninfo(String),
}

/// Sender ID as a signed integer, `0` for channel posts without a sender.
pub fn sender_id(msg: &Message) -> i64 {
    msg.from
        .as_ref()
        .map(|user| user.id.0.cast_signed())
        .unwrap_or(0)
}

fn actor_of(msg: &Message) -> Actor {
    let name = msg
        .from
        .as_ref()
        .map(|user| user.full_name())
        .unwrap_or_else(|| "anonymous".to_owned());
    Actor {
        id: sender_id(msg),
        name,
    }
}

/// Target user plus optional free-text remainder, from a reply or from the
/// leading numeric token of the command arguments.
fn extract_target(msg: &Message, args: &str) -> Option<(i64, Option<String>)> {
    if let Some(replied) = msg.reply_to_message() {
        let target = replied.from.as_ref()?.id.0.cast_signed();
        let rest = args.trim();
        let reason = (!rest.is_empty()).then(|| rest.to_owned());
        return Some((target, reason));
    }
    let mut parts = args.split_whitespace();
    let target: i64 = parts.next()?.parse().ok()?;
    let rest = parts.collect::<Vec<_>>().join(" ");
    let reason = (!rest.is_empty()).then_some(rest);
    Some((target, reason))
}

async fn reply_html(bot: &Bot, msg: &Message, text: &str) -> Result<()> {
    bot.send_message(msg.chat.id, text)
        .parse_mode(ParseMode::Html)
        .await?;
    Ok(())
}

pub async fn handle_command(
    bot: Bot,
    msg: Message,
    cmd: Command,
    store: Store,
    broker: Arc<Broker>,
    propagator: Arc<Propagator>,
    settings: Arc<Settings>,
    directory: Arc<dyn ChatDirectory>,
) -> Result<()> {
    if !msg.chat.is_private() {
        store.record_chat(msg.chat.id.0, msg.chat.title()).await?;
    }
    match cmd {
        Command::Connect(args) => connect(&bot, &msg, &broker, &args).await,
        Command::Connection => connection(&bot, &msg, &broker, &directory).await,
        Command::Disconnect => disconnect(&bot, &msg, &broker).await,
        Command::Allowconnect(args) => {
            allowconnect(&bot, &msg, &store, &directory, &settings, &args).await
        }
        Command::Gban(args) => gban(&bot, &msg, &propagator, &args).await,
        Command::Ungban(args) => ungban(&bot, &msg, &propagator, &args).await,
        Command::Gbanlist => gbanlist(&bot, &msg, &propagator).await,
        Command::Gbanstat(args) => gbanstat(&bot, &msg, &propagator, &directory, &settings, &args).await,
        Command::Gbaninfo(args) => gbaninfo(&bot, &msg, &propagator, &args).await,
    }
}

async fn connect(bot: &Bot, msg: &Message, broker: &Broker, args: &str) -> Result<()> {
    let user_id = sender_id(msg);
    if !msg.chat.is_private() {
        // In a group the argument is ignored, the group itself is the target.
        match broker.connect(user_id, ChatTarget::Id(msg.chat.id.0)).await {
            Ok(chat) => {
                let text = format!(
                    "Connected to <b>{}</b>. Check your private chat with me to manage it.",
                    escape(&chat.title)
                );
                reply_html(bot, msg, &text).await?;
            }
            Err(BrokerError::Unauthorized) => {
                reply_html(bot, msg, "Connection to this chat is not allowed!").await?;
            }
            Err(BrokerError::NotFound) => {
                reply_html(bot, msg, "Invalid chat ID!").await?;
            }
            Err(err) => return Err(err.into()),
        }
        return Ok(());
    }
    let target = args.trim();
    if target.is_empty() {
        return connection_menu(bot, msg, broker).await;
    }
    match broker.connect(user_id, ChatTarget::parse(target)).await {
        Ok(chat) => {
            let text = format!("Successfully connected to <b>{}</b>.", escape(&chat.title));
            reply_html(bot, msg, &text).await?;
        }
        Err(BrokerError::NotFound) => {
            reply_html(bot, msg, "Invalid chat ID!").await?;
        }
        Err(BrokerError::Unauthorized) => {
            reply_html(bot, msg, "Connection to this chat is not allowed!").await?;
        }
        Err(err) => return Err(err.into()),
    }
    Ok(())
}

/// Private-chat overview with the recent-connection keyboard.
async fn connection_menu(bot: &Bot, msg: &Message, broker: &Broker) -> Result<()> {
    let user_id = sender_id(msg);
    let connected = broker.connected_chat(user_id).await?;
    let history = broker.history(user_id).await?;

    let mut text = match connected {
        Some(chat_id) => format!("You are currently connected to <code>{chat_id}</code>."),
        None => "Send a chat ID or @handle to connect, or pick a recent chat.".to_owned(),
    };
    let mut rows: Vec<Vec<InlineKeyboardButton>> = Vec::new();
    for entry in &history {
        rows.push(vec![InlineKeyboardButton::callback(
            entry.chat_name.clone(),
            format!("connect({})", entry.chat_id),
        )]);
    }
    let mut controls = Vec::new();
    if connected.is_some() {
        controls.push(InlineKeyboardButton::callback(
            "Disconnect",
            "connect_disconnect",
        ));
    }
    if !history.is_empty() {
        controls.push(InlineKeyboardButton::callback(
            "Clear history",
            "connect_clear",
        ));
        text.push_str("\n\nRecent connections:");
        for entry in &history {
            text.push_str(&format!(
                "\n• {} ({})",
                escape(&entry.chat_name),
                entry.connected_at.format("%d/%m/%Y")
            ));
        }
    }
    controls.push(InlineKeyboardButton::callback("Close", "connect_close"));
    rows.push(controls);

    bot.send_message(msg.chat.id, text)
        .parse_mode(ParseMode::Html)
        .reply_markup(InlineKeyboardMarkup::new(rows))
        .await?;
    Ok(())
}

async fn connection(
    bot: &Bot,
    msg: &Message,
    broker: &Broker,
    directory: &Arc<dyn ChatDirectory>,
) -> Result<()> {
    let user_id = sender_id(msg);
    match broker
        .resolve(user_id, msg.chat.is_private(), false)
        .await?
    {
        Resolution::Connected(chat_id) => {
            let title = match directory.resolve_chat(ChatTarget::Id(chat_id)).await {
                Ok(chat) => chat.title,
                Err(err) => {
                    debug!(chat_id, error = %err, "title lookup failed");
                    chat_id.to_string()
                }
            };
            let text = format!("You are currently connected to <b>{}</b>.", escape(&title));
            reply_html(bot, msg, &text).await?;
        }
        Resolution::NotConnected => {
            reply_html(bot, msg, "You are not connected to any chat.").await?;
        }
        Resolution::Revoked => {
            reply_html(
                bot,
                msg,
                "Your connection was revoked because you no longer have access to that chat.",
            )
            .await?;
        }
    }
    Ok(())
}

async fn disconnect(bot: &Bot, msg: &Message, broker: &Broker) -> Result<()> {
    if !msg.chat.is_private() {
        reply_html(bot, msg, "This command is meant to be used in PM, not in a group!").await?;
        return Ok(());
    }
    if broker.disconnect(sender_id(msg)).await? {
        reply_html(bot, msg, "Disconnected from chat!").await?;
    } else {
        reply_html(bot, msg, "You're not connected!").await?;
    }
    Ok(())
}

async fn allowconnect(
    bot: &Bot,
    msg: &Message,
    store: &Store,
    directory: &Arc<dyn ChatDirectory>,
    settings: &Settings,
    args: &str,
) -> Result<()> {
    if msg.chat.is_private() {
        reply_html(bot, msg, "This command is meant to be used in a group, not in PM!").await?;
        return Ok(());
    }
    let user_id = sender_id(msg);
    let is_admin = match directory.member_status(msg.chat.id.0, user_id).await {
        Ok(status) => status.is_admin(),
        Err(err) => {
            debug!(user_id, error = %err, "admin check failed");
            false
        }
    };
    if !is_admin && !settings.sudo_users().contains(&user_id) {
        reply_html(bot, msg, "You need to be an admin to do this.").await?;
        return Ok(());
    }
    match args.trim().to_ascii_lowercase().as_str() {
        "on" | "yes" => {
            store.set_member_connections(msg.chat.id.0, true).await?;
            reply_html(bot, msg, "Members are now allowed to connect to this chat.").await?;
        }
        "off" | "no" => {
            store.set_member_connections(msg.chat.id.0, false).await?;
            reply_html(bot, msg, "Connecting is now restricted to admins.").await?;
        }
        "" => {
            let allowed = store.allows_member_connections(msg.chat.id.0).await?;
            let text = if allowed {
                "Members are currently allowed to connect to this chat."
            } else {
                "Connecting is currently restricted to admins."
            };
            reply_html(bot, msg, text).await?;
        }
        _ => {
            reply_html(bot, msg, "Please enter <code>on</code> or <code>off</code>!").await?;
        }
    }
    Ok(())
}

async fn gban(bot: &Bot, msg: &Message, propagator: &Propagator, args: &str) -> Result<()> {
    // Non-privileged callers get no reply at all, same as an unknown command.
    if !propagator.is_privileged(sender_id(msg)) {
        return Ok(());
    }
    let Some((target, reason)) = extract_target(msg, args) else {
        reply_html(bot, msg, "You don't seem to be referring to a user.").await?;
        return Ok(());
    };
    let actor = actor_of(msg);
    match propagator.gban(&actor, target, reason.as_deref()).await {
        Ok(GbanOutcome::Banned { user, chats_banned }) => {
            let text = format!(
                "Globally banned <b>{}</b> (<code>{}</code>), removed from {} chats.",
                escape(&user.display_name()),
                user.id,
                chats_banned
            );
            reply_html(bot, msg, &text).await?;
        }
        Ok(GbanOutcome::ReasonUpdated { user, previous }) => {
            let text = format!(
                "<b>{}</b> is already globally banned, reason updated.\nPrevious reason: {}",
                escape(&user.display_name()),
                escape(previous.as_deref().unwrap_or("none"))
            );
            reply_html(bot, msg, &text).await?;
        }
        Err(GbanError::FanOutAborted { chat_id, source }) => {
            warn!(user = target, chat_id, error = %source, "gban fan-out aborted");
            let text = format!("Could not gban due to: {source}");
            reply_html(bot, msg, &escape(&text)).await?;
        }
        Err(
            err @ (GbanError::TargetIsSudo
            | GbanError::TargetIsSupport
            | GbanError::TargetIsSelf
            | GbanError::NotAUser
            | GbanError::DeletedAccount
            | GbanError::AlreadyBanned),
        ) => {
            reply_html(bot, msg, &escape(&err.to_string())).await?;
        }
        Err(err) => return Err(err.into()),
    }
    Ok(())
}

async fn ungban(bot: &Bot, msg: &Message, propagator: &Propagator, args: &str) -> Result<()> {
    if !propagator.is_privileged(sender_id(msg)) {
        return Ok(());
    }
    let Some((target, _)) = extract_target(msg, args) else {
        reply_html(bot, msg, "You don't seem to be referring to a user.").await?;
        return Ok(());
    };
    let actor = actor_of(msg);
    match propagator.ungban(&actor, target).await {
        Ok(restored) => {
            let text = format!(
                "Lifted the global ban on <code>{target}</code>, restored in {restored} chats."
            );
            reply_html(bot, msg, &text).await?;
        }
        Err(GbanError::NotBanned) => {
            reply_html(bot, msg, "This user is not globally banned.").await?;
        }
        Err(GbanError::FanOutAborted { chat_id, source }) => {
            warn!(user = target, chat_id, error = %source, "ungban fan-out aborted");
            let text = format!("Could not ungban due to: {source}");
            reply_html(bot, msg, &escape(&text)).await?;
        }
        Err(err) => return Err(err.into()),
    }
    Ok(())
}

async fn gbanlist(bot: &Bot, msg: &Message, propagator: &Propagator) -> Result<()> {
    if !propagator.is_privileged(sender_id(msg)) {
        return Ok(());
    }
    match propagator.export_list().await? {
        None => {
            reply_html(bot, msg, "There aren't any globally banned users.").await?;
        }
        Some(listing) => {
            let file = InputFile::memory(listing.into_bytes()).file_name("gbanlist.txt");
            bot.send_document(msg.chat.id, file).await?;
        }
    }
    Ok(())
}

async fn gbanstat(
    bot: &Bot,
    msg: &Message,
    propagator: &Propagator,
    directory: &Arc<dyn ChatDirectory>,
    settings: &Settings,
    args: &str,
) -> Result<()> {
    if msg.chat.is_private() {
        reply_html(bot, msg, "This command is meant to be used in a group, not in PM!").await?;
        return Ok(());
    }
    let user_id = sender_id(msg);
    let is_admin = match directory.member_status(msg.chat.id.0, user_id).await {
        Ok(status) => status.is_admin(),
        Err(err) => {
            debug!(user_id, error = %err, "admin check failed");
            false
        }
    };
    if !is_admin && !settings.sudo_users().contains(&user_id) {
        reply_html(bot, msg, "You need to be an admin to do this.").await?;
        return Ok(());
    }
    match args.trim().to_ascii_lowercase().as_str() {
        "on" | "yes" => {
            propagator.set_enforcement(msg.chat.id.0, true).await?;
            reply_html(
                bot,
                msg,
                "Global bans are now enforced in this chat. Known troublemakers will be removed.",
            )
            .await?;
        }
        "off" | "no" => {
            propagator.set_enforcement(msg.chat.id.0, false).await?;
            reply_html(
                bot,
                msg,
                "Global bans are no longer enforced in this chat. Users will not be removed automatically.",
            )
            .await?;
        }
        "" => {
            let enforcing = propagator.enforces(msg.chat.id.0).await?;
            let text = if enforcing {
                "This chat currently enforces global bans."
            } else {
                "This chat currently ignores global bans."
            };
            reply_html(bot, msg, text).await?;
        }
        _ => {
            reply_html(bot, msg, "Please enter <code>on</code> or <code>off</code>!").await?;
        }
    }
    Ok(())
}

async fn gbaninfo(bot: &Bot, msg: &Message, propagator: &Propagator, args: &str) -> Result<()> {
    let arg = args.trim();
    let target = if arg.is_empty() {
        msg.reply_to_message()
            .and_then(|replied| replied.from.as_ref())
            .map(|user| user.id.0.cast_signed())
    } else {
        arg.parse::<i64>().ok()
    };
    let Some(target) = target else {
        let total = propagator.count().await?;
        let text = format!("{total} users are globally banned in total.");
        reply_html(bot, msg, &text).await?;
        return Ok(());
    };
    match propagator.entry(target).await? {
        Some(entry) => {
            let mut text = format!(
                "<b>{}</b> (<code>{}</code>) is globally banned.",
                escape(&entry.display_name),
                entry.user_id
            );
            if let Some(reason) = &entry.reason {
                text.push_str(&format!("\nReason: {}", escape(reason)));
            }
            reply_html(bot, msg, &text).await?;
        }
        None => {
            reply_html(bot, msg, "This user is not globally banned.").await?;
        }
    }
    Ok(())
}

/// Non-command group traffic: keep the chat registry fresh, apply pending
/// migrations, and run the reactive global ban check.
pub async fn observe_message(
    bot: Bot,
    msg: Message,
    store: Store,
    propagator: Arc<Propagator>,
    settings: Arc<Settings>,
) -> Result<()> {
    if msg.chat.is_private() {
        return Ok(());
    }
    let chat_id = msg.chat.id.0;
    if let Some(to) = msg.migrate_to_chat_id() {
        store.migrate_chat(chat_id, to.0).await?;
        return Ok(());
    }
    store.record_chat(chat_id, msg.chat.title()).await?;
    if !settings.strict_gban {
        return Ok(());
    }

    if let Some(from) = &msg.from {
        if propagator.enforce(chat_id, from.id.0.cast_signed()).await? {
            reply_html(
                &bot,
                &msg,
                "This is a globally banned user, they shouldn't be here!",
            )
            .await?;
            return Ok(());
        }
    }
    if let Some(members) = msg.new_chat_members() {
        for member in members {
            if propagator
                .enforce(chat_id, member.id.0.cast_signed())
                .await?
            {
                reply_html(
                    &bot,
                    &msg,
                    "This is a globally banned user, they shouldn't be here!",
                )
                .await?;
            }
        }
    }
    if let Some(replied) = msg.reply_to_message() {
        if let Some(from) = &replied.from {
            propagator.enforce(chat_id, from.id.0.cast_signed()).await?;
        }
    }
    Ok(())
}

/// Inline keyboard actions from the private connection menu.
pub async fn handle_callback(bot: Bot, q: CallbackQuery, broker: Arc<Broker>) -> Result<()> {
    let Some(data) = q.data.clone() else {
        bot.answer_callback_query(q.id.clone()).await?;
        return Ok(());
    };
    let user_id = q.from.id.0.cast_signed();

    if let Some(raw) = data.strip_prefix("connect(").and_then(|s| s.strip_suffix(')')) {
        match raw.parse::<i64>() {
            Ok(chat_id) => match broker.connect(user_id, ChatTarget::Id(chat_id)).await {
                Ok(chat) => {
                    let text =
                        format!("Successfully connected to <b>{}</b>.", escape(&chat.title));
                    edit_menu(&bot, &q, &text).await?;
                }
                Err(BrokerError::Unauthorized) => {
                    bot.answer_callback_query(q.id.clone())
                        .text("Connection to this chat is not allowed!")
                        .show_alert(true)
                        .await?;
                    return Ok(());
                }
                Err(BrokerError::NotFound) => {
                    bot.answer_callback_query(q.id.clone())
                        .text("That chat no longer exists.")
                        .show_alert(true)
                        .await?;
                    return Ok(());
                }
                Err(err) => return Err(err.into()),
            },
            Err(_) => debug!(data, "malformed connect callback"),
        }
    } else {
        match data.as_str() {
            "connect_disconnect" => {
                if broker.disconnect(user_id).await? {
                    edit_menu(&bot, &q, "Disconnected from chat!").await?;
                } else {
                    bot.answer_callback_query(q.id.clone())
                        .text("You're not connected!")
                        .show_alert(true)
                        .await?;
                    return Ok(());
                }
            }
            "connect_clear" => {
                broker.clear_history(user_id).await?;
                edit_menu(&bot, &q, "Connection history cleared.").await?;
            }
            "connect_close" => {
                edit_menu(&bot, &q, "Closed. Use /connect to open the menu again.").await?;
            }
            other => debug!(data = other, "unknown callback"),
        }
    }
    bot.answer_callback_query(q.id).await?;
    Ok(())
}

async fn edit_menu(bot: &Bot, q: &CallbackQuery, text: &str) -> Result<()> {
    if let Some(message) = q.regular_message() {
        bot.edit_message_text(message.chat.id, message.id, text)
            .parse_mode(ParseMode::Html)
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_parsing() {
        let cmd = Command::parse("/connect -100123", "testbot").unwrap();
        match cmd {
            Command::Connect(args) => assert_eq!(args, "-100123"),
            other => panic!("unexpected command: {other:?}"),
        }
        let cmd = Command::parse("/gban 42 spamming invite links", "testbot").unwrap();
        match cmd {
            Command::Gban(args) => assert_eq!(args, "42 spamming invite links"),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_callback_data_shapes() {
        let data = "connect(-100987)";
        let inner = data
            .strip_prefix("connect(")
            .and_then(|s| s.strip_suffix(')'))
            .unwrap();
        assert_eq!(inner.parse::<i64>().unwrap(), -100987);
        assert!("connect_close".strip_prefix("connect(").is_none());
    }
}
