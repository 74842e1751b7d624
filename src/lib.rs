//! Groupwarden - group-management core for Telegram
//!
//! A Telegram bot that maintains a global ban list propagated across every
//! group it knows about, and lets admins manage their groups remotely by
//! connecting a private chat to a group.

/// Telegram bot implementation (commands, callbacks, enforcement)
pub mod bot;
/// Per-user chat connection broker
pub mod broker;
/// Configuration management
pub mod config;
/// Collaborator interfaces over the Telegram API
pub mod directory;
/// Global-ban list and cross-chat propagation
pub mod gban;
/// Storage layer (SQLite)
pub mod store;

#[cfg(test)]
pub mod testing;
