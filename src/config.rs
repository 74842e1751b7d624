//! Configuration and settings management
//!
//! Loads settings from environment variables and optional config files.

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Application settings loaded from environment variables
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Telegram Bot API token
    pub telegram_token: String,

    /// SQLite database URL
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Comma-separated list of sudo user IDs (full control, can gban)
    #[serde(rename = "sudo_users")]
    pub sudo_users_str: Option<String>,

    /// Comma-separated list of support user IDs (can gban, cannot be gbanned)
    #[serde(rename = "support_users")]
    pub support_users_str: Option<String>,

    /// Chat ID that receives a copy of every gban/ungban event
    pub gban_log_chat: Option<i64>,

    /// Enforce global bans reactively on every group message and join
    #[serde(default = "default_strict_gban")]
    pub strict_gban: bool,

    /// Number of tokio worker threads processing updates
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
}

fn default_database_url() -> String {
    "sqlite://groupwarden.db".to_string()
}

const fn default_strict_gban() -> bool {
    true
}

const fn default_worker_threads() -> usize {
    8
}

impl Settings {
    /// Create new settings by loading from environment and files
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if loading fails.
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            // Start off by merging in the "default" configuration file
            .add_source(File::with_name("config/default").required(false))
            // Add in the current environment file
            .add_source(File::with_name(&format!("config/{run_mode}")).required(false))
            // Add in a local configuration file
            // This file shouldn't be checked into git
            .add_source(File::with_name("config/local").required(false))
            // Add in settings from the environment (with a prefix of APP)
            .add_source(Environment::with_prefix("APP").separator("__"))
            // Also add settings from environment variables directly (without prefix)
            // ignore_empty treats empty env vars as unset
            .add_source(Environment::default().ignore_empty(true))
            .build()?;

        s.try_deserialize()
    }

    /// Returns the set of sudo user IDs
    #[must_use]
    pub fn sudo_users(&self) -> HashSet<i64> {
        parse_id_list(self.sudo_users_str.as_deref())
    }

    /// Returns the set of support user IDs
    #[must_use]
    pub fn support_users(&self) -> HashSet<i64> {
        parse_id_list(self.support_users_str.as_deref())
    }

    /// Sudo and support together: everyone allowed to issue global bans
    #[must_use]
    pub fn privileged_users(&self) -> HashSet<i64> {
        let mut ids = self.sudo_users();
        ids.extend(self.support_users());
        ids
    }
}

fn parse_id_list(raw: Option<&str>) -> HashSet<i64> {
    raw.map(|s| {
        s.split(|c: char| c == ',' || c == ';' || c.is_whitespace())
            .filter(|token| !token.is_empty())
            .filter_map(|id| id.parse::<i64>().ok())
            .collect()
    })
    .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_settings() -> Settings {
        Settings {
            telegram_token: "dummy".to_string(),
            database_url: default_database_url(),
            sudo_users_str: None,
            support_users_str: None,
            gban_log_chat: None,
            strict_gban: true,
            worker_threads: 8,
        }
    }

    #[test]
    fn test_id_list_parsing() {
        let mut settings = bare_settings();

        // Comma separated
        settings.sudo_users_str = Some("123,456".to_string());
        let sudo = settings.sudo_users();
        assert!(sudo.contains(&123));
        assert!(sudo.contains(&456));
        assert_eq!(sudo.len(), 2);

        // Space separated
        settings.sudo_users_str = Some("111 222".to_string());
        let sudo = settings.sudo_users();
        assert!(sudo.contains(&111));
        assert!(sudo.contains(&222));
        assert_eq!(sudo.len(), 2);

        // Semicolon and mixed
        settings.sudo_users_str = Some("333; 444, 555".to_string());
        assert_eq!(settings.sudo_users().len(), 3);

        // Bad tokens are skipped
        settings.sudo_users_str = Some("abc, 777".to_string());
        let sudo = settings.sudo_users();
        assert!(sudo.contains(&777));
        assert_eq!(sudo.len(), 1);
    }

    #[test]
    fn test_privileged_is_union() {
        let mut settings = bare_settings();
        settings.sudo_users_str = Some("1,2".to_string());
        settings.support_users_str = Some("2,3".to_string());

        let privileged = settings.privileged_users();
        assert_eq!(privileged.len(), 3);
        assert!(privileged.contains(&1));
        assert!(privileged.contains(&3));
    }
}
