//! Configuration parsed from environment variables.
//!
//! DESIGN
//! ======
//! Each config type has `from_env` for production and `from_lookup` taking
//! any key lookup, so parsing is tested without touching process env.

use std::str::FromStr;

pub const DEFAULT_MESSAGES_TABLE: &str = "group_messages";
pub const DEFAULT_USERS_TABLE: &str = "users";
pub const DEFAULT_MEMBERS_TABLE: &str = "group_members";
pub const DEFAULT_UNKNOWN_AUTHOR: &str = "Unknown";
pub const DEFAULT_SELF_AUTHOR: &str = "You";
pub const DEFAULT_EVENT_BUFFER: usize = 256;

pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_HEARTBEAT_SECS: u64 = 25;

/// Configuration failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required env var {var}")]
    Missing { var: &'static str },

    #[error("invalid value for {var}: {value:?}")]
    Invalid { var: &'static str, value: String },
}

impl crate::error::ErrorCode for ConfigError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Missing { .. } => "E_CONFIG_MISSING",
            Self::Invalid { .. } => "E_CONFIG_INVALID",
        }
    }
}

// =============================================================================
// CHAT
// =============================================================================

/// Knobs for one chat view: table names, fallback labels, channel sizing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatConfig {
    /// Table holding chat messages.
    pub messages_table: String,
    /// Table used as the user directory.
    pub users_table: String,
    /// Table mapping users to groups.
    pub members_table: String,
    /// Label for authors the directory cannot resolve.
    pub unknown_author: String,
    /// Label for the local user when the auth profile has no usable name.
    pub self_author: String,
    /// Check `members_table` before each send.
    pub verify_membership: bool,
    /// Capacity of the live-update channel.
    pub event_buffer: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            messages_table: DEFAULT_MESSAGES_TABLE.to_owned(),
            users_table: DEFAULT_USERS_TABLE.to_owned(),
            members_table: DEFAULT_MEMBERS_TABLE.to_owned(),
            unknown_author: DEFAULT_UNKNOWN_AUTHOR.to_owned(),
            self_author: DEFAULT_SELF_AUTHOR.to_owned(),
            verify_membership: true,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

impl ChatConfig {
    /// Build chat config from environment variables.
    ///
    /// Optional:
    /// - `CHAT_MESSAGES_TABLE`: default `group_messages`
    /// - `CHAT_USERS_TABLE`: default `users`
    /// - `CHAT_MEMBERS_TABLE`: default `group_members`
    /// - `CHAT_UNKNOWN_AUTHOR`: default `Unknown`
    /// - `CHAT_SELF_AUTHOR`: default `You`
    /// - `CHAT_VERIFY_MEMBERSHIP`: `true` (default) or `false`
    /// - `CHAT_EVENT_BUFFER`: default 256
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when a value fails to parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build chat config from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when a value fails to parse.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let text = |key: &str, default: String| lookup(key).filter(|v| !v.trim().is_empty()).unwrap_or(default);

        let event_buffer = parse_var(&lookup, "CHAT_EVENT_BUFFER", DEFAULT_EVENT_BUFFER)?;
        if event_buffer == 0 {
            return Err(ConfigError::Invalid { var: "CHAT_EVENT_BUFFER", value: "0".to_owned() });
        }

        Ok(Self {
            messages_table: text("CHAT_MESSAGES_TABLE", defaults.messages_table),
            users_table: text("CHAT_USERS_TABLE", defaults.users_table),
            members_table: text("CHAT_MEMBERS_TABLE", defaults.members_table),
            unknown_author: text("CHAT_UNKNOWN_AUTHOR", defaults.unknown_author),
            self_author: text("CHAT_SELF_AUTHOR", defaults.self_author),
            verify_membership: parse_var(&lookup, "CHAT_VERIFY_MEMBERSHIP", true)?,
            event_buffer,
        })
    }
}

// =============================================================================
// BACKEND
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendTimeouts {
    pub request_secs: u64,
    pub connect_secs: u64,
}

/// Connection settings for the hosted platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    /// Project base URL without trailing slash, e.g. `https://abc.supabase.co`.
    pub url: String,
    /// Public anon key sent as `apikey` on every request.
    pub anon_key: String,
    /// User access token (JWT). Without one, requests run as anon.
    pub access_token: Option<String>,
    pub timeouts: BackendTimeouts,
    /// Realtime heartbeat interval.
    pub heartbeat_secs: u64,
}

impl BackendConfig {
    /// Build backend config from environment variables.
    ///
    /// Required:
    /// - `SUPABASE_URL`
    /// - `SUPABASE_ANON_KEY`
    ///
    /// Optional:
    /// - `SUPABASE_ACCESS_TOKEN`
    /// - `SUPABASE_REQUEST_TIMEOUT_SECS`: default 30
    /// - `SUPABASE_CONNECT_TIMEOUT_SECS`: default 10
    /// - `SUPABASE_HEARTBEAT_SECS`: default 25
    ///
    /// # Errors
    ///
    /// Returns an error if a required var is missing or a number is malformed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build backend config from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if a required var is missing or a number is malformed.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let url = required(&lookup, "SUPABASE_URL")?.trim_end_matches('/').to_owned();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::Invalid { var: "SUPABASE_URL", value: url });
        }
        let anon_key = required(&lookup, "SUPABASE_ANON_KEY")?;
        let access_token = lookup("SUPABASE_ACCESS_TOKEN").filter(|s| !s.is_empty());

        let timeouts = BackendTimeouts {
            request_secs: parse_var(&lookup, "SUPABASE_REQUEST_TIMEOUT_SECS", DEFAULT_REQUEST_TIMEOUT_SECS)?,
            connect_secs: parse_var(&lookup, "SUPABASE_CONNECT_TIMEOUT_SECS", DEFAULT_CONNECT_TIMEOUT_SECS)?,
        };
        let heartbeat_secs = parse_var(&lookup, "SUPABASE_HEARTBEAT_SECS", DEFAULT_HEARTBEAT_SECS)?;

        Ok(Self { url, anon_key, access_token, timeouts, heartbeat_secs })
    }
}

fn required(lookup: &impl Fn(&str) -> Option<String>, var: &'static str) -> Result<String, ConfigError> {
    lookup(var)
        .filter(|v| !v.trim().is_empty())
        .ok_or(ConfigError::Missing { var })
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
{
    match lookup(var) {
        None => Ok(default),
        Some(raw) if raw.trim().is_empty() => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::Invalid { var, value: raw }),
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
