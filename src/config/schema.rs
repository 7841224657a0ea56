//! Typed configuration tree. Wire format is JSON with camelCase keys; the
//! struct field names stay snake_case and carry explicit `rename`s so the
//! on-disk shape matches `spec.md` §6 exactly.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Declares a `Debug` impl that prints `"<redacted>"` for the named fields
/// instead of their value, so accidental `{:?}` logging never leaks a
/// token. Mirrors the teacher's `redact_debug!` macro.
macro_rules! redact_debug {
    ($ty:ty, secret: [$($secret:ident),* $(,)?], plain: [$($plain:ident),* $(,)?]) => {
        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($ty))
                    $(.field(stringify!($plain), &self.$plain))*
                    $(.field(stringify!($secret), &if self.$secret.is_empty() { "" } else { "<redacted>" }))*
                    .finish()
            }
        }
    };
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub model: String,
    pub model_fallback: Vec<String>,
    pub offline_mode: OfflineModeConfig,
    pub ollama: OllamaConfig,
    pub battery_mode: BatteryModeConfig,
    pub notifications: NotificationsConfig,
    pub gateway: GatewayConfig,
    pub update: UpdateConfig,
    pub channels: ChannelsConfig,
    pub security: SecurityConfig,
    pub auth: AuthConfig,
    pub skills: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            model: "openai/gpt-4o-mini".to_string(),
            model_fallback: vec!["ollama/tinyllama".to_string()],
            offline_mode: OfflineModeConfig::default(),
            ollama: OllamaConfig::default(),
            battery_mode: BatteryModeConfig::default(),
            notifications: NotificationsConfig::default(),
            gateway: GatewayConfig::default(),
            update: UpdateConfig::default(),
            channels: ChannelsConfig::default(),
            security: SecurityConfig::default(),
            auth: AuthConfig::default(),
            skills: Vec::new(),
        }
    }
}

/// Stored-config fallback tokens, consulted when the matching env var from
/// a provider's spec is absent. Grounded on
/// `original_source/clawlite/runtime/offline.py::_provider_token`.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthConfig {
    pub providers: std::collections::HashMap<String, ProviderAuth>,
}

#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderAuth {
    pub token: String,
}

redact_debug!(ProviderAuth, secret: [token], plain: []);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OfflineModeConfig {
    pub enabled: bool,
    pub auto_fallback_to_ollama: bool,
    pub connectivity_timeout_sec: f64,
}

impl Default for OfflineModeConfig {
    fn default() -> Self {
        OfflineModeConfig { enabled: true, auto_fallback_to_ollama: true, connectivity_timeout_sec: 1.5 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OllamaConfig {
    pub model: String,
    pub timeout_secs: u64,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        OllamaConfig { model: "tinyllama".to_string(), timeout_secs: 90 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BatteryModeConfig {
    pub enabled: bool,
    pub throttle_seconds: f64,
}

impl Default for BatteryModeConfig {
    fn default() -> Self {
        BatteryModeConfig { enabled: false, throttle_seconds: 10.0 }
    }
}

impl BatteryModeConfig {
    /// `base` unless battery mode is enabled, in which case the poll
    /// interval is stretched to at least `throttle_seconds`. Grounded on
    /// `original_source/clawlite/runtime/battery.py::effective_poll_seconds`.
    pub fn effective_poll_seconds(&self, base: f64) -> f64 {
        if !self.enabled {
            return base;
        }
        base.max(self.throttle_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NotificationsConfig {
    pub enabled: bool,
    pub dedupe_window_seconds: u64,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        NotificationsConfig { enabled: true, dedupe_window_seconds: 600 }
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub token: String,
    pub heartbeat_interval_s: u64,
    pub cron_poll_interval_s: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            host: "127.0.0.1".to_string(),
            port: 8787,
            token: String::new(),
            heartbeat_interval_s: 900,
            cron_poll_interval_s: 5,
        }
    }
}

redact_debug!(GatewayConfig, secret: [token], plain: [host, port, heartbeat_interval_s, cron_poll_interval_s]);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdateConfig {
    pub channel: String,
    pub check_on_start: bool,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        UpdateConfig { channel: "stable".to_string(), check_on_start: true }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChannelsConfig {
    pub telegram: Option<TelegramConfig>,
    pub discord: Option<DiscordConfig>,
    pub slack: Option<SlackConfig>,
    pub whatsapp: Option<WhatsAppConfig>,
    pub googlechat: Option<GoogleChatConfig>,
    pub irc: Option<IrcConfig>,
    pub signal: Option<SignalConfig>,
    pub imessage: Option<IMessageConfig>,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChannelBase {
    pub enabled: bool,
    pub token: String,
    pub chat_id: Option<String>,
    pub accounts: Vec<String>,
    pub allow_from: Vec<String>,
    pub allow_channels: Vec<String>,
}

impl Default for ChannelBase {
    fn default() -> Self {
        ChannelBase {
            enabled: false,
            token: String::new(),
            chat_id: None,
            accounts: Vec::new(),
            allow_from: Vec::new(),
            allow_channels: Vec::new(),
        }
    }
}

redact_debug!(ChannelBase, secret: [token], plain: [enabled, chat_id, accounts, allow_from, allow_channels]);

macro_rules! channel_config {
    ($name:ident) => {
        #[derive(Clone, Serialize, Deserialize)]
        #[serde(rename_all = "camelCase", default)]
        pub struct $name {
            #[serde(flatten)]
            pub base: ChannelBase,
        }

        impl Default for $name {
            fn default() -> Self {
                $name { base: ChannelBase::default() }
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($name)).field("base", &self.base).finish()
            }
        }
    };
}

channel_config!(TelegramConfig);
channel_config!(DiscordConfig);
channel_config!(SlackConfig);
channel_config!(WhatsAppConfig);
channel_config!(GoogleChatConfig);
channel_config!(IrcConfig);
channel_config!(SignalConfig);
channel_config!(IMessageConfig);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PairingConfig {
    pub enabled: bool,
    pub code_ttl_seconds: u64,
}

impl Default for PairingConfig {
    fn default() -> Self {
        PairingConfig { enabled: false, code_ttl_seconds: 24 * 60 * 60 }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RbacConfig {
    pub viewer_tokens: Vec<String>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SecurityConfig {
    pub allow_shell_exec: bool,
    pub redact_tokens_in_logs: bool,
    pub pairing: PairingConfig,
    pub rbac: RbacConfig,
    pub tool_policies: std::collections::HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_config_debug_redacts_token() {
        let cfg = GatewayConfig { token: "super-secret".to_string(), ..GatewayConfig::default() };
        let rendered = format!("{cfg:?}");
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn default_config_round_trips_through_json() {
        let cfg = Config::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.model, cfg.model);
        assert_eq!(back.gateway.port, cfg.gateway.port);
    }

    #[test]
    fn pairing_defaults_match_spec() {
        let pairing = PairingConfig::default();
        assert_eq!(pairing.code_ttl_seconds, 86_400);
    }
}
