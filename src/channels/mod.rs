pub mod base;
pub mod discord;
pub mod googlechat;
pub mod irc;
pub mod manager;
pub mod slack;
pub mod telegram;
pub mod webhook_bridge;
pub mod whatsapp;

pub use base::{BaseChannel, Health, WebhookEnvelope};
pub use manager::ChannelManager;

/// Session-id prefixes per transport, per `spec.md` §4.2.
pub mod session_id {
    pub fn telegram(chat_id: &str) -> String {
        format!("tg_{}", crate::utils::safe_slug(chat_id))
    }
    pub fn slack(channel_id: &str) -> String {
        format!("sl_{}", crate::utils::safe_slug(channel_id))
    }
    pub fn discord(channel_id: &str) -> String {
        format!("dc_{}", crate::utils::safe_slug(channel_id))
    }
    pub fn whatsapp(from: &str) -> String {
        format!("wa_{}", crate::utils::safe_slug(from))
    }
    pub fn googlechat(scope: &str, space: &str) -> String {
        format!("gc_{}_{}", crate::utils::safe_slug(scope), crate::utils::safe_slug(space))
    }
    pub fn irc(is_dm: bool, peer_or_channel: &str) -> String {
        let scope = if is_dm { "dm" } else { "group" };
        format!("irc_{scope}_{}", crate::utils::safe_slug(peer_or_channel))
    }
    pub fn signal(is_dm: bool, peer_or_group: &str) -> String {
        let scope = if is_dm { "dm" } else { "group" };
        format!("signal_{scope}_{}", crate::utils::safe_slug(peer_or_group))
    }
    pub fn imessage(is_dm: bool, peer_or_group: &str) -> String {
        let scope = if is_dm { "dm" } else { "group" };
        format!("imessage_{scope}_{}", crate::utils::safe_slug(peer_or_group))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_follow_the_spec_prefixes() {
        assert_eq!(session_id::telegram("123"), "tg_123");
        assert_eq!(session_id::googlechat("spaces", "AAA1"), "gc_spaces_aaa1");
        assert_eq!(session_id::irc(true, "Nick!"), "irc_dm_nick_");
    }
}
