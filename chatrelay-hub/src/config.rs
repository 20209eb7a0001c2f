//! Configuration for the relay, flattened into the binary's own CLI wrapper
//! (`chatrelay-server`'s `ServerConfig` adds process-lifecycle settings on
//! top of this one via `#[clap(flatten)]`).

use std::time::Duration;

use clap::Parser;
use secrecy::SecretString;

/// CLI/environment-backed configuration for the chat relay.
#[derive(Parser, Debug)]
pub struct RelayConfig {
    /// Address `axum::serve` listens on.
    #[clap(long, env = "RELAY_BIND_ADDR", default_value = "0.0.0.0:8080")]
    pub bind_addr: String,

    /// Maximum message size the session WebSocket accepts.
    #[clap(long, env = "RELAY_WS_MAX_MESSAGE_SIZE", default_value = "65536")]
    pub ws_max_message_size: usize,

    /// Presence record time-to-live.
    #[clap(
        long,
        env = "RELAY_PRESENCE_TTL",
        default_value = "120s",
        value_parser = humantime::parse_duration,
    )]
    pub presence_ttl: Duration,

    /// Interval at which a connection's presence record is refreshed.
    #[clap(
        long,
        env = "RELAY_PRESENCE_REFRESH_INTERVAL",
        default_value = "30s",
        value_parser = humantime::parse_duration,
    )]
    pub presence_refresh_interval: Duration,

    /// Base URL the worker bridge dials back into for `/ws/session/<id>/`.
    #[clap(long, env = "RELAY_URL")]
    pub relay_url: String,

    /// `Origin` header the bridge presents when dialing back in, if any.
    #[clap(long, env = "RELAY_ORIGIN")]
    pub relay_origin: Option<String>,

    /// Base URL of the generation collaborator.
    #[clap(long, env = "COLLABORATOR_URL")]
    pub collaborator_url: String,

    /// Shared secret gating WebSocket admission and the HTTP control plane.
    /// Absent disables the gate (development only).
    #[clap(long, env = "SHARED_SECRET")]
    pub shared_secret: Option<SecretString>,

    /// Timeout for the collaborator's `thread/connect` call.
    #[clap(
        long,
        env = "RELAY_TIMEOUT_THREAD_CONNECT",
        default_value = "10s",
        value_parser = humantime::parse_duration,
    )]
    pub timeout_thread_connect: Duration,

    /// Timeout for the collaborator's `thread/history` call.
    #[clap(
        long,
        env = "RELAY_TIMEOUT_THREAD_HISTORY",
        default_value = "30s",
        value_parser = humantime::parse_duration,
    )]
    pub timeout_thread_history: Duration,

    /// Timeout for the collaborator's `summarize` call.
    #[clap(
        long,
        env = "RELAY_TIMEOUT_SUMMARIZE",
        default_value = "60s",
        value_parser = humantime::parse_duration,
    )]
    pub timeout_summarize: Duration,

    /// Timeout for the collaborator's `chat/sms` call.
    #[clap(
        long,
        env = "RELAY_TIMEOUT_CHAT_SMS",
        default_value = "60s",
        value_parser = humantime::parse_duration,
    )]
    pub timeout_chat_sms: Duration,
}

impl RelayConfig {
    /// Asserts the §4.1 invariant that the presence TTL is at least twice the
    /// refresh interval, so a single missed refresh cannot expire a live
    /// connection. Called once at startup; refuses to start otherwise.
    pub fn assert_presence_ratio(&self) -> eyre::Result<()> {
        if self.presence_ttl < self.presence_refresh_interval * 2 {
            eyre::bail!(
                "presence_ttl ({:?}) must be at least twice presence_refresh_interval ({:?})",
                self.presence_ttl,
                self.presence_refresh_interval,
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ttl_and_refresh_satisfy_the_ratio() {
        let config = RelayConfig {
            bind_addr: "0.0.0.0:8080".into(),
            ws_max_message_size: 65536,
            presence_ttl: Duration::from_secs(120),
            presence_refresh_interval: Duration::from_secs(30),
            relay_url: "ws://localhost:8080".into(),
            relay_origin: None,
            collaborator_url: "http://localhost:9000".into(),
            shared_secret: None,
            timeout_thread_connect: Duration::from_secs(10),
            timeout_thread_history: Duration::from_secs(30),
            timeout_summarize: Duration::from_secs(60),
            timeout_chat_sms: Duration::from_secs(60),
        };
        assert!(config.assert_presence_ratio().is_ok());
    }

    #[test]
    fn rejects_a_ttl_below_twice_the_refresh_interval() {
        let mut config_ratio_source = Duration::from_secs(30);
        config_ratio_source *= 2;
        let config = RelayConfig {
            bind_addr: "0.0.0.0:8080".into(),
            ws_max_message_size: 65536,
            presence_ttl: config_ratio_source - Duration::from_secs(1),
            presence_refresh_interval: Duration::from_secs(30),
            relay_url: "ws://localhost:8080".into(),
            relay_origin: None,
            collaborator_url: "http://localhost:9000".into(),
            shared_secret: None,
            timeout_thread_connect: Duration::from_secs(10),
            timeout_thread_history: Duration::from_secs(30),
            timeout_summarize: Duration::from_secs(60),
            timeout_chat_sms: Duration::from_secs(60),
        };
        assert!(config.assert_presence_ratio().is_err());
    }
}
