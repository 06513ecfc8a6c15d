use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::sources::Platform;

/// Bitrate used for `Bitrate::Auto` when the channel does not report one
pub const DEFAULT_BITRATE: i32 = 64_000;

/// Ceiling for each of the two reconnection waits
pub const RECONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-player settings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PlayerOptions {
    pub engine: Platform,
    pub leave_on_end: bool,
    pub self_deaf: bool,
    pub self_mute: bool,
    pub default_bitrate: i32,
    /// Volume (percent) applied to tracks before any `set_volume` call
    pub default_volume: Option<f64>,
    pub reconnect_timeout: Duration,
}

impl Default for PlayerOptions {
    fn default() -> Self {
        Self {
            engine: Platform::YouTube,
            leave_on_end: true,
            self_deaf: true,
            self_mute: false,
            default_bitrate: DEFAULT_BITRATE,
            default_volume: None,
            reconnect_timeout: RECONNECT_TIMEOUT,
        }
    }
}

/// Settings shared by every player a client creates
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ClientSettings {
    pub player: PlayerOptions,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    // Motor
    pub engine: String,

    // Voz
    pub leave_on_end: bool,
    pub self_deaf: bool,
    pub self_mute: bool,
    pub reconnect_timeout_secs: u64,

    // Audio
    pub default_bitrate: i32,
    pub default_volume: Option<f64>,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            engine: std::env::var("MUSIC_ENGINE").unwrap_or_else(|_| "YouTube".to_string()),

            leave_on_end: std::env::var("LEAVE_ON_END")
                .unwrap_or_else(|_| "true".to_string())
                .parse()?,
            self_deaf: std::env::var("SELF_DEAF")
                .unwrap_or_else(|_| "true".to_string())
                .parse()?,
            self_mute: std::env::var("SELF_MUTE")
                .unwrap_or_else(|_| "false".to_string())
                .parse()?,
            reconnect_timeout_secs: std::env::var("RECONNECT_TIMEOUT_SECS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()?,

            default_bitrate: std::env::var("DEFAULT_BITRATE")
                .unwrap_or_else(|_| DEFAULT_BITRATE.to_string())
                .parse()?,
            default_volume: match std::env::var("DEFAULT_VOLUME") {
                Ok(val) if !val.trim().is_empty() => Some(val.parse()?),
                _ => None,
            },
        };

        config.validate()?;

        Ok(config)
    }

    /// Validates configuration values for correctness.
    ///
    /// # Validation Rules
    ///
    /// - Engine must name a supported platform
    /// - Bitrate must be between 8kbps and 510kbps (Discord limits)
    /// - Volume must be between 0 and 200 percent
    /// - Reconnect timeout must be greater than zero
    pub fn validate(&self) -> Result<()> {
        self.engine.parse::<Platform>()?;

        if self.default_bitrate > 510_000 {
            anyhow::bail!("Bitrate cannot exceed 510kbps, got: {}", self.default_bitrate);
        }

        if self.default_bitrate < 8_000 {
            anyhow::bail!("Bitrate too low, minimum 8kbps, got: {}", self.default_bitrate);
        }

        if let Some(volume) = self.default_volume {
            if !(0.0..=200.0).contains(&volume) {
                anyhow::bail!("Default volume must be between 0 and 200, got: {}", volume);
            }
        }

        if self.reconnect_timeout_secs == 0 {
            anyhow::bail!("Reconnect timeout must be greater than 0");
        }

        Ok(())
    }

    /// Returns a summary of the current configuration for logging.
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Engine: {}\n  \
            Voice: leave_on_end={}, deaf={}, mute={}, reconnect {}s\n  \
            Audio: {}kbps, {} vol",
            self.engine,
            self.leave_on_end,
            self.self_deaf,
            self.self_mute,
            self.reconnect_timeout_secs,
            self.default_bitrate / 1000,
            self.default_volume
                .map_or("default".to_string(), |v| format!("{}%", v)),
        )
    }

    /// Converts into the settings a [`MusicClient`](crate::client::MusicClient) hands to its players
    pub fn client_settings(&self) -> Result<ClientSettings> {
        Ok(ClientSettings {
            player: PlayerOptions {
                engine: self.engine.parse()?,
                leave_on_end: self.leave_on_end,
                self_deaf: self.self_deaf,
                self_mute: self.self_mute,
                default_bitrate: self.default_bitrate,
                default_volume: self.default_volume,
                reconnect_timeout: Duration::from_secs(self.reconnect_timeout_secs),
            },
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine: "YouTube".to_string(),
            leave_on_end: true,
            self_deaf: true,
            self_mute: false,
            reconnect_timeout_secs: RECONNECT_TIMEOUT.as_secs(),
            default_bitrate: DEFAULT_BITRATE,
            default_volume: None,
        }
    }
}
