//! # Open Music Player
//!
//! Playback core for Discord music bots: one [`Player`] per guild, each
//! owning a [`MusicQueue`] and a voice connection, kept in a [`MusicClient`]
//! registry.
//!
//! Search engines plug in through [`MusicSource`]; voice plugs in through the
//! traits in [`voice`], with [`voice::songbird::SongbirdVoice`] as the
//! production backend.

pub mod audio;
pub mod client;
pub mod config;
pub mod error;
pub mod sources;
pub mod voice;

pub use audio::{
    events::{PlayerEvent, QueueAction, QueueEvent},
    player::{Bitrate, Player, PlayerHandle, RepeatMode, SearchHit, SearchOptions},
    queue::{MusicQueue, RemoveTarget},
    track::{Track, TrackId, TrackInfo},
};
pub use client::MusicClient;
pub use config::{ClientSettings, Config, PlayerOptions};
pub use error::{ErrorKind, PlayerError, Result};
pub use sources::{
    AudioStream, EngineCatalog, MusicSource, Platform, SearchResults, StreamSource, TrackResult,
};

/// Installs the global tracing subscriber.
///
/// `RUST_LOG` is honored; the crate logs at debug and the voice stack at info
/// unless overridden.
pub fn init_logging() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("open_music_player=debug".parse()?)
                .add_directive("serenity=info".parse()?)
                .add_directive("songbird=info".parse()?),
        )
        .try_init()
        .map_err(|e| anyhow::anyhow!("no se pudo iniciar el logging: {e}"))?;

    Ok(())
}
