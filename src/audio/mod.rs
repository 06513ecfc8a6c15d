//! # Audio Module
//!
//! Per-guild playback: tracks, the queue that orders them and the player
//! that streams them through a voice connection.
//!
//! ### [`track`] - Tracks
//! - Engine results wrapped with a stable identity
//! - Deferred streams resolved on demand
//!
//! ### [`queue`] - Queue Management
//! - Cursor plus history, skip/previous by any amount
//! - Shuffle, repeat-one and repeat-all rotations
//!
//! ### [`player`] - Player
//! - Voice connection lifecycle and reconnection race
//! - Volume, bitrate and repeat modes
//! - Automatic advance when a track ends
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use open_music_player::audio::player::SearchOptions;
//! use open_music_player::voice::VoiceChannel;
//! use open_music_player::MusicClient;
//! use serenity::all::GuildId;
//!
//! # async fn example(client: &MusicClient, channel: VoiceChannel) -> anyhow::Result<()> {
//! let player = client.create_player(GuildId::new(123456789), None)?;
//! let mut player = player.lock().await;
//!
//! player.connection(Some(&channel)).await?;
//! let tracks = player.search("lofi beats", SearchOptions::default()).await?;
//! player.play(tracks.into_tracks()).await?;
//!
//! player.set_volume(80.0)?;
//! player.set_repeat_mode("all")?;
//! # Ok(())
//! # }
//! ```

pub mod events;
pub mod player;
pub mod queue;
pub mod resource;
pub mod track;
