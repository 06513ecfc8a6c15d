//! # Voice
//!
//! Collaborators the player drives but does not implement: the voice
//! gateway (join/leave, status signals) and the audio sink that streams one
//! resource at a time. [`songbird`] provides the production implementation;
//! tests plug in mocks.
//!
//! Signals flow back to the player through mpsc senders handed over once,
//! when a connection or a sink is created.

pub mod songbird;

use anyhow::Result;
use async_trait::async_trait;
use serenity::model::{
    channel::{ChannelType, GuildChannel},
    guild::Member,
    id::{ChannelId, GuildId, UserId},
};
use std::sync::Arc;
use tokio::sync::mpsc;

#[cfg(test)]
use mockall::automock;

use crate::audio::resource::AudioResource;

/// Miembro conectado a un canal de voz
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelMember {
    pub id: UserId,
    pub bot: bool,
}

/// Snapshot of a guild channel as seen by the player.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceChannel {
    pub id: ChannelId,
    pub guild_id: GuildId,
    pub kind: ChannelType,
    pub bitrate: Option<u32>,
    pub members: Vec<ChannelMember>,
}

impl VoiceChannel {
    pub fn new(id: ChannelId, guild_id: GuildId, kind: ChannelType) -> Self {
        Self {
            id,
            guild_id,
            kind,
            bitrate: None,
            members: Vec::new(),
        }
    }

    /// Builds the snapshot from serenity's cached channel and its members.
    pub fn from_guild_channel(channel: &GuildChannel, members: &[Member]) -> Self {
        Self {
            id: channel.id,
            guild_id: channel.guild_id,
            kind: channel.kind,
            bitrate: channel.bitrate,
            members: members
                .iter()
                .map(|m| ChannelMember {
                    id: m.user.id,
                    bot: m.user.bot,
                })
                .collect(),
        }
    }

    pub fn with_bitrate(mut self, bitrate: u32) -> Self {
        self.bitrate = Some(bitrate);
        self
    }

    pub fn with_member(mut self, id: UserId, bot: bool) -> Self {
        self.members.push(ChannelMember { id, bot });
        self
    }

    /// Only voice and stage channels can be joined
    pub fn is_voice(&self) -> bool {
        matches!(self.kind, ChannelType::Voice | ChannelType::Stage)
    }

    pub fn human_members(&self) -> usize {
        self.members.iter().filter(|m| !m.bot).count()
    }
}

/// Parámetros para unirse a un canal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinRequest {
    pub guild_id: GuildId,
    pub channel_id: ChannelId,
    pub self_deaf: bool,
    pub self_mute: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Signalling,
    Connecting,
    Ready,
    Disconnected,
    Destroyed,
}

/// Status changes reported by a live connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionSignal {
    Ready,
    Disconnected { reason: Option<String> },
    Error(String),
}

/// What the sink does when no connection is subscribed to it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoSubscriberBehavior {
    Pause,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkOptions {
    pub no_subscriber: NoSubscriberBehavior,
}

/// Notifications emitted by a sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    /// The current resource finished (or was stopped)
    Idle,
    /// The current resource failed; no `Idle` follows for it
    Error(String),
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait VoiceGateway: Send + Sync {
    /// Joins a channel. `signals` receives the connection's status changes
    /// for as long as it lives.
    async fn connect(
        &self,
        request: JoinRequest,
        signals: mpsc::UnboundedSender<ConnectionSignal>,
    ) -> Result<Arc<dyn VoiceConnection>>;

    /// Conexión ya establecida para el guild, si existe
    fn existing(&self, guild_id: GuildId) -> Option<Arc<dyn VoiceConnection>>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait VoiceConnection: Send + Sync {
    /// Routes the sink's audio into this connection.
    fn subscribe(&self, sink: Arc<dyn AudioSink>) -> Result<Box<dyn Subscription>>;

    /// Resolves once the connection reaches `state`.
    async fn wait_for(&self, state: ConnectionState) -> Result<()>;

    async fn disconnect(&self) -> bool;

    async fn destroy(&self);
}

#[cfg(test)]
impl std::fmt::Debug for dyn VoiceConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("VoiceConnection")
    }
}

#[cfg_attr(test, automock)]
pub trait Subscription: Send + Sync {
    fn unsubscribe(&self);
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait AudioSink: Send + Sync {
    async fn play(&self, resource: AudioResource) -> Result<()>;

    fn pause(&self, interpolate_silence: bool) -> bool;

    fn unpause(&self) -> bool;

    fn stop(&self, force: bool) -> bool;
}

#[cfg_attr(test, automock)]
pub trait SinkFactory: Send + Sync {
    /// Creates a sink. `events` receives its idle/error notifications for
    /// the sink's whole lifetime.
    fn create_sink(
        &self,
        options: SinkOptions,
        events: mpsc::UnboundedSender<SinkEvent>,
    ) -> Arc<dyn AudioSink>;
}

/// Gateway and sink factory a player works against.
#[derive(Clone)]
pub struct VoiceBackend {
    pub gateway: Arc<dyn VoiceGateway>,
    pub sinks: Arc<dyn SinkFactory>,
}

impl VoiceBackend {
    pub fn new(gateway: Arc<dyn VoiceGateway>, sinks: Arc<dyn SinkFactory>) -> Self {
        Self { gateway, sinks }
    }
}
