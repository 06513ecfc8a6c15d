use dashmap::DashMap;
use serenity::model::id::GuildId;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    audio::player::{drive, Player, PlayerHandle},
    config::{ClientSettings, PlayerOptions},
    error::Result,
    sources::EngineCatalog,
    voice::VoiceBackend,
};

/// Registro de players por guild.
///
/// Each player gets a driver task that feeds it sink and connection events;
/// the task ends when the player is destroyed.
pub struct MusicClient {
    settings: ClientSettings,
    engines: Arc<EngineCatalog>,
    voice: VoiceBackend,
    players: DashMap<GuildId, PlayerHandle>,
}

impl MusicClient {
    pub fn new(settings: ClientSettings, engines: EngineCatalog, voice: VoiceBackend) -> Self {
        info!(
            "🎶 Cliente de música listo con motores: {:?}",
            engines.platforms()
        );
        Self {
            settings,
            engines: Arc::new(engines),
            voice,
            players: DashMap::new(),
        }
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    /// Returns the guild's player, creating it with the client defaults
    /// (or `options`) when there is none.
    ///
    /// Must be called inside a tokio runtime.
    pub fn create_player(
        &self,
        guild_id: GuildId,
        options: Option<PlayerOptions>,
    ) -> Result<PlayerHandle> {
        if let Some(existing) = self.players.get(&guild_id) {
            return Ok(existing.clone());
        }

        let options = options.unwrap_or_else(|| self.settings.player.clone());
        let (player, inbox) = Player::new(guild_id, options, self.engines.clone(), self.voice.clone())?;
        let handle = Arc::new(Mutex::new(player));

        let handle = self
            .players
            .entry(guild_id)
            .or_insert_with(|| {
                tokio::spawn(drive(handle.clone(), inbox));
                info!("🆕 Player creado para guild {}", guild_id);
                handle
            })
            .clone();
        Ok(handle)
    }

    pub fn get(&self, guild_id: GuildId) -> Option<PlayerHandle> {
        self.players.get(&guild_id).map(|p| p.clone())
    }

    /// Destroys and forgets the guild's player. Returns `false` if there was none.
    pub async fn remove(&self, guild_id: GuildId, disconnect: bool) -> bool {
        let Some((_, player)) = self.players.remove(&guild_id) else {
            debug!("No hay player para guild {}", guild_id);
            return false;
        };

        let mut player = player.lock().await;
        if let Err(e) = player.destroy(disconnect).await {
            if !e.is_destroyed() {
                warn!("Error al destruir el player de guild {}: {}", guild_id, e);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    pub fn guilds(&self) -> Vec<GuildId> {
        self.players.iter().map(|entry| *entry.key()).collect()
    }
}
