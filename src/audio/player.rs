use serenity::model::id::GuildId;
use std::{fmt, str::FromStr, sync::Arc, time::Duration};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::{
    audio::{
        events::{PlayerEvent, EVENT_CAPACITY},
        queue::MusicQueue,
        track::Track,
    },
    config::PlayerOptions,
    error::{PlayerError, Result},
    sources::{EngineCatalog, MusicSource, SearchResults},
    voice::{
        AudioSink, ConnectionSignal, ConnectionState, JoinRequest, NoSubscriberBehavior,
        SinkEvent, SinkOptions, Subscription, VoiceBackend, VoiceChannel, VoiceConnection,
    },
};

/// Shared handle to a player, as stored in the registry
pub type PlayerHandle = Arc<Mutex<Player>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RepeatMode {
    #[default]
    None,
    One,
    All,
}

impl RepeatMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepeatMode::None => "none",
            RepeatMode::One => "one",
            RepeatMode::All => "all",
        }
    }
}

impl FromStr for RepeatMode {
    type Err = PlayerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(RepeatMode::None),
            "one" => Ok(RepeatMode::One),
            "all" => Ok(RepeatMode::All),
            other => Err(PlayerError::invalid_input(format!(
                "modo de repetición desconocido: {other}"
            ))),
        }
    }
}

impl fmt::Display for RepeatMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bitrate {
    /// Channel bitrate, or the configured default
    Auto,
    Fixed(i32),
}

/// Opciones de búsqueda
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchOptions {
    /// Engine to use instead of the player's active one
    pub engine: Option<String>,
    pub single: bool,
    pub limit: Option<usize>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            engine: None,
            single: true,
            limit: None,
        }
    }
}

#[derive(Debug)]
pub enum SearchHit {
    One(Track),
    Many(Vec<Track>),
}

impl SearchHit {
    pub fn into_tracks(self) -> Vec<Track> {
        match self {
            SearchHit::One(track) => vec![track],
            SearchHit::Many(tracks) => tracks,
        }
    }
}

/// Receiving ends of the channels a player hands to its sink and connection.
/// Consumed by [`drive`].
pub struct PlayerInbox {
    sink_events: mpsc::UnboundedReceiver<SinkEvent>,
    signals: mpsc::UnboundedReceiver<ConnectionSignal>,
    closed: watch::Receiver<bool>,
}

/// Music session for one guild: a queue, a voice connection and a sink.
pub struct Player {
    guild_id: GuildId,
    settings: PlayerOptions,
    queue: MusicQueue,
    engines: Arc<EngineCatalog>,
    engine: Arc<dyn MusicSource>,
    repeat: RepeatMode,
    voice: VoiceBackend,
    connection: Option<Arc<dyn VoiceConnection>>,
    channel: Option<VoiceChannel>,
    sink: Option<Arc<dyn AudioSink>>,
    subscription: Option<Box<dyn Subscription>>,
    playing: bool,
    connected: bool,
    finished: bool,
    destroyed: bool,
    volume: Option<f64>,
    bitrate: Option<i32>,
    events: broadcast::Sender<PlayerEvent>,
    sink_tx: mpsc::UnboundedSender<SinkEvent>,
    signal_tx: mpsc::UnboundedSender<ConnectionSignal>,
    shutdown: watch::Sender<bool>,
}

impl Player {
    pub fn new(
        guild_id: GuildId,
        settings: PlayerOptions,
        engines: Arc<EngineCatalog>,
        voice: VoiceBackend,
    ) -> Result<(Self, PlayerInbox)> {
        let (_, engine) = engines.resolve(settings.engine.as_str())?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (sink_tx, sink_events) = mpsc::unbounded_channel();
        let (signal_tx, signals) = mpsc::unbounded_channel();
        let (shutdown, closed) = watch::channel(false);

        let player = Self {
            guild_id,
            volume: settings.default_volume,
            settings,
            queue: MusicQueue::new(),
            engines,
            engine,
            repeat: RepeatMode::None,
            voice,
            connection: None,
            channel: None,
            sink: None,
            subscription: None,
            playing: false,
            connected: false,
            finished: false,
            destroyed: false,
            bitrate: None,
            events,
            sink_tx,
            signal_tx,
            shutdown,
        };

        let inbox = PlayerInbox {
            sink_events,
            signals,
            closed,
        };
        Ok((player, inbox))
    }

    fn guard(&self) -> Result<()> {
        if self.destroyed {
            warn!("⚠️ Operación sobre el player destruido del guild {}", self.guild_id);
            return Err(PlayerError::player_destroyed());
        }
        Ok(())
    }

    fn emit(&self, event: PlayerEvent) {
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.events.subscribe()
    }

    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    pub fn settings(&self) -> &PlayerOptions {
        &self.settings
    }

    pub fn queue(&self) -> &MusicQueue {
        &self.queue
    }

    pub fn queue_mut(&mut self) -> &mut MusicQueue {
        &mut self.queue
    }

    pub fn repeat_mode(&self) -> RepeatMode {
        self.repeat
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn channel(&self) -> Option<&VoiceChannel> {
        self.channel.as_ref()
    }

    /// Tears the session down: subscription, sink, connection and queue.
    pub async fn destroy(&mut self, disconnect: bool) -> Result<()> {
        self.guard()?;
        self.destroyed = true;
        self.playing = false;
        self.connected = false;
        self.shutdown.send_replace(true);

        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
        if let Some(sink) = self.sink.take() {
            sink.stop(true);
        }
        if let Some(connection) = self.connection.take() {
            if disconnect {
                connection.disconnect().await;
            }
            connection.destroy().await;
        }
        if !self.queue.is_destroyed() {
            self.queue.destroy()?;
        }

        info!("💥 Player destruido en guild {}", self.guild_id);
        Ok(())
    }

    /// Cambia el motor de búsqueda activo
    pub fn set_engine(&mut self, name: &str) -> Result<&mut Self> {
        self.guard()?;
        let (platform, engine) = self.engines.resolve(name)?;
        self.settings.engine = platform;
        self.engine = engine;
        info!("🔎 Motor cambiado a {} en guild {}", platform, self.guild_id);
        Ok(self)
    }

    /// Applies an encoder bitrate to every track; returns the value used.
    pub fn set_bitrate(&mut self, bitrate: Bitrate) -> Result<i32> {
        self.guard()?;
        let value = match bitrate {
            Bitrate::Fixed(value) => value,
            Bitrate::Auto => self
                .channel
                .as_ref()
                .and_then(|c| c.bitrate)
                .and_then(|b| i32::try_from(b).ok())
                .unwrap_or(self.settings.default_bitrate),
        };

        self.queue.set_bitrates(value)?;
        self.bitrate = Some(value);
        debug!("🎚️ Bitrate ajustado a {}kbps", value / 1000);
        Ok(value)
    }

    /// Sets the volume in percent on the logarithmic curve.
    ///
    /// Returns `false` for NaN, negative or infinite values.
    pub fn set_volume(&mut self, percent: f64) -> Result<bool> {
        self.guard()?;
        if !percent.is_finite() || percent < 0.0 {
            return Ok(false);
        }

        self.queue.set_volumes(percent)?;
        self.volume = Some(percent);
        info!("🔊 Volumen ajustado a {}%", percent);
        Ok(true)
    }

    pub fn set_repeat_mode(&mut self, mode: &str) -> Result<bool> {
        self.guard()?;
        match mode.parse::<RepeatMode>() {
            Ok(mode) => {
                self.repeat = mode;
                info!("🔁 Modo de repetición: {}", mode);
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    /// True when the given channel (or the joined one) has no human listeners.
    pub fn is_channel_empty(&self, channel: Option<&VoiceChannel>) -> Result<bool> {
        self.guard()?;
        let channel = channel.or(self.channel.as_ref()).ok_or_else(|| {
            PlayerError::not_found("no hay conexión de voz establecida con ningún canal todavía")
        })?;
        Ok(channel.human_members() == 0)
    }

    /// Busca tracks con el motor activo (o el indicado en las opciones)
    pub async fn search(&self, query: &str, options: SearchOptions) -> Result<SearchHit> {
        self.guard()?;
        let engine = options
            .engine
            .as_deref()
            .and_then(|name| self.engines.resolve(name).ok())
            .map(|(_, engine)| engine)
            .unwrap_or_else(|| self.engine.clone());

        debug!("🔍 Buscando '{}' en {}", query, engine.platform());
        let results = engine
            .search(query)
            .await
            .map_err(|e| PlayerError::search(query, e))?;

        match results {
            SearchResults::Single(result) => Ok(SearchHit::One(Track::from_result(result)?)),
            SearchResults::Many(mut results) => {
                let first_known = results.first().and_then(|r| r.platform()).is_some();
                if options.single && first_known {
                    let first = results.swap_remove(0);
                    return Ok(SearchHit::One(Track::from_result(first)?));
                }
                if let Some(limit) = options.limit {
                    results.truncate(limit);
                }
                let tracks = results
                    .into_iter()
                    .map(Track::from_result)
                    .collect::<Result<Vec<_>>>()?;
                Ok(SearchHit::Many(tracks))
            }
        }
    }

    /// Returns the voice connection, joining `channel` if there is none yet.
    pub async fn connection(
        &mut self,
        channel: Option<&VoiceChannel>,
    ) -> Result<Arc<dyn VoiceConnection>> {
        self.guard()?;
        if let Some(connection) = &self.connection {
            return Ok(connection.clone());
        }

        if let Some(existing) = self.voice.gateway.existing(self.guild_id) {
            debug!("♻️ Reutilizando conexión existente en guild {}", self.guild_id);
            self.connection = Some(existing.clone());
            self.channel = channel.filter(|c| c.is_voice()).cloned();
            self.connected = true;
            return Ok(existing);
        }

        let channel = match channel {
            Some(channel) if channel.is_voice() => channel,
            Some(_) => {
                return Err(PlayerError::invalid_input(
                    "el canal no es un canal de voz ni un escenario",
                ))
            }
            None => {
                return Err(PlayerError::not_found(
                    "no hay conexión de voz establecida ni se recibió un canal válido",
                ))
            }
        };

        info!("🔗 Conectando al canal {} en guild {}", channel.id, self.guild_id);
        let request = JoinRequest {
            guild_id: self.guild_id,
            channel_id: channel.id,
            self_deaf: self.settings.self_deaf,
            self_mute: self.settings.self_mute,
        };
        let connection = self
            .voice
            .gateway
            .connect(request, self.signal_tx.clone())
            .await
            .map_err(PlayerError::transport)?;

        self.connection = Some(connection.clone());
        self.channel = Some(channel.clone());
        self.connected = true;
        info!("✅ Conectado al canal {} en guild {}", channel.id, self.guild_id);
        Ok(connection)
    }

    pub fn pause(&self, interpolate_silence: bool) -> Result<bool> {
        self.guard()?;
        let sink = self.require_sink()?;
        let paused = sink.pause(interpolate_silence);
        if paused {
            info!("⏸️ Reproducción pausada");
        }
        Ok(paused)
    }

    pub fn resume(&self) -> Result<bool> {
        self.guard()?;
        let sink = self.require_sink()?;
        let resumed = sink.unpause();
        if resumed {
            info!("▶️ Reproducción reanudada");
        }
        Ok(resumed)
    }

    /// Stops the current resource. The sink reports idle afterwards, so the
    /// queue moves on unless it is empty.
    pub fn stop(&mut self, unsubscribe: bool, force: bool) -> Result<bool> {
        self.guard()?;
        let sink = self.require_sink()?;
        if self.subscription.is_none() {
            return Err(PlayerError::not_found(
                "no hay conexión de voz, sink o suscripción establecidos todavía",
            ));
        }

        if unsubscribe {
            if let Some(subscription) = self.subscription.take() {
                subscription.unsubscribe();
            }
        }

        info!("⏹️ Reproducción detenida");
        Ok(sink.stop(force))
    }

    fn require_sink(&self) -> Result<Arc<dyn AudioSink>> {
        match (&self.connection, &self.sink) {
            (Some(_), Some(sink)) => Ok(sink.clone()),
            _ => Err(PlayerError::not_found(
                "no hay conexión de voz ni sink establecidos todavía",
            )),
        }
    }

    /// Enqueues tracks and starts playback if nothing is playing.
    pub async fn play(&mut self, mut tracks: Vec<Track>) -> Result<()> {
        self.guard()?;
        let connection = match &self.connection {
            Some(connection) if self.connected => connection.clone(),
            _ => {
                return Err(PlayerError::not_found(
                    "no hay conexión de voz establecida todavía",
                ))
            }
        };

        let sink = match &self.sink {
            Some(sink) => sink.clone(),
            None => {
                let no_subscriber = if self.settings.leave_on_end {
                    NoSubscriberBehavior::Stop
                } else {
                    NoSubscriberBehavior::Pause
                };
                let sink = self
                    .voice
                    .sinks
                    .create_sink(SinkOptions { no_subscriber }, self.sink_tx.clone());
                self.sink = Some(sink.clone());
                sink
            }
        };

        if self.queue.is_initialized() {
            for track in tracks.iter_mut() {
                track.init().await?;
            }
        }

        let resume_after_end = self.finished && !tracks.is_empty();
        self.queue.add_tracks(tracks)?;

        if !self.queue.is_initialized() {
            self.queue.init().await?;
        }
        self.apply_controls()?;

        if self.playing {
            return Ok(());
        }

        if resume_after_end {
            self.queue.next()?;
        }
        self.finished = false;

        if self.subscription.is_none() {
            let subscription = connection
                .subscribe(sink.clone())
                .map_err(PlayerError::transport)?;
            self.subscription = Some(subscription);
        }

        self.start_current(&sink).await
    }

    fn apply_controls(&mut self) -> Result<()> {
        if let Some(volume) = self.volume {
            self.queue.set_volumes(volume)?;
        }
        if let Some(bitrate) = self.bitrate {
            self.queue.set_bitrates(bitrate)?;
        }
        Ok(())
    }

    async fn start_current(&mut self, sink: &Arc<dyn AudioSink>) -> Result<()> {
        let track = self
            .queue
            .current_mut()
            .ok_or_else(|| PlayerError::not_found("la cola está vacía"))?;
        let resource = track.create_resource(true)?;
        let info = track.info();

        sink.play(resource).await.map_err(PlayerError::transport)?;
        self.playing = true;
        info!("🎵 Reproduciendo: {}", info.title);
        self.emit(PlayerEvent::Track(info));
        Ok(())
    }

    /// Reacts to a sink notification. Both an idle sink and a failed
    /// resource move the queue on (or end it).
    pub async fn handle_sink_event(&mut self, event: SinkEvent) -> Result<()> {
        self.guard()?;
        match event {
            SinkEvent::Error(message) => {
                error!("❌ Error en el sink del guild {}: {}", self.guild_id, message);
                self.emit(PlayerEvent::Error { message });
                // A failed resource is finished as far as the queue is concerned
                self.advance().await
            }
            SinkEvent::Idle => self.advance().await,
        }
    }

    async fn advance(&mut self) -> Result<()> {
        if !self.playing {
            debug!("Sink inactivo sin reproducción en curso, ignorado");
            return Ok(());
        }

        match self.repeat {
            RepeatMode::All => self.queue.repeat()?,
            RepeatMode::One => self.queue.repeat_one()?,
            RepeatMode::None => {}
        }

        if self.queue.next_tracks().is_empty() {
            self.playing = false;
            self.finished = true;
            let last = self.queue.current().map(Track::info);
            info!("📭 Cola terminada en guild {}", self.guild_id);
            self.emit(PlayerEvent::End(last));

            if self.settings.leave_on_end {
                self.leave().await;
            }
            return Ok(());
        }

        self.queue.next()?;
        let sink = self
            .sink
            .clone()
            .ok_or_else(|| PlayerError::not_found("no hay sink establecido"))?;
        if let Err(e) = self.start_current(&sink).await {
            self.playing = false;
            self.emit(PlayerEvent::Error {
                message: e.to_string(),
            });
            return Err(e);
        }
        Ok(())
    }

    async fn leave(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
        self.sink = None;
        self.connected = false;
        self.channel = None;

        if let Some(connection) = self.connection.take() {
            connection.disconnect().await;
            connection.destroy().await;
        }
        info!("👋 Saliendo del canal de voz en guild {}", self.guild_id);
    }

    /// Handles a transport signal. For a disconnection it returns the
    /// connection to watch and how long to wait for it to recover.
    pub fn handle_connection_signal(
        &mut self,
        signal: ConnectionSignal,
    ) -> Option<(Arc<dyn VoiceConnection>, Duration)> {
        if self.destroyed {
            return None;
        }

        match signal {
            ConnectionSignal::Ready => {
                self.connected = true;
                self.emit(PlayerEvent::Connect);
                None
            }
            ConnectionSignal::Error(message) => {
                error!("❌ Error en la conexión de voz del guild {}: {}", self.guild_id, message);
                self.emit(PlayerEvent::Error { message });
                None
            }
            ConnectionSignal::Disconnected { reason } => {
                warn!(
                    "🔌 Conexión de voz interrumpida en guild {} ({})",
                    self.guild_id,
                    reason.as_deref().unwrap_or("sin motivo")
                );
                self.connection
                    .clone()
                    .map(|connection| (connection, self.settings.reconnect_timeout))
            }
        }
    }

    /// Marks the connection as lost for good, unless it was replaced meanwhile.
    pub fn mark_disconnected(&mut self, connection: &Arc<dyn VoiceConnection>, reason: String) {
        let current = matches!(&self.connection, Some(c) if Arc::ptr_eq(c, connection));
        if self.destroyed || !current {
            return;
        }
        self.connected = false;
        warn!("🔌 Desconectado de voz en guild {}: {}", self.guild_id, reason);
        self.emit(PlayerEvent::Disconnect { reason });
    }
}

impl fmt::Debug for Player {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Player")
            .field("guild_id", &self.guild_id)
            .field("engine", &self.settings.engine)
            .field("repeat", &self.repeat)
            .field("queue", &self.queue.len())
            .field("playing", &self.playing)
            .field("connected", &self.connected)
            .field("destroyed", &self.destroyed)
            .finish()
    }
}

/// Races "about to resignal" against "about to reconnect", each bounded by
/// `limit`. Returns `false` when neither happens in time.
pub async fn awaits_recovery(connection: &dyn VoiceConnection, limit: Duration) -> bool {
    let signalling = tokio::time::timeout(limit, connection.wait_for(ConnectionState::Signalling));
    let connecting = tokio::time::timeout(limit, connection.wait_for(ConnectionState::Connecting));

    let outcome = tokio::select! {
        r = signalling => r,
        r = connecting => r,
    };
    matches!(outcome, Ok(Ok(())))
}

/// Feeds sink events and transport signals to the player, in order, until
/// the player is destroyed.
pub async fn drive(player: PlayerHandle, mut inbox: PlayerInbox) {
    let guild_id = player.lock().await.guild_id();
    debug!("🚦 Driver iniciado para guild {}", guild_id);

    loop {
        tokio::select! {
            Some(event) = inbox.sink_events.recv() => {
                let mut guard = player.lock().await;
                if let Err(e) = guard.handle_sink_event(event).await {
                    if !e.is_destroyed() {
                        error!("Error al reproducir siguiente track: {}", e);
                    }
                }
            }
            Some(signal) = inbox.signals.recv() => {
                let recovery = player.lock().await.handle_connection_signal(signal);
                if let Some((connection, limit)) = recovery {
                    let player = player.clone();
                    tokio::spawn(async move {
                        if !awaits_recovery(connection.as_ref(), limit).await {
                            player
                                .lock()
                                .await
                                .mark_disconnected(&connection, "la conexión no se recuperó".to_string());
                        }
                    });
                }
            }
            Ok(()) = inbox.closed.changed() => break,
            else => break,
        }
    }

    debug!("🛑 Driver finalizado para guild {}", guild_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        sources::{AudioStream, Platform, StreamSource, TrackResult},
        voice::{
            AudioSink, MockSinkFactory, MockSubscription, MockVoiceConnection, MockVoiceGateway,
        },
    };
    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;
    use pretty_assertions::assert_eq;
    use serenity::model::{
        channel::ChannelType,
        id::{ChannelId, UserId},
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    const GUILD: u64 = 42;

    #[derive(Default)]
    struct RecordingSink {
        played: SyncMutex<Vec<String>>,
        stops: AtomicUsize,
    }

    #[async_trait]
    impl AudioSink for RecordingSink {
        async fn play(&self, resource: crate::audio::resource::AudioResource) -> anyhow::Result<()> {
            self.played.lock().push(resource.metadata().title.clone());
            Ok(())
        }

        fn pause(&self, _interpolate_silence: bool) -> bool {
            true
        }

        fn unpause(&self) -> bool {
            true
        }

        fn stop(&self, _force: bool) -> bool {
            self.stops.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    struct StaticEngine {
        platform: Platform,
        results: SearchResults,
    }

    #[async_trait]
    impl MusicSource for StaticEngine {
        async fn search(&self, _query: &str) -> anyhow::Result<SearchResults> {
            Ok(self.results.clone())
        }

        fn platform(&self) -> Platform {
            self.platform
        }
    }

    fn result(title: &str) -> TrackResult {
        TrackResult::new(
            "YouTube",
            title,
            format!("https://youtube.com/watch?v={title}"),
            StreamSource::Ready(AudioStream::YtDlp(format!("https://youtube.com/watch?v={title}"))),
        )
    }

    fn track(title: &str) -> Track {
        Track::from_result(result(title)).unwrap()
    }

    fn engines(results: SearchResults) -> Arc<EngineCatalog> {
        Arc::new(
            EngineCatalog::new()
                .with(Arc::new(StaticEngine {
                    platform: Platform::YouTube,
                    results: results.clone(),
                }))
                .with(Arc::new(StaticEngine {
                    platform: Platform::SoundCloud,
                    results,
                })),
        )
    }

    fn voice_channel() -> VoiceChannel {
        VoiceChannel::new(ChannelId::new(7), GuildId::new(GUILD), ChannelType::Voice)
            .with_bitrate(96_000)
            .with_member(UserId::new(1), true)
    }

    fn connection(disconnects: usize) -> MockVoiceConnection {
        let mut connection = MockVoiceConnection::new();
        connection.expect_subscribe().returning(|_| {
            let mut subscription = MockSubscription::new();
            subscription.expect_unsubscribe().return_const(());
            Ok(Box::new(subscription) as Box<dyn Subscription>)
        });
        connection
            .expect_disconnect()
            .times(disconnects)
            .returning(|| true);
        connection.expect_destroy().times(disconnects).return_const(());
        connection
    }

    struct Session {
        player: Player,
        _inbox: PlayerInbox,
        sink: Arc<RecordingSink>,
        sink_options: Arc<SyncMutex<Vec<SinkOptions>>>,
    }

    fn session(options: PlayerOptions, connection: MockVoiceConnection) -> Session {
        let connection: Arc<dyn VoiceConnection> = Arc::new(connection);

        let mut gateway = MockVoiceGateway::new();
        gateway.expect_existing().returning(|_| None);
        gateway
            .expect_connect()
            .withf(|request, _| request.self_deaf && !request.self_mute && request.channel_id == ChannelId::new(7))
            .times(0..=1)
            .returning(move |_, _| Ok(connection.clone()));

        let sink = Arc::new(RecordingSink::default());
        let sink_options = Arc::new(SyncMutex::new(Vec::new()));
        let mut sinks = MockSinkFactory::new();
        let created = sink.clone();
        let seen = sink_options.clone();
        sinks.expect_create_sink().returning(move |options, _| {
            seen.lock().push(options);
            created.clone() as Arc<dyn AudioSink>
        });

        let backend = VoiceBackend::new(Arc::new(gateway), Arc::new(sinks));
        let (player, inbox) = Player::new(
            GuildId::new(GUILD),
            options,
            engines(SearchResults::Many(vec![result("A"), result("B"), result("C")])),
            backend,
        )
        .unwrap();

        Session {
            player,
            _inbox: inbox,
            sink,
            sink_options,
        }
    }

    async fn connected(options: PlayerOptions, connection: MockVoiceConnection) -> Session {
        let mut s = session(options, connection);
        s.player.connection(Some(&voice_channel())).await.unwrap();
        s
    }

    fn drain(rx: &mut broadcast::Receiver<PlayerEvent>) -> Vec<PlayerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn titles(events: &[PlayerEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                PlayerEvent::Track(info) => Some(info.title.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn connection_is_idempotent() {
        let mut s = session(PlayerOptions::default(), connection(0));
        let first = s.player.connection(Some(&voice_channel())).await.unwrap();
        let second = s.player.connection(None).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(s.player.is_connected());
        assert_eq!(s.player.channel().map(|c| c.id), Some(ChannelId::new(7)));
    }

    #[tokio::test]
    async fn connection_validates_its_input() {
        let mut s = session(PlayerOptions::default(), connection(0));
        let text = VoiceChannel::new(ChannelId::new(8), GuildId::new(GUILD), ChannelType::Text);

        assert_eq!(s.player.connection(Some(&text)).await.unwrap_err().code(), 400);
        assert_eq!(s.player.connection(None).await.unwrap_err().code(), 404);
        assert!(!s.player.is_connected());
    }

    #[tokio::test]
    async fn connection_reuses_existing_transport() {
        let existing: Arc<dyn VoiceConnection> = Arc::new(connection(0));
        let found = existing.clone();
        let mut gateway = MockVoiceGateway::new();
        gateway
            .expect_existing()
            .returning(move |_| Some(found.clone()));
        gateway.expect_connect().never();

        let backend = VoiceBackend::new(Arc::new(gateway), Arc::new(MockSinkFactory::new()));
        let (mut player, _inbox) = Player::new(
            GuildId::new(GUILD),
            PlayerOptions::default(),
            engines(SearchResults::Many(Vec::new())),
            backend,
        )
        .unwrap();

        let connection = player.connection(None).await.unwrap();
        assert!(Arc::ptr_eq(&connection, &existing));
        assert!(player.is_connected());
    }

    #[tokio::test]
    async fn play_requires_a_connection() {
        let mut s = session(PlayerOptions::default(), connection(0));
        let err = s.player.play(vec![track("A")]).await.unwrap_err();
        assert_eq!(err.code(), 404);
        assert!(s.player.queue().is_empty());
    }

    #[tokio::test]
    async fn first_play_starts_streaming() {
        let mut s = connected(PlayerOptions::default(), connection(0)).await;
        let mut rx = s.player.subscribe();

        s.player.play(vec![track("A"), track("B")]).await.unwrap();

        assert!(s.player.is_playing());
        assert!(s.player.queue().is_initialized());
        assert_eq!(*s.sink.played.lock(), vec!["A"]);
        assert_eq!(titles(&drain(&mut rx)), vec!["A"]);
        assert_eq!(
            *s.sink_options.lock(),
            vec![SinkOptions {
                no_subscriber: NoSubscriberBehavior::Stop
            }]
        );
    }

    #[tokio::test]
    async fn later_plays_only_enqueue() {
        let options = PlayerOptions {
            leave_on_end: false,
            ..PlayerOptions::default()
        };
        let mut s = connected(options, connection(0)).await;

        s.player.play(vec![track("A")]).await.unwrap();
        s.player.play(vec![track("B")]).await.unwrap();

        assert_eq!(*s.sink.played.lock(), vec!["A"]);
        assert_eq!(s.player.queue().len(), 2);
        assert!(s.player.queue().next_tracks()[0].is_ready());
        assert_eq!(
            *s.sink_options.lock(),
            vec![SinkOptions {
                no_subscriber: NoSubscriberBehavior::Pause
            }]
        );
    }

    #[tokio::test]
    async fn idle_advances_to_next_track() {
        let mut s = connected(PlayerOptions::default(), connection(0)).await;
        let mut rx = s.player.subscribe();
        s.player.play(vec![track("A"), track("B"), track("C")]).await.unwrap();

        s.player.handle_sink_event(SinkEvent::Idle).await.unwrap();
        s.player.handle_sink_event(SinkEvent::Idle).await.unwrap();

        assert_eq!(*s.sink.played.lock(), vec!["A", "B", "C"]);
        assert_eq!(titles(&drain(&mut rx)), vec!["A", "B", "C"]);
        assert_eq!(s.player.queue().current().map(Track::title), Some("C"));
    }

    #[tokio::test]
    async fn sink_error_moves_on_to_the_next_track() {
        let mut s = connected(PlayerOptions::default(), connection(0)).await;
        let mut rx = s.player.subscribe();
        s.player.play(vec![track("A"), track("B")]).await.unwrap();

        s.player
            .handle_sink_event(SinkEvent::Error("boom".into()))
            .await
            .unwrap();

        assert_eq!(*s.sink.played.lock(), vec!["A", "B"]);
        assert!(s.player.is_playing());
        let events = drain(&mut rx);
        assert_eq!(titles(&events), vec!["A", "B"]);
        assert!(events.contains(&PlayerEvent::Error {
            message: "boom".into()
        }));

        // Later plays are not swallowed by a stale playing flag
        s.player.play(vec![track("C")]).await.unwrap();
        s.player.handle_sink_event(SinkEvent::Idle).await.unwrap();
        assert_eq!(*s.sink.played.lock(), vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn sink_error_on_the_last_track_ends_the_queue() {
        let mut s = connected(PlayerOptions::default(), connection(1)).await;
        let mut rx = s.player.subscribe();
        s.player.play(vec![track("A")]).await.unwrap();

        s.player
            .handle_sink_event(SinkEvent::Error("boom".into()))
            .await
            .unwrap();

        assert!(!s.player.is_playing());
        assert!(!s.player.is_connected());
        assert!(matches!(drain(&mut rx).last(), Some(PlayerEvent::End(Some(info))) if info.title == "A"));
    }

    #[tokio::test]
    async fn stop_then_idle_advances() {
        let mut s = connected(PlayerOptions::default(), connection(0)).await;
        s.player.play(vec![track("A"), track("B")]).await.unwrap();

        assert!(s.player.stop(false, true).unwrap());
        s.player.handle_sink_event(SinkEvent::Idle).await.unwrap();

        assert_eq!(*s.sink.played.lock(), vec!["A", "B"]);
        assert_eq!(s.player.queue().current().map(Track::title), Some("B"));
        assert!(s.player.is_playing());
    }

    #[tokio::test]
    async fn leave_on_end_disconnects_exactly_once() {
        let mut s = connected(PlayerOptions::default(), connection(1)).await;
        let mut rx = s.player.subscribe();
        s.player.play(vec![track("A")]).await.unwrap();

        s.player.handle_sink_event(SinkEvent::Idle).await.unwrap();
        // A late idle after teardown is ignored
        s.player.handle_sink_event(SinkEvent::Idle).await.unwrap();

        let events = drain(&mut rx);
        assert!(matches!(events.last(), Some(PlayerEvent::End(Some(info))) if info.title == "A"));
        assert!(!s.player.is_playing());
        assert!(!s.player.is_connected());
        assert_eq!(s.player.pause(true).unwrap_err().code(), 404);
    }

    #[tokio::test]
    async fn staying_after_end_resumes_with_new_tracks() {
        let options = PlayerOptions {
            leave_on_end: false,
            ..PlayerOptions::default()
        };
        let mut s = connected(options, connection(0)).await;
        s.player.play(vec![track("A")]).await.unwrap();
        s.player.handle_sink_event(SinkEvent::Idle).await.unwrap();
        assert!(!s.player.is_playing());

        s.player.play(vec![track("B")]).await.unwrap();
        assert_eq!(*s.sink.played.lock(), vec!["A", "B"]);
        assert_eq!(s.player.queue().current().map(Track::title), Some("B"));
    }

    #[tokio::test]
    async fn repeat_one_replays_the_current_track() {
        let mut s = connected(PlayerOptions::default(), connection(0)).await;
        assert!(s.player.set_repeat_mode("one").unwrap());
        s.player.play(vec![track("A"), track("B")]).await.unwrap();

        s.player.handle_sink_event(SinkEvent::Idle).await.unwrap();
        s.player.handle_sink_event(SinkEvent::Idle).await.unwrap();

        assert_eq!(*s.sink.played.lock(), vec!["A", "A", "A"]);
    }

    #[tokio::test]
    async fn repeat_all_cycles_the_queue() {
        let mut s = connected(PlayerOptions::default(), connection(0)).await;
        s.player.set_repeat_mode("all").unwrap();
        s.player.play(vec![track("A"), track("B")]).await.unwrap();

        for _ in 0..3 {
            s.player.handle_sink_event(SinkEvent::Idle).await.unwrap();
        }

        assert_eq!(*s.sink.played.lock(), vec!["A", "B", "A", "B"]);
        assert!(s.player.is_playing());
    }

    #[tokio::test]
    async fn repeat_mode_rejects_unknown_values() {
        let mut s = session(PlayerOptions::default(), connection(0));
        assert!(!s.player.set_repeat_mode("forever").unwrap());
        assert_eq!(s.player.repeat_mode(), RepeatMode::None);
        assert!(s.player.set_repeat_mode("all").unwrap());
        assert_eq!(s.player.repeat_mode(), RepeatMode::All);
    }

    #[tokio::test]
    async fn volume_follows_the_logarithmic_percent() {
        let mut s = connected(PlayerOptions::default(), connection(0)).await;
        s.player.play(vec![track("A"), track("B")]).await.unwrap();

        assert!(s.player.set_volume(150.0).unwrap());
        let volume = |p: &Player| p.queue().current().unwrap().resource().unwrap().volume();
        assert_eq!(volume(&s.player), 1.5);

        assert!(!s.player.set_volume(-1.0).unwrap());
        assert!(!s.player.set_volume(f64::NAN).unwrap());
        assert!(!s.player.set_volume(f64::INFINITY).unwrap());
        assert_eq!(volume(&s.player), 1.5);

        s.player.play(vec![track("C")]).await.unwrap();
        let last = s.player.queue().next_tracks()[1].resource().unwrap().volume();
        assert_eq!(last, 1.5);
    }

    #[tokio::test]
    async fn auto_bitrate_uses_the_channel() {
        let mut s = connected(PlayerOptions::default(), connection(0)).await;
        s.player.play(vec![track("A")]).await.unwrap();

        assert_eq!(s.player.set_bitrate(Bitrate::Auto).unwrap(), 96_000);
        assert_eq!(s.player.set_bitrate(Bitrate::Fixed(128_000)).unwrap(), 128_000);
        let resource = s.player.queue().current().unwrap().resource().unwrap().clone();
        assert_eq!(resource.bitrate(), Some(128_000));
    }

    #[tokio::test]
    async fn auto_bitrate_falls_back_without_channel() {
        let mut s = session(PlayerOptions::default(), connection(0));
        assert_eq!(s.player.set_bitrate(Bitrate::Auto).unwrap(), 64_000);
    }

    #[tokio::test]
    async fn controls_require_a_sink() {
        let mut s = connected(PlayerOptions::default(), connection(0)).await;
        assert_eq!(s.player.pause(true).unwrap_err().code(), 404);
        assert_eq!(s.player.resume().unwrap_err().code(), 404);
        assert_eq!(s.player.stop(false, true).unwrap_err().code(), 404);

        s.player.play(vec![track("A")]).await.unwrap();
        assert!(s.player.pause(true).unwrap());
        assert!(s.player.resume().unwrap());
        assert!(s.player.stop(true, true).unwrap());
        assert_eq!(s.sink.stops.load(Ordering::SeqCst), 1);
        // Without subscription stop is no longer possible
        assert_eq!(s.player.stop(false, true).unwrap_err().code(), 404);
    }

    #[tokio::test]
    async fn channel_emptiness_ignores_bots() {
        let mut s = session(PlayerOptions::default(), connection(0));
        assert_eq!(s.player.is_channel_empty(None).unwrap_err().code(), 404);

        s.player.connection(Some(&voice_channel())).await.unwrap();
        assert!(s.player.is_channel_empty(None).unwrap());

        let busy = voice_channel().with_member(UserId::new(2), false);
        assert!(!s.player.is_channel_empty(Some(&busy)).unwrap());
    }

    #[tokio::test]
    async fn engine_must_be_registered() {
        let mut s = session(PlayerOptions::default(), connection(0));
        assert_eq!(s.player.set_engine("Deezer").unwrap_err().code(), 415);
        assert_eq!(s.player.set_engine("Napster").unwrap_err().code(), 415);
        s.player.set_engine("soundcloud").unwrap();
        assert_eq!(s.player.settings().engine, Platform::SoundCloud);
    }

    #[tokio::test]
    async fn search_shapes_results() {
        let s = session(PlayerOptions::default(), connection(0));

        let one = s.player.search("lofi", SearchOptions::default()).await.unwrap();
        assert!(matches!(one, SearchHit::One(ref t) if t.title() == "A"));

        let options = SearchOptions {
            single: false,
            limit: Some(2),
            engine: Some("SoundCloud".to_string()),
        };
        let many = s.player.search("lofi", options).await.unwrap().into_tracks();
        let titles: Vec<_> = many.iter().map(Track::title).collect();
        assert_eq!(titles, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn destroyed_player_rejects_everything() {
        let mut s = connected(PlayerOptions::default(), connection(1)).await;
        s.player.play(vec![track("A")]).await.unwrap();

        s.player.destroy(true).await.unwrap();

        assert!(s.player.is_destroyed());
        assert!(s.player.queue().is_destroyed());
        assert_eq!(s.sink.stops.load(Ordering::SeqCst), 1);
        assert!(s.player.destroy(true).await.unwrap_err().is_destroyed());
        assert!(s.player.play(vec![track("B")]).await.unwrap_err().is_destroyed());
        assert!(s.player.set_volume(50.0).unwrap_err().is_destroyed());
        assert!(s.player.set_repeat_mode("all").unwrap_err().is_destroyed());
        assert!(s
            .player
            .handle_sink_event(SinkEvent::Idle)
            .await
            .unwrap_err()
            .is_destroyed());
        assert!(s.player.handle_connection_signal(ConnectionSignal::Ready).is_none());
    }

    #[tokio::test]
    async fn transport_signals_become_player_events() {
        let mut s = connected(PlayerOptions::default(), connection(0)).await;
        let mut rx = s.player.subscribe();

        assert!(s.player.handle_connection_signal(ConnectionSignal::Ready).is_none());
        assert!(s
            .player
            .handle_connection_signal(ConnectionSignal::Error("udp".into()))
            .is_none());
        let recovery = s
            .player
            .handle_connection_signal(ConnectionSignal::Disconnected { reason: None });

        let (connection, limit) = recovery.unwrap();
        assert_eq!(limit, Duration::from_secs(5));

        s.player.mark_disconnected(&connection, "timeout".into());
        assert!(!s.player.is_connected());
        assert_eq!(
            drain(&mut rx),
            vec![
                PlayerEvent::Connect,
                PlayerEvent::Error {
                    message: "udp".into()
                },
                PlayerEvent::Disconnect {
                    reason: "timeout".into()
                },
            ]
        );
    }

    struct StalledConnection;

    #[async_trait]
    impl VoiceConnection for StalledConnection {
        fn subscribe(&self, _sink: Arc<dyn AudioSink>) -> anyhow::Result<Box<dyn Subscription>> {
            anyhow::bail!("not used")
        }

        async fn wait_for(&self, _state: ConnectionState) -> anyhow::Result<()> {
            std::future::pending().await
        }

        async fn disconnect(&self) -> bool {
            true
        }

        async fn destroy(&self) {}
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_race_times_out() {
        assert!(!awaits_recovery(&StalledConnection, Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn recovery_race_succeeds_when_transport_recovers() {
        let mut connection = MockVoiceConnection::new();
        connection.expect_wait_for().returning(|_| Ok(()));
        assert!(awaits_recovery(&connection, Duration::from_secs(5)).await);
    }
}
