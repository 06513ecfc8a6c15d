//! Songbird-backed implementation of the voice traits.
//!
//! One [`SongbirdVoice`] serves every guild: it joins calls through the shared
//! [`Songbird`] manager and creates sinks that stream into whichever call
//! they are subscribed to.

use ::songbird::{
    driver::Bitrate,
    events::CoreEvent,
    input::{File, HttpRequest, Input, YoutubeDl},
    tracks::TrackHandle,
    Call, Event, EventContext, EventHandler as VoiceEventHandler, Songbird, TrackEvent,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use serenity::model::id::GuildId;
use std::sync::{Arc, Weak};
use tokio::{
    sync::{mpsc, watch, Mutex},
    task::AbortHandle,
};
use tracing::{debug, error, info, warn};

use super::{
    AudioSink, ConnectionSignal, ConnectionState, JoinRequest, NoSubscriberBehavior, SinkEvent,
    SinkFactory, SinkOptions, Subscription, VoiceBackend, VoiceConnection, VoiceGateway,
};
use crate::{audio::resource::AudioResource, sources::AudioStream};

/// Exponent that maps the logarithmic volume curve onto a linear gain
const LOG_VOLUME_EXPONENT: f32 = 1.660964;

/// Gateway and sink factory over a shared songbird manager.
pub struct SongbirdVoice {
    manager: Arc<Songbird>,
    http: reqwest::Client,
    connections: DashMap<GuildId, Arc<SongbirdConnection>>,
    sinks: Arc<DashMap<usize, Weak<SongbirdSink>>>,
}

impl SongbirdVoice {
    pub fn new(manager: Arc<Songbird>) -> Self {
        Self {
            manager,
            http: reqwest::Client::new(),
            connections: DashMap::new(),
            sinks: Arc::new(DashMap::new()),
        }
    }

    /// Obtiene el manager registrado en el cliente de serenity
    pub async fn from_context(ctx: &serenity::client::Context) -> Result<Self> {
        let manager = ::songbird::get(ctx)
            .await
            .ok_or_else(|| anyhow!("Songbird no inicializado"))?;
        Ok(Self::new(manager))
    }

    /// Wraps the adapter as both halves of a [`VoiceBackend`].
    pub fn into_backend(self) -> VoiceBackend {
        let voice = Arc::new(self);
        VoiceBackend::new(voice.clone(), voice)
    }
}

#[async_trait]
impl VoiceGateway for SongbirdVoice {
    async fn connect(
        &self,
        request: JoinRequest,
        signals: mpsc::UnboundedSender<ConnectionSignal>,
    ) -> Result<Arc<dyn VoiceConnection>> {
        let call = self
            .manager
            .join(request.guild_id, request.channel_id)
            .await
            .map_err(|e| anyhow!("Error al conectar al canal de voz: {e:?}"))?;

        let state = Arc::new(watch::Sender::new(ConnectionState::Ready));
        {
            let mut handler = call.lock().await;
            if let Err(e) = handler.deafen(request.self_deaf).await {
                warn!("No se pudo ensordecer al bot: {:?}", e);
            }
            if let Err(e) = handler.mute(request.self_mute).await {
                warn!("No se pudo silenciar al bot: {:?}", e);
            }

            for event in [
                CoreEvent::DriverConnect,
                CoreEvent::DriverReconnect,
                CoreEvent::DriverDisconnect,
            ] {
                handler.add_global_event(
                    Event::Core(event),
                    ConnectionWatcher {
                        guild_id: request.guild_id,
                        state: state.clone(),
                        signals: signals.clone(),
                    },
                );
            }
        }

        let connection = Arc::new(SongbirdConnection {
            guild_id: request.guild_id,
            manager: self.manager.clone(),
            call,
            state,
            sinks: self.sinks.clone(),
        });
        self.connections.insert(request.guild_id, connection.clone());

        info!("🔊 Conectado al canal de voz en guild {}", request.guild_id);
        Ok(connection)
    }

    fn existing(&self, guild_id: GuildId) -> Option<Arc<dyn VoiceConnection>> {
        // The manager is the source of truth; drop entries for calls it no longer has
        if self.manager.get(guild_id).is_none() {
            self.connections.remove(&guild_id);
            return None;
        }

        let connection = self.connections.get(&guild_id)?.clone();
        if connection.state() == ConnectionState::Destroyed {
            self.connections.remove(&guild_id);
            return None;
        }
        Some(connection)
    }
}

impl SinkFactory for SongbirdVoice {
    fn create_sink(
        &self,
        options: SinkOptions,
        events: mpsc::UnboundedSender<SinkEvent>,
    ) -> Arc<dyn AudioSink> {
        let sink = Arc::new(SongbirdSink {
            options,
            events,
            http: self.http.clone(),
            call: SyncMutex::new(None),
            current: Arc::new(SyncMutex::new(None)),
            pending: SyncMutex::new(None),
            follower: Arc::new(SyncMutex::new(None)),
        });

        self.sinks.retain(|_, sink| sink.strong_count() > 0);
        self.sinks.insert(sink_key(&sink), Arc::downgrade(&sink));
        sink
    }
}

fn sink_key<T: ?Sized>(sink: &Arc<T>) -> usize {
    Arc::as_ptr(sink) as *const () as usize
}

/// Whether a connection in `current` satisfies a wait for `target`.
///
/// Songbird renegotiates on its own, so a connection that is ready again
/// counts as having gone through signalling and connecting.
fn reaches(current: ConnectionState, target: ConnectionState) -> bool {
    match target {
        ConnectionState::Signalling | ConnectionState::Connecting => matches!(
            current,
            ConnectionState::Signalling | ConnectionState::Connecting | ConnectionState::Ready
        ),
        other => current == other,
    }
}

/// Converts a logarithmic volume into songbird's linear gain
fn linear_volume(volume: f32) -> f32 {
    volume.max(0.0).powf(LOG_VOLUME_EXPONENT)
}

struct ConnectionWatcher {
    guild_id: GuildId,
    state: Arc<watch::Sender<ConnectionState>>,
    signals: mpsc::UnboundedSender<ConnectionSignal>,
}

#[async_trait]
impl VoiceEventHandler for ConnectionWatcher {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        match ctx {
            EventContext::DriverConnect(_) | EventContext::DriverReconnect(_) => {
                debug!("🔄 Driver de voz listo en guild {}", self.guild_id);
                self.state.send_replace(ConnectionState::Ready);
                let _ = self.signals.send(ConnectionSignal::Ready);
            }
            EventContext::DriverDisconnect(data) => {
                self.state.send_replace(ConnectionState::Disconnected);
                let reason = data.reason.as_ref().map(|r| format!("{r:?}"));
                if let Some(reason) = &reason {
                    let _ = self.signals.send(ConnectionSignal::Error(reason.clone()));
                }
                let _ = self.signals.send(ConnectionSignal::Disconnected { reason });
            }
            _ => {}
        }
        None
    }
}

/// A joined songbird call.
pub struct SongbirdConnection {
    guild_id: GuildId,
    manager: Arc<Songbird>,
    call: Arc<Mutex<Call>>,
    state: Arc<watch::Sender<ConnectionState>>,
    sinks: Arc<DashMap<usize, Weak<SongbirdSink>>>,
}

impl SongbirdConnection {
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }
}

#[async_trait]
impl VoiceConnection for SongbirdConnection {
    fn subscribe(&self, sink: Arc<dyn AudioSink>) -> Result<Box<dyn Subscription>> {
        let sink = self
            .sinks
            .get(&sink_key(&sink))
            .and_then(|entry| entry.upgrade())
            .ok_or_else(|| anyhow!("el sink no fue creado por este backend de voz"))?;

        sink.attach(self.call.clone());
        debug!("🔗 Sink suscrito a la conexión del guild {}", self.guild_id);
        Ok(Box::new(SongbirdSubscription { sink }))
    }

    async fn wait_for(&self, state: ConnectionState) -> Result<()> {
        let mut rx = self.state.subscribe();
        rx.wait_for(|current| reaches(*current, state))
            .await
            .map_err(|_| anyhow!("la conexión del guild {} ya no existe", self.guild_id))?;
        Ok(())
    }

    async fn disconnect(&self) -> bool {
        let mut call = self.call.lock().await;
        match call.leave().await {
            Ok(()) => {
                self.state.send_replace(ConnectionState::Disconnected);
                true
            }
            Err(e) => {
                warn!("No se pudo salir del canal de voz en guild {}: {:?}", self.guild_id, e);
                false
            }
        }
    }

    async fn destroy(&self) {
        self.call.lock().await.remove_all_global_events();
        if let Err(e) = self.manager.remove(self.guild_id).await {
            debug!("Conexión del guild {} ya eliminada: {:?}", self.guild_id, e);
        }
        self.state.send_replace(ConnectionState::Destroyed);
    }
}

struct SongbirdSubscription {
    sink: Arc<SongbirdSink>,
}

impl Subscription for SongbirdSubscription {
    fn unsubscribe(&self) {
        self.sink.detach();
    }
}

/// Streams one resource at a time into the subscribed call.
pub struct SongbirdSink {
    options: SinkOptions,
    events: mpsc::UnboundedSender<SinkEvent>,
    http: reqwest::Client,
    call: SyncMutex<Option<Arc<Mutex<Call>>>>,
    current: Arc<SyncMutex<Option<TrackHandle>>>,
    /// Resource waiting for a subscriber (pause-on-no-subscriber only)
    pending: SyncMutex<Option<AudioResource>>,
    /// Task applying live volume/bitrate changes to the current track
    follower: Arc<SyncMutex<Option<AbortHandle>>>,
}

impl SongbirdSink {
    fn input(&self, stream: &AudioStream) -> Input {
        match stream {
            AudioStream::Http(url) => HttpRequest::new(self.http.clone(), url.clone()).into(),
            AudioStream::YtDlp(url) => YoutubeDl::new(self.http.clone(), url.clone()).into(),
            AudioStream::File(path) => File::new(path.clone()).into(),
        }
    }

    fn attach(self: &Arc<Self>, call: Arc<Mutex<Call>>) {
        *self.call.lock() = Some(call);

        if let Some(handle) = self.current.lock().as_ref() {
            let _ = handle.play();
            return;
        }

        if let Some(resource) = self.pending.lock().take() {
            let sink = self.clone();
            tokio::spawn(async move {
                if let Err(e) = sink.play(resource).await {
                    error!("❌ Error al reproducir recurso pendiente: {:?}", e);
                    let _ = sink.events.send(SinkEvent::Error(e.to_string()));
                }
            });
        }
    }

    fn detach(&self) {
        *self.call.lock() = None;

        let current = self.current.lock();
        let Some(handle) = current.as_ref() else {
            return;
        };
        match self.options.no_subscriber {
            NoSubscriberBehavior::Pause => {
                let _ = handle.pause();
            }
            NoSubscriberBehavior::Stop => {
                let _ = handle.stop();
            }
        }
    }

    async fn start(&self, call: Arc<Mutex<Call>>, resource: AudioResource) {
        let input = self.input(resource.stream());
        let mut handler = call.lock().await;

        if let Some(bitrate) = resource.bitrate() {
            handler.set_bitrate(Bitrate::BitsPerSecond(bitrate));
        }

        let handle = {
            let mut current = self.current.lock();
            let handle = handler.play_only_input(input);
            *current = Some(handle.clone());
            handle
        };
        drop(handler);

        if resource.has_inline_volume() {
            let _ = handle.set_volume(linear_volume(resource.volume()));
        }

        let _ = handle.add_event(
            Event::Track(TrackEvent::End),
            TrackNotifier {
                handle: handle.clone(),
                current: self.current.clone(),
                follower: self.follower.clone(),
                events: self.events.clone(),
                on_fire: SinkEvent::Idle,
            },
        );
        let _ = handle.add_event(
            Event::Track(TrackEvent::Error),
            TrackNotifier {
                handle: handle.clone(),
                current: self.current.clone(),
                follower: self.follower.clone(),
                events: self.events.clone(),
                on_fire: SinkEvent::Error(format!(
                    "error al reproducir '{}'",
                    resource.metadata().title
                )),
            },
        );

        let follower = tokio::spawn(follow_controls(handle, call, resource));
        replace_follower(&self.follower, Some(follower.abort_handle()));
    }
}

#[async_trait]
impl AudioSink for SongbirdSink {
    async fn play(&self, resource: AudioResource) -> Result<()> {
        let call = self.call.lock().clone();
        match call {
            Some(call) => {
                self.start(call, resource).await;
                Ok(())
            }
            None => {
                match self.options.no_subscriber {
                    NoSubscriberBehavior::Pause => {
                        debug!("⏸️ Sin suscriptores, recurso en espera: {}", resource.metadata().title);
                        *self.pending.lock() = Some(resource);
                    }
                    NoSubscriberBehavior::Stop => {
                        debug!("⏹️ Sin suscriptores, recurso descartado: {}", resource.metadata().title);
                        let _ = self.events.send(SinkEvent::Idle);
                    }
                }
                Ok(())
            }
        }
    }

    /// Songbird no interpola silencio; el flag se ignora
    fn pause(&self, _interpolate_silence: bool) -> bool {
        self.current
            .lock()
            .as_ref()
            .is_some_and(|handle| handle.pause().is_ok())
    }

    fn unpause(&self) -> bool {
        self.current
            .lock()
            .as_ref()
            .is_some_and(|handle| handle.play().is_ok())
    }

    fn stop(&self, _force: bool) -> bool {
        self.pending.lock().take();
        replace_follower(&self.follower, None);
        self.current
            .lock()
            .as_ref()
            .is_some_and(|handle| handle.stop().is_ok())
    }
}

/// Forwards the end (or failure) of a track, if it is still the sink's current one.
struct TrackNotifier {
    handle: TrackHandle,
    current: Arc<SyncMutex<Option<TrackHandle>>>,
    events: mpsc::UnboundedSender<SinkEvent>,
    follower: Arc<SyncMutex<Option<AbortHandle>>>,
    on_fire: SinkEvent,
}

#[async_trait]
impl VoiceEventHandler for TrackNotifier {
    async fn act(&self, _ctx: &EventContext<'_>) -> Option<Event> {
        let is_current = {
            let mut current = self.current.lock();
            let is_current = current
                .as_ref()
                .is_some_and(|h| h.uuid() == self.handle.uuid());
            if is_current {
                *current = None;
                replace_follower(&self.follower, None);
            }
            is_current
        };

        if is_current {
            let _ = self.events.send(self.on_fire.clone());
        }
        None
    }
}

/// Swaps the follower task in `slot`, aborting the one it replaces.
fn replace_follower(slot: &SyncMutex<Option<AbortHandle>>, next: Option<AbortHandle>) {
    let previous = std::mem::replace(&mut *slot.lock(), next);
    if let Some(previous) = previous {
        previous.abort();
    }
}

/// Applies volume and bitrate changes made on the resource while it plays.
async fn follow_controls(handle: TrackHandle, call: Arc<Mutex<Call>>, resource: AudioResource) {
    let mut volume = resource.watch_volume();
    let mut bitrate = resource.watch_bitrate();

    loop {
        tokio::select! {
            changed = volume.changed() => {
                if changed.is_err() {
                    break;
                }
                let value = *volume.borrow_and_update();
                if handle.set_volume(linear_volume(value)).is_err() {
                    break;
                }
            }
            changed = bitrate.changed() => {
                if changed.is_err() {
                    break;
                }
                let value = *bitrate.borrow_and_update();
                if handle.get_info().await.is_err() {
                    break;
                }
                if let Some(value) = value {
                    call.lock().await.set_bitrate(Bitrate::BitsPerSecond(value));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovery_states_satisfy_signalling_waits() {
        assert!(reaches(ConnectionState::Ready, ConnectionState::Signalling));
        assert!(reaches(ConnectionState::Connecting, ConnectionState::Connecting));
        assert!(!reaches(ConnectionState::Disconnected, ConnectionState::Signalling));
        assert!(!reaches(ConnectionState::Destroyed, ConnectionState::Connecting));
        assert!(reaches(ConnectionState::Destroyed, ConnectionState::Destroyed));
        assert!(!reaches(ConnectionState::Ready, ConnectionState::Disconnected));
    }

    #[test]
    fn logarithmic_volume_maps_to_linear_gain() {
        assert_eq!(linear_volume(1.0), 1.0);
        assert_eq!(linear_volume(0.0), 0.0);
        assert_eq!(linear_volume(-1.0), 0.0);
        assert!((linear_volume(0.5) - 0.316).abs() < 0.001);
        assert!(linear_volume(1.5) > 1.5);
    }

    #[tokio::test]
    async fn replaced_follower_is_aborted() {
        let slot = SyncMutex::new(None);
        let first = tokio::spawn(std::future::pending::<()>());
        let second = tokio::spawn(std::future::pending::<()>());

        replace_follower(&slot, Some(first.abort_handle()));
        replace_follower(&slot, Some(second.abort_handle()));
        assert!(first.await.unwrap_err().is_cancelled());

        replace_follower(&slot, None);
        assert!(second.await.unwrap_err().is_cancelled());
        assert!(slot.lock().is_none());
    }

    #[test]
    fn sink_keys_follow_identity() {
        let a: Arc<dyn Send + Sync> = Arc::new(1u8);
        let b = a.clone();
        let c: Arc<dyn Send + Sync> = Arc::new(1u8);
        assert_eq!(sink_key(&a), sink_key(&b));
        assert_ne!(sink_key(&a), sink_key(&c));
    }
}
