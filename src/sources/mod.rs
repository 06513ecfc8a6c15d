//! # Sources
//!
//! Contract between the player and the search engines that resolve a query
//! into playable tracks. Engines themselves live outside this crate; they
//! implement [`MusicSource`] and are registered in an [`EngineCatalog`].

use anyhow::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, path::PathBuf, str::FromStr, sync::Arc, time::Duration};
use tracing::debug;

use crate::error::PlayerError;

/// Plataformas con motor soportado
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Platform {
    YouTube,
    SoundCloud,
    Spotify,
    Deezer,
}

impl Platform {
    pub const ALL: [Platform; 4] = [
        Platform::YouTube,
        Platform::SoundCloud,
        Platform::Spotify,
        Platform::Deezer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::YouTube => "YouTube",
            Platform::SoundCloud => "SoundCloud",
            Platform::Spotify => "Spotify",
            Platform::Deezer => "Deezer",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = PlayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Platform::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| PlayerError::unsupported_engine(s))
    }
}

/// Descriptor of an audio stream the sink knows how to open.
///
/// Descriptors are cheap to clone and can be opened again, which is what
/// makes repeat modes possible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioStream {
    /// Direct HTTP(S) media URL
    Http(String),
    /// Page URL resolved through yt-dlp
    YtDlp(String),
    /// Local file
    File(PathBuf),
}

pub type StreamFetcher = Arc<dyn Fn() -> BoxFuture<'static, Result<AudioStream>> + Send + Sync>;

/// Stream handle as handed out by an engine: either available right away or
/// requiring an asynchronous fetch.
#[derive(Clone)]
pub enum StreamSource {
    Ready(AudioStream),
    Deferred(StreamFetcher),
}

impl StreamSource {
    pub fn deferred<F, Fut>(fetch: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<AudioStream>> + Send + 'static,
    {
        StreamSource::Deferred(Arc::new(move || Box::pin(fetch())))
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, StreamSource::Ready(_))
    }
}

impl fmt::Debug for StreamSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamSource::Ready(stream) => f.debug_tuple("Ready").field(stream).finish(),
            StreamSource::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}

/// Resultado crudo de un motor, antes de convertirse en `Track`
#[derive(Debug, Clone)]
pub struct TrackResult {
    /// Provider tag as reported by the engine (e.g. "YouTube")
    pub provider: String,
    pub title: String,
    pub url: String,
    pub picture: Option<String>,
    pub duration: Option<Duration>,
    pub stream: StreamSource,
}

impl TrackResult {
    pub fn new(
        provider: impl Into<String>,
        title: impl Into<String>,
        url: impl Into<String>,
        stream: StreamSource,
    ) -> Self {
        Self {
            provider: provider.into(),
            title: title.into(),
            url: url.into(),
            picture: None,
            duration: None,
            stream,
        }
    }

    pub fn with_picture(mut self, picture: impl Into<String>) -> Self {
        self.picture = Some(picture.into());
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    /// Plataforma del resultado, si es una conocida
    pub fn platform(&self) -> Option<Platform> {
        self.provider.parse().ok()
    }
}

/// Engines answer with one track (direct link) or a list (search/playlist).
#[derive(Debug, Clone)]
pub enum SearchResults {
    Single(TrackResult),
    Many(Vec<TrackResult>),
}

impl SearchResults {
    pub fn len(&self) -> usize {
        match self {
            SearchResults::Single(_) => 1,
            SearchResults::Many(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Trait común para todos los motores de búsqueda
#[async_trait]
pub trait MusicSource: Send + Sync {
    /// Busca tracks en la fuente
    async fn search(&self, query: &str) -> Result<SearchResults>;

    /// Plataforma servida por este motor
    fn platform(&self) -> Platform;
}

/// Engines available to players, one per platform.
#[derive(Default, Clone)]
pub struct EngineCatalog {
    engines: HashMap<Platform, Arc<dyn MusicSource>>,
}

impl EngineCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registra un motor, reemplazando el anterior de la misma plataforma
    pub fn register(&mut self, engine: Arc<dyn MusicSource>) -> &mut Self {
        let platform = engine.platform();
        debug!("🔎 Motor registrado: {}", platform);
        self.engines.insert(platform, engine);
        self
    }

    pub fn with(mut self, engine: Arc<dyn MusicSource>) -> Self {
        self.register(engine);
        self
    }

    pub fn get(&self, platform: Platform) -> Option<Arc<dyn MusicSource>> {
        self.engines.get(&platform).cloned()
    }

    /// Resolves an engine by name, failing for unknown or unregistered ones.
    pub fn resolve(&self, name: &str) -> Result<(Platform, Arc<dyn MusicSource>), PlayerError> {
        let platform: Platform = name.parse()?;
        self.get(platform)
            .map(|engine| (platform, engine))
            .ok_or_else(|| PlayerError::unsupported_engine(name))
    }

    pub fn platforms(&self) -> Vec<Platform> {
        Platform::ALL
            .into_iter()
            .filter(|p| self.engines.contains_key(p))
            .collect()
    }
}

impl fmt::Debug for EngineCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineCatalog")
            .field("platforms", &self.platforms())
            .finish()
    }
}
