use serde::Serialize;
use serde_json::{Map, Value};
use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};
use tracing::{debug, info};

use crate::{
    audio::resource::{AudioResource, ResourceMetadata},
    error::{PlayerError, Result},
    sources::{Platform, StreamSource, TrackResult},
};

static NEXT_TRACK_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a track inside a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TrackId(u64);

impl TrackId {
    fn next() -> Self {
        TrackId(NEXT_TRACK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Snapshot of a track, cheap to clone into events
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackInfo {
    pub id: TrackId,
    pub title: String,
    pub url: String,
    pub picture: Option<String>,
    pub platform: Platform,
    pub duration: Option<Duration>,
}

/// One playable item: metadata plus a stream that may still need resolving.
pub struct Track {
    id: TrackId,
    title: String,
    url: String,
    picture: Option<String>,
    platform: Platform,
    duration: Option<Duration>,
    stream: StreamSource,
    resource: Option<AudioResource>,
    metadata: Map<String, Value>,
    replay: bool,
}

impl Track {
    /// Wraps an engine result. Fails with `UnsupportedSource` when the
    /// provider tag is not one of the supported platforms.
    pub fn from_result(result: TrackResult) -> Result<Self> {
        let platform = result
            .platform()
            .ok_or_else(|| PlayerError::unsupported_source(&result.provider))?;

        Ok(Self {
            id: TrackId::next(),
            title: result.title,
            url: result.url,
            picture: result.picture,
            platform,
            duration: result.duration,
            stream: result.stream,
            resource: None,
            metadata: Map::new(),
            replay: false,
        })
    }

    pub fn id(&self) -> TrackId {
        self.id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn picture(&self) -> Option<&str> {
        self.picture.as_deref()
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    pub fn stream(&self) -> &StreamSource {
        &self.stream
    }

    pub fn resource(&self) -> Option<&AudioResource> {
        self.resource.as_ref()
    }

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    /// True for copies made by [`replay`](Self::replay)
    pub fn is_replay(&self) -> bool {
        self.replay
    }

    /// Whether the stream is resolved and the resource materialized
    pub fn is_ready(&self) -> bool {
        self.resource.is_some()
    }

    /// Duración en formato `m:ss` o `h:mm:ss`
    pub fn duration_label(&self) -> String {
        match self.duration {
            Some(d) => {
                let secs = d.as_secs();
                let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
                if h > 0 {
                    format!("{}:{:02}:{:02}", h, m, s)
                } else {
                    format!("{}:{:02}", m, s)
                }
            }
            None => "0:00".to_string(),
        }
    }

    /// Resolves a deferred stream and materializes the resource.
    ///
    /// Once resolved, further calls do nothing. A failed fetch leaves the
    /// stream deferred so a later call can retry.
    pub async fn init(&mut self) -> Result<()> {
        if self.resource.is_some() {
            return Ok(());
        }

        if let StreamSource::Deferred(fetch) = &self.stream {
            let fetch = fetch.clone();
            debug!("⏳ Resolviendo stream para: {}", self.title);
            let stream = fetch()
                .await
                .map_err(|e| PlayerError::stream(&self.title, e))?;
            self.stream = StreamSource::Ready(stream);
        }

        self.create_resource(true)?;
        info!("✅ Track listo: {}", self.title);
        Ok(())
    }

    /// Returns the cached resource, building it from the resolved stream on
    /// first use.
    pub fn create_resource(&mut self, inline_volume: bool) -> Result<AudioResource> {
        if let Some(resource) = &self.resource {
            return Ok(resource.clone());
        }

        let StreamSource::Ready(stream) = &self.stream else {
            return Err(PlayerError::not_found(format!(
                "el stream de '{}' todavía no fue resuelto",
                self.title
            )));
        };

        let resource = AudioResource::new(
            stream.clone(),
            ResourceMetadata {
                title: self.title.clone(),
                url: self.url.clone(),
                picture: self.picture.clone(),
                platform: self.platform,
                duration: self.duration_label(),
            },
            inline_volume,
        );
        self.resource = Some(resource.clone());
        Ok(resource)
    }

    /// Merges metadata; keys already present keep their value.
    pub fn add_metadata(&mut self, data: Map<String, Value>) {
        for (key, value) in data {
            self.metadata.entry(key).or_insert(value);
        }
    }

    /// Copy with a fresh identity that shares the stream and the resource
    /// controls. Used to schedule the same song again.
    pub fn replay(&self) -> Track {
        Track {
            id: TrackId::next(),
            title: self.title.clone(),
            url: self.url.clone(),
            picture: self.picture.clone(),
            platform: self.platform,
            duration: self.duration,
            stream: self.stream.clone(),
            resource: self.resource.clone(),
            metadata: self.metadata.clone(),
            replay: true,
        }
    }

    pub fn info(&self) -> TrackInfo {
        TrackInfo {
            id: self.id,
            title: self.title.clone(),
            url: self.url.clone(),
            picture: self.picture.clone(),
            platform: self.platform,
            duration: self.duration,
        }
    }
}

impl fmt::Debug for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Track")
            .field("id", &self.id)
            .field("title", &self.title)
            .field("platform", &self.platform)
            .field("ready", &self.is_ready())
            .finish()
    }
}
