use std::sync::Arc;
use tokio::sync::watch;

use crate::sources::{AudioStream, Platform};

/// Datos del track que viajan junto al recurso
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceMetadata {
    pub title: String,
    pub url: String,
    pub picture: Option<String>,
    pub platform: Platform,
    pub duration: String,
}

#[derive(Debug)]
struct ResourceInner {
    stream: AudioStream,
    metadata: ResourceMetadata,
    inline_volume: bool,
    volume: watch::Sender<f32>,
    bitrate: watch::Sender<Option<i32>>,
}

/// Playable resource handed to an [`AudioSink`](crate::voice::AudioSink).
///
/// Clones share the same controls, so a volume change made through the queue
/// reaches the sink that is currently playing the resource.
#[derive(Debug, Clone)]
pub struct AudioResource {
    inner: Arc<ResourceInner>,
}

impl AudioResource {
    pub fn new(stream: AudioStream, metadata: ResourceMetadata, inline_volume: bool) -> Self {
        Self {
            inner: Arc::new(ResourceInner {
                stream,
                metadata,
                inline_volume,
                volume: watch::Sender::new(1.0),
                bitrate: watch::Sender::new(None),
            }),
        }
    }

    pub fn stream(&self) -> &AudioStream {
        &self.inner.stream
    }

    pub fn metadata(&self) -> &ResourceMetadata {
        &self.inner.metadata
    }

    pub fn has_inline_volume(&self) -> bool {
        self.inner.inline_volume
    }

    /// Sets the volume on the logarithmic curve (1.0 = unchanged).
    ///
    /// Resources created without inline volume have no volume control and
    /// ignore the call.
    pub fn set_volume_logarithmic(&self, volume: f32) -> bool {
        if !self.inner.inline_volume {
            return false;
        }
        self.inner.volume.send_replace(volume);
        true
    }

    pub fn volume(&self) -> f32 {
        *self.inner.volume.borrow()
    }

    pub fn set_bitrate(&self, bitrate: i32) {
        self.inner.bitrate.send_replace(Some(bitrate));
    }

    pub fn bitrate(&self) -> Option<i32> {
        *self.inner.bitrate.borrow()
    }

    pub fn watch_volume(&self) -> watch::Receiver<f32> {
        self.inner.volume.subscribe()
    }

    pub fn watch_bitrate(&self) -> watch::Receiver<Option<i32>> {
        self.inner.bitrate.subscribe()
    }

    /// True when both handles point at the same underlying resource
    pub fn same_as(&self, other: &AudioResource) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
