use rand::seq::SliceRandom;
use std::collections::VecDeque;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{
    audio::{
        events::{QueueAction, QueueEvent, EVENT_CAPACITY},
        resource::AudioResource,
        track::{Track, TrackId},
    },
    error::{PlayerError, Result},
};

/// What to take out of the queue in [`MusicQueue::remove`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveTarget {
    Track(TrackId),
    Index(usize),
}

impl From<TrackId> for RemoveTarget {
    fn from(id: TrackId) -> Self {
        RemoveTarget::Track(id)
    }
}

impl From<usize> for RemoveTarget {
    fn from(index: usize) -> Self {
        RemoveTarget::Index(index)
    }
}

/// Ordered track list with a cursor and a play history.
///
/// The current track is always `pending[0]`; `history` holds played tracks,
/// most recent first. A track sits in exactly one of the two lists.
#[derive(Debug)]
pub struct MusicQueue {
    pending: VecDeque<Track>,
    history: VecDeque<Track>,
    initialized: bool,
    destroyed: bool,
    events: broadcast::Sender<QueueEvent>,
}

impl Default for MusicQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MusicQueue {
    pub fn new() -> Self {
        Self::with_tracks(Vec::new())
    }

    pub fn with_tracks(tracks: Vec<Track>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            pending: tracks.into(),
            history: VecDeque::new(),
            initialized: false,
            destroyed: false,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: QueueEvent) {
        // Sin suscriptores no es un error
        let _ = self.events.send(event);
    }

    fn guard(&self) -> Result<()> {
        if self.destroyed {
            warn!("⚠️ Operación sobre una cola destruida");
            return Err(PlayerError::queue_destroyed());
        }
        Ok(())
    }

    /// Destruye la cola; irreversible
    pub fn destroy(&mut self) -> Result<()> {
        self.guard()?;
        self.pending.clear();
        self.history.clear();
        self.initialized = false;
        self.destroyed = true;
        info!("💥 Cola destruida");
        Ok(())
    }

    /// Resolves every track's stream, pending first, then history.
    ///
    /// Only the first successful call does any work. If a track fails the
    /// error is returned and the queue stays uninitialized.
    pub async fn init(&mut self) -> Result<()> {
        self.guard()?;
        if self.initialized {
            return Ok(());
        }

        for track in self.pending.iter_mut().chain(self.history.iter_mut()) {
            track.init().await?;
        }

        self.initialized = true;
        debug!("📦 Cola inicializada con {} tracks", self.len());
        Ok(())
    }

    /// Agrega tracks al final de la cola
    pub fn add_tracks(&mut self, tracks: Vec<Track>) -> Result<&mut Self> {
        self.guard()?;
        let count = tracks.len();
        self.pending.extend(tracks);
        info!("➕ Agregadas {} canciones a la cola", count);
        Ok(self)
    }

    /// Track actual (cabeza de la cola)
    pub fn current(&self) -> Option<&Track> {
        if self.destroyed {
            return None;
        }
        self.pending.front()
    }

    pub fn current_mut(&mut self) -> Option<&mut Track> {
        if self.destroyed {
            return None;
        }
        self.pending.front_mut()
    }

    /// Tracks after the current one
    pub fn next_tracks(&self) -> Vec<&Track> {
        self.pending.iter().skip(1).collect()
    }

    /// Played tracks, most recent first
    pub fn previous_tracks(&self) -> Vec<&Track> {
        self.history.iter().collect()
    }

    /// Tracks in the queue, counting the current one
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized && !self.destroyed
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Avanza al siguiente track
    ///
    /// Replay copies are dropped instead of going to the history; the
    /// original they were made from is recorded when it is played.
    pub fn next(&mut self) -> Result<bool> {
        self.guard()?;
        if self.pending.len() <= 1 {
            return Ok(false);
        }
        match self.pending.pop_front() {
            Some(played) if !played.is_replay() => self.history.push_front(played),
            _ => {}
        }
        debug!("➡️ Siguiente track: {:?}", self.current().map(Track::title));
        Ok(true)
    }

    /// Vuelve al track anterior
    pub fn back(&mut self) -> Result<bool> {
        self.guard()?;
        match self.history.pop_front() {
            Some(track) => {
                self.pending.push_front(track);
                debug!("⬅️ Track anterior: {}", track_title(self.pending.front()));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Skips so that `pending[amount]` becomes current.
    ///
    /// The current track and the `amount - 1` tracks after it go to the
    /// history. Nothing happens when the target does not exist.
    pub fn skip(&mut self, amount: usize) -> Result<bool> {
        self.guard()?;
        if amount == 0 || amount >= self.pending.len() {
            return Ok(false);
        }

        for _ in 0..amount {
            if let Some(track) = self.pending.pop_front() {
                self.history.push_front(track);
            }
        }

        info!("⏭️ Saltadas {} canciones", amount);
        self.emit(QueueEvent::Change {
            action: QueueAction::Skip,
            counts: amount - 1,
            removed: Vec::new(),
        });
        Ok(true)
    }

    /// Restores `amount` tracks from the history; inverse of [`skip`](Self::skip).
    pub fn previous(&mut self, amount: usize) -> Result<bool> {
        self.guard()?;
        if amount == 0 || amount > self.history.len() {
            return Ok(false);
        }

        for _ in 0..amount {
            if let Some(track) = self.history.pop_front() {
                self.pending.push_front(track);
            }
        }

        info!("⏮️ Retrocedidas {} canciones", amount);
        self.emit(QueueEvent::Change {
            action: QueueAction::Previous,
            counts: amount - 1,
            removed: Vec::new(),
        });
        Ok(true)
    }

    /// Repeat-all rotation.
    ///
    /// The history goes back behind the pending tracks in the order it was
    /// played, so advancing keeps cycling through the whole list. A lone
    /// track without history gets a replay copy so the loop continues.
    pub fn repeat(&mut self) -> Result<()> {
        self.guard()?;
        if self.history.is_empty() {
            if self.pending.len() == 1 {
                if let Some(replay) = self.pending.front().map(Track::replay) {
                    self.pending.push_back(replay);
                }
            }
            return Ok(());
        }

        while let Some(track) = self.history.pop_back() {
            self.pending.push_back(track);
        }
        debug!("🔁 Historial reencolado, {} tracks en cola", self.pending.len());
        Ok(())
    }

    /// Schedules the current track to play once more after itself.
    pub fn repeat_one(&mut self) -> Result<()> {
        self.guard()?;
        if let Some(replay) = self.pending.front().map(Track::replay) {
            debug!("🔂 Repitiendo track: {}", replay.title());
            self.pending.push_front(replay);
        }
        Ok(())
    }

    /// Mezcla la cola sin mover el track actual
    pub fn shuffle(&mut self) -> Result<bool> {
        self.guard()?;
        if self.pending.len() < 3 {
            return Ok(false);
        }

        let mut rng = rand::thread_rng();
        self.pending.make_contiguous()[1..].shuffle(&mut rng);
        info!("🔀 Cola mezclada");
        Ok(true)
    }

    /// Removes a track by identity, or `count` tracks starting at an index.
    ///
    /// Returns `false` when nothing matched.
    pub fn remove(&mut self, target: impl Into<RemoveTarget>, count: usize) -> Result<bool> {
        self.guard()?;

        let (start, count) = match target.into() {
            RemoveTarget::Track(id) => match self.pending.iter().position(|t| t.id() == id) {
                Some(index) => (index, 1),
                None => return Ok(false),
            },
            RemoveTarget::Index(index) => (index, count.max(1)),
        };

        if start >= self.pending.len() {
            return Ok(false);
        }

        let end = start.saturating_add(count).min(self.pending.len());
        let removed: Vec<Track> = self.pending.drain(start..end).collect();
        debug!("❌ Eliminados {} tracks desde la posición {}", removed.len(), start);

        self.emit(QueueEvent::Change {
            action: QueueAction::Remove,
            counts: removed.len(),
            removed: removed.iter().map(Track::info).collect(),
        });
        Ok(true)
    }

    /// Limpia la cola y el historial
    pub fn clear(&mut self) -> Result<()> {
        self.guard()?;
        self.pending.clear();
        self.history.clear();
        info!("🗑️ Cola limpiada");
        self.emit(QueueEvent::Clean);
        Ok(())
    }

    /// Applies an encoder bitrate to every materialized resource
    pub fn set_bitrates(&mut self, bitrate: i32) -> Result<()> {
        self.guard()?;
        for resource in self.resources() {
            resource.set_bitrate(bitrate);
        }
        Ok(())
    }

    /// Applies `percent / 100` on the logarithmic volume curve of every
    /// materialized resource.
    pub fn set_volumes(&mut self, percent: f64) -> Result<()> {
        self.guard()?;
        let volume = (percent / 100.0) as f32;
        for resource in self.resources() {
            resource.set_volume_logarithmic(volume);
        }
        Ok(())
    }

    fn resources(&self) -> impl Iterator<Item = &AudioResource> {
        self.pending
            .iter()
            .chain(self.history.iter())
            .filter_map(Track::resource)
    }
}

fn track_title(track: Option<&Track>) -> &str {
    track.map(Track::title).unwrap_or("-")
}
