//! Events broadcast by queues and players.
//!
//! Subscribers get them through `tokio::sync::broadcast`; a lagging
//! subscriber loses the oldest events, never blocks playback.

use serde::Serialize;

use crate::audio::track::TrackInfo;

pub(crate) const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueAction {
    Skip,
    Previous,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum QueueEvent {
    /// The queue was reordered or trimmed
    Change {
        action: QueueAction,
        counts: usize,
        removed: Vec<TrackInfo>,
    },
    /// Both lists were emptied
    Clean,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum PlayerEvent {
    /// The voice connection became ready
    Connect,
    /// The voice connection was lost for good
    Disconnect { reason: String },
    /// A new track started streaming
    Track(TrackInfo),
    /// The queue ran out; carries the last track played
    End(Option<TrackInfo>),
    /// Transport or sink failure
    Error { message: String },
}
