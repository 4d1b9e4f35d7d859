//! Session event vocabulary and the subscription surface exposed to the
//! surrounding application.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::transcript::ScreenFrameRecord;

/// Everything the session reports to its subscribers. Payloads are tagged
/// variants rather than loosely typed blobs.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Connected,
    Disconnected { code: Option<u16>, reason: String },
    ListeningStart,
    ListeningStop,
    AiSpeakingStart,
    AiSpeakingStop,
    /// Raw PCM received from the remote peer (little-endian i16, 24 kHz mono).
    AudioReceived { pcm: Bytes },
    TextReceived { text: String },
    UserTranscript { text: String },
    AiTranscript { text: String },
    TurnComplete,
    Interrupted,
    ScreenCapture(ScreenFrameRecord),
    /// The display stream ended on its own (e.g. screen share revoked).
    ScreenCaptureEnded,
    Error { message: String },
}

/// Event names subscribers register for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    Disconnected,
    ListeningStart,
    ListeningStop,
    AiSpeakingStart,
    AiSpeakingStop,
    AudioReceived,
    TextReceived,
    UserTranscript,
    AiTranscript,
    TurnComplete,
    Interrupted,
    ScreenCapture,
    ScreenCaptureEnded,
    Error,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Connected => "connected",
            EventKind::Disconnected => "disconnected",
            EventKind::ListeningStart => "listening-start",
            EventKind::ListeningStop => "listening-stop",
            EventKind::AiSpeakingStart => "ai-speaking-start",
            EventKind::AiSpeakingStop => "ai-speaking-stop",
            EventKind::AudioReceived => "audio-received",
            EventKind::TextReceived => "text-received",
            EventKind::UserTranscript => "user-transcript",
            EventKind::AiTranscript => "ai-transcript",
            EventKind::TurnComplete => "turn-complete",
            EventKind::Interrupted => "interrupted",
            EventKind::ScreenCapture => "screen-capture",
            EventKind::ScreenCaptureEnded => "screen-capture-ended",
            EventKind::Error => "error",
        }
    }
}

impl SessionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SessionEvent::Connected => EventKind::Connected,
            SessionEvent::Disconnected { .. } => EventKind::Disconnected,
            SessionEvent::ListeningStart => EventKind::ListeningStart,
            SessionEvent::ListeningStop => EventKind::ListeningStop,
            SessionEvent::AiSpeakingStart => EventKind::AiSpeakingStart,
            SessionEvent::AiSpeakingStop => EventKind::AiSpeakingStop,
            SessionEvent::AudioReceived { .. } => EventKind::AudioReceived,
            SessionEvent::TextReceived { .. } => EventKind::TextReceived,
            SessionEvent::UserTranscript { .. } => EventKind::UserTranscript,
            SessionEvent::AiTranscript { .. } => EventKind::AiTranscript,
            SessionEvent::TurnComplete => EventKind::TurnComplete,
            SessionEvent::Interrupted => EventKind::Interrupted,
            SessionEvent::ScreenCapture(_) => EventKind::ScreenCapture,
            SessionEvent::ScreenCaptureEnded => EventKind::ScreenCaptureEnded,
            SessionEvent::Error { .. } => EventKind::Error,
        }
    }
}

/// Handle identifying one subscription, for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

/// A publish/subscribe table keyed by event kind. Cloning shares the table.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<HashMap<EventKind, Vec<(u64, mpsc::UnboundedSender<SessionEvent>)>>>>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register for one event kind. Events arrive on the returned receiver.
    pub fn subscribe(
        &self,
        kind: EventKind,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .lock()
            .expect("event bus poisoned")
            .entry(kind)
            .or_default()
            .push((id, tx));
        (SubscriptionId(id), rx)
    }

    /// Remove a subscription. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut table = self.inner.lock().expect("event bus poisoned");
        for subs in table.values_mut() {
            subs.retain(|(sid, _)| *sid != id.0);
        }
    }

    /// Deliver an event to every live subscriber of its kind, pruning
    /// subscribers whose receiver was dropped.
    pub fn emit(&self, event: SessionEvent) {
        let kind = event.kind();
        let mut table = self.inner.lock().expect("event bus poisoned");
        if let Some(subs) = table.get_mut(&kind) {
            subs.retain(|(_, tx)| tx.send(event.clone()).is_ok());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_matching_kind_only() {
        let bus = EventBus::new();
        let (_id, mut connected_rx) = bus.subscribe(EventKind::Connected);
        let (_id2, mut turn_rx) = bus.subscribe(EventKind::TurnComplete);

        bus.emit(SessionEvent::Connected);
        bus.emit(SessionEvent::TurnComplete);

        assert!(matches!(
            connected_rx.recv().await,
            Some(SessionEvent::Connected)
        ));
        assert!(matches!(turn_rx.recv().await, Some(SessionEvent::TurnComplete)));
        assert!(connected_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let (id, mut rx) = bus.subscribe(EventKind::Interrupted);
        bus.unsubscribe(id);
        bus.emit(SessionEvent::Interrupted);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropped_receivers_are_pruned() {
        let bus = EventBus::new();
        let (_id, rx) = bus.subscribe(EventKind::Error);
        drop(rx);
        // Must not error or grow the table.
        bus.emit(SessionEvent::Error {
            message: "boom".into(),
        });
        assert!(bus.inner.lock().unwrap()[&EventKind::Error].is_empty());
    }

    #[test]
    fn event_names_match_the_public_vocabulary() {
        assert_eq!(EventKind::AiSpeakingStart.as_str(), "ai-speaking-start");
        assert_eq!(EventKind::UserTranscript.as_str(), "user-transcript");
        assert_eq!(EventKind::ScreenCapture.as_str(), "screen-capture");
        assert_eq!(
            EventKind::ScreenCaptureEnded.as_str(),
            "screen-capture-ended"
        );
    }
}
