//! Realtime conversational session subsystem: microphone capture, gapless
//! playback of streamed audio, periodic screen capture and a bidirectional
//! WebSocket protocol client, orchestrated into one observable session.
//!
//! The entry point is [`SessionOrchestrator`]; everything else is reachable
//! through it. Hosts on platforms without ALSA (or with their own display
//! pipeline) supply custom [`SessionBackends`].

pub mod audio;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod protocol;
pub mod screen;
pub mod session;
pub mod transcript;

pub use client::{ClientEvent, ConnState, ProtocolClient};
pub use config::{CAPTURE_SAMPLE_RATE, PLAYBACK_SAMPLE_RATE, ResponseModality, SessionConfig};
pub use error::SessionError;
pub use events::{EventBus, EventKind, SessionEvent, SubscriptionId};
pub use screen::{DisplayFrame, DisplayOpener, DisplaySource, DisplayStream, SharedDisplaySource};
pub use session::{SessionBackends, SessionOrchestrator};
pub use transcript::{
    Analytics, ContextPatch, ConversationSession, ConversationTurn, InterviewContext, Question,
    Role, ScreenFrameRecord,
};
