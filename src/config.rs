//! Runtime configuration for the live session.
//!
//! All knobs are read from `INTERVIEW_LIVE_*` environment variables with
//! sensible defaults, so the surrounding application can configure the
//! subsystem without a config file.

use crate::error::SessionError;

/// Response modality requested from the remote model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseModality {
    Audio,
    Text,
}

impl ResponseModality {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseModality::Audio => "AUDIO",
            ResponseModality::Text => "TEXT",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// API credential for the remote service.
    pub api_key: String,
    /// WebSocket endpoint of the remote service.
    pub ws_url: String,
    /// Model identifier sent in the setup message.
    pub model: String,
    /// Voice used for synthesized speech.
    pub voice: String,
    /// Modalities the model should respond with.
    pub response_modalities: Vec<ResponseModality>,
    /// Request transcription of the user's audio.
    pub input_transcription: bool,
    /// Request transcription of the model's audio.
    pub output_transcription: bool,
    /// Whether screen recording may be started for this session.
    pub screen_capture_enabled: bool,
    /// Base system instruction the interview prompt is appended to.
    pub system_instruction: String,
    /// ALSA capture device name (e.g. "default", "plughw:0,0").
    pub capture_device: String,
    /// ALSA playback device name.
    pub playback_device: String,
}

/// Microphone sample rate mandated by the protocol.
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;
/// Playback sample rate mandated by the protocol.
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;

/// Credential values that are obviously copied from documentation rather
/// than configured.
const PLACEHOLDER_KEYS: &[&str] = &["YOUR_API_KEY", "your-api-key", "changeme", "xxx"];

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            ws_url:
                "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent"
                    .to_string(),
            model: "models/gemini-2.0-flash-exp".to_string(),
            voice: "Puck".to_string(),
            response_modalities: vec![ResponseModality::Audio],
            input_transcription: true,
            output_transcription: true,
            screen_capture_enabled: true,
            system_instruction: "You are a professional interviewer conducting a mock interview. \
                                 Ask one question at a time, listen to the answer, and give brief, \
                                 constructive feedback before moving on."
                .to_string(),
            capture_device: "default".to_string(),
            playback_device: "default".to_string(),
        }
    }
}

impl SessionConfig {
    /// Build a config from the process environment, falling back to defaults
    /// for anything unset.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());

        if let Some(v) = var("INTERVIEW_LIVE_API_KEY") {
            cfg.api_key = v;
        }
        if let Some(v) = var("INTERVIEW_LIVE_WS_URL") {
            cfg.ws_url = v;
        }
        if let Some(v) = var("INTERVIEW_LIVE_MODEL") {
            cfg.model = v;
        }
        if let Some(v) = var("INTERVIEW_LIVE_VOICE") {
            cfg.voice = v;
        }
        if let Some(v) = var("INTERVIEW_LIVE_SCREEN_CAPTURE") {
            cfg.screen_capture_enabled = v != "0" && !v.eq_ignore_ascii_case("false");
        }
        if let Some(v) = var("INTERVIEW_LIVE_SYSTEM_INSTRUCTION") {
            cfg.system_instruction = v;
        }
        if let Some(v) = var("INTERVIEW_LIVE_CAPTURE_DEVICE") {
            cfg.capture_device = v;
        }
        if let Some(v) = var("INTERVIEW_LIVE_PLAYBACK_DEVICE") {
            cfg.playback_device = v;
        }
        cfg
    }

    /// Reject a missing or placeholder credential before any connection
    /// attempt is made.
    pub fn validate_credential(&self) -> Result<(), SessionError> {
        let key = self.api_key.trim();
        if key.is_empty() || PLACEHOLDER_KEYS.iter().any(|p| key.eq_ignore_ascii_case(p)) {
            return Err(SessionError::InvalidCredential);
        }
        Ok(())
    }
}
