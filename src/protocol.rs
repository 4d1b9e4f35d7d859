//! Wire message shapes for the bidirectional streaming protocol, plus the
//! translation from inbound JSON into typed client events.
//!
//! The field names here are a protocol contract and must not drift.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::config::SessionConfig;
use crate::error::SessionError;

// ======================== Outbound messages ========================

/// `{ "setup": … }` — sent immediately after the transport opens.
#[derive(Serialize, Debug)]
pub struct SetupMessage {
    pub setup: SetupConfig,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SetupConfig {
    pub model: String,
    pub generation_config: GenerationConfig,
    pub system_instruction: SystemInstruction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<EmptyConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<EmptyConfig>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    pub speech_config: SpeechConfig,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Serialize, Debug)]
pub struct SystemInstruction {
    pub parts: Vec<TextPart>,
}

#[derive(Serialize, Debug)]
pub struct TextPart {
    pub text: String,
}

/// Present-but-empty toggles, e.g. `"inputAudioTranscription": {}`.
#[derive(Serialize, Debug, Default)]
pub struct EmptyConfig {}

/// `{ "realtimeInput": { "mediaChunks": [ … ] } }`
#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInputMessage {
    pub realtime_input: RealtimeInput,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<MediaChunk>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct MediaChunk {
    pub mime_type: String,
    pub data: String,
}

/// `{ "clientContent": { "turns": [ … ], "turnComplete": … } }`
#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ClientContentMessage {
    pub client_content: ClientContent,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ClientContent {
    pub turns: Vec<ContentTurn>,
    pub turn_complete: bool,
}

#[derive(Serialize, Debug)]
pub struct ContentTurn {
    pub role: String,
    pub parts: Vec<TextPart>,
}

impl SetupMessage {
    pub fn from_config(config: &SessionConfig, system_prompt: String) -> Self {
        let toggle = |enabled: bool| enabled.then(EmptyConfig::default);
        Self {
            setup: SetupConfig {
                model: config.model.clone(),
                generation_config: GenerationConfig {
                    response_modalities: config
                        .response_modalities
                        .iter()
                        .map(|m| m.as_str().to_string())
                        .collect(),
                    speech_config: SpeechConfig {
                        voice_config: VoiceConfig {
                            prebuilt_voice_config: PrebuiltVoiceConfig {
                                voice_name: config.voice.clone(),
                            },
                        },
                    },
                },
                system_instruction: SystemInstruction {
                    parts: vec![TextPart {
                        text: system_prompt,
                    }],
                },
                input_audio_transcription: toggle(config.input_transcription),
                output_audio_transcription: toggle(config.output_transcription),
            },
        }
    }
}

impl RealtimeInputMessage {
    /// One PCM audio frame, base64-encoded.
    pub fn audio(frame: &[u8]) -> Self {
        Self::chunk("audio/pcm", frame)
    }

    /// One compressed still image, base64-encoded.
    pub fn video(mime_type: &str, frame: &[u8]) -> Self {
        Self::chunk(mime_type, frame)
    }

    fn chunk(mime_type: &str, data: &[u8]) -> Self {
        Self {
            realtime_input: RealtimeInput {
                media_chunks: vec![MediaChunk {
                    mime_type: mime_type.to_string(),
                    data: BASE64.encode(data),
                }],
            },
        }
    }
}

impl ClientContentMessage {
    /// A complete user text turn.
    pub fn user_text(text: &str) -> Self {
        Self {
            client_content: ClientContent {
                turns: vec![ContentTurn {
                    role: "user".to_string(),
                    parts: vec![TextPart {
                        text: text.to_string(),
                    }],
                }],
                turn_complete: true,
            },
        }
    }
}

// ======================== Inbound messages ========================

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    setup_complete: Option<serde_json::Value>,
    server_content: Option<ServerContent>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    interrupted: Option<bool>,
    turn_complete: Option<bool>,
    input_transcription: Option<Transcription>,
    output_transcription: Option<Transcription>,
    model_turn: Option<ModelTurn>,
}

#[derive(Deserialize, Debug)]
struct Transcription {
    text: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct Part {
    inline_data: Option<InlineData>,
    text: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

/// Typed events the protocol client dispatches to the session.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The server acknowledged setup; the connection is protocol-ready.
    Connected,
    /// The user's speech cut off the model mid-utterance.
    Interrupted,
    /// The model finished its current turn.
    TurnComplete,
    /// Transcription fragment of the user's audio.
    UserTranscript(String),
    /// Transcription fragment of the model's audio.
    AiTranscript(String),
    /// Decoded PCM audio from the model (little-endian i16, 24 kHz mono).
    Audio(Bytes),
    /// Inline text part from the model.
    Text(String),
    /// The transport closed.
    Disconnected { code: Option<u16>, reason: String },
    /// A malformed inbound message; the connection stays open.
    Error(String),
}

/// Parse one inbound JSON message into the events it carries, in protocol
/// order: setup ack, interruption, transcripts, model turn parts, turn end.
pub fn decode_server_message(text: &str) -> Result<Vec<ClientEvent>, SessionError> {
    let msg: ServerMessage = serde_json::from_str(text)
        .map_err(|e| SessionError::Protocol(format!("malformed server message: {}", e)))?;

    let mut events = Vec::new();
    if msg.setup_complete.is_some() {
        events.push(ClientEvent::Connected);
    }

    let Some(content) = msg.server_content else {
        return Ok(events);
    };

    if content.interrupted == Some(true) {
        events.push(ClientEvent::Interrupted);
    }
    if let Some(text) = content.input_transcription.and_then(|t| t.text) {
        events.push(ClientEvent::UserTranscript(text));
    }
    if let Some(text) = content.output_transcription.and_then(|t| t.text) {
        events.push(ClientEvent::AiTranscript(text));
    }
    if let Some(turn) = content.model_turn {
        for part in turn.parts {
            if let Some(inline) = part.inline_data {
                if inline.mime_type.starts_with("audio/") {
                    let pcm = BASE64.decode(inline.data.as_bytes()).map_err(|e| {
                        SessionError::Protocol(format!("invalid audio payload: {}", e))
                    })?;
                    events.push(ClientEvent::Audio(Bytes::from(pcm)));
                }
            } else if let Some(text) = part.text {
                events.push(ClientEvent::Text(text));
            }
        }
    }
    if content.turn_complete == Some(true) {
        events.push(ClientEvent::TurnComplete);
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResponseModality;
    use serde_json::{Value, json};

    #[test]
    fn setup_message_shape() {
        let config = SessionConfig {
            model: "models/test".into(),
            voice: "Aoede".into(),
            response_modalities: vec![ResponseModality::Audio],
            input_transcription: true,
            output_transcription: false,
            ..SessionConfig::default()
        };
        let msg = SetupMessage::from_config(&config, "Interview the candidate.".into());
        let v: Value = serde_json::to_value(&msg).unwrap();

        assert_eq!(v["setup"]["model"], "models/test");
        assert_eq!(v["setup"]["generationConfig"]["responseModalities"][0], "AUDIO");
        assert_eq!(
            v["setup"]["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]
                ["voiceName"],
            "Aoede"
        );
        assert_eq!(
            v["setup"]["systemInstruction"]["parts"][0]["text"],
            "Interview the candidate."
        );
        assert!(v["setup"]["inputAudioTranscription"].is_object());
        assert!(v["setup"].get("outputAudioTranscription").is_none());
    }

    #[test]
    fn audio_chunk_is_base64_pcm() {
        let msg = RealtimeInputMessage::audio(&[0x01, 0x02, 0x03]);
        let v: Value = serde_json::to_value(&msg).unwrap();
        let chunk = &v["realtimeInput"]["mediaChunks"][0];
        assert_eq!(chunk["mimeType"], "audio/pcm");
        assert_eq!(chunk["data"], BASE64.encode([0x01, 0x02, 0x03]));
    }

    #[test]
    fn text_turn_shape() {
        let msg = ClientContentMessage::user_text("hello");
        let v: Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["clientContent"]["turnComplete"], true);
        assert_eq!(v["clientContent"]["turns"][0]["role"], "user");
        assert_eq!(v["clientContent"]["turns"][0]["parts"][0]["text"], "hello");
    }

    #[test]
    fn setup_ack_dispatches_connected() {
        let events = decode_server_message(r#"{"setupComplete": {}}"#).unwrap();
        assert!(matches!(events.as_slice(), [ClientEvent::Connected]));
    }

    #[test]
    fn server_content_dispatch_order() {
        let msg = json!({
            "serverContent": {
                "interrupted": true,
                "turnComplete": true,
                "inputTranscription": {"text": "hi"},
                "outputTranscription": {"text": "hello"},
                "modelTurn": {"parts": [
                    {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": BASE64.encode([1u8, 0])}},
                    {"text": "spoken text"}
                ]}
            }
        });
        let events = decode_server_message(&msg.to_string()).unwrap();
        assert_eq!(events.len(), 6);
        assert!(matches!(events[0], ClientEvent::Interrupted));
        assert!(matches!(&events[1], ClientEvent::UserTranscript(t) if t == "hi"));
        assert!(matches!(&events[2], ClientEvent::AiTranscript(t) if t == "hello"));
        assert!(matches!(&events[3], ClientEvent::Audio(pcm) if pcm.as_ref() == [1u8, 0]));
        assert!(matches!(&events[4], ClientEvent::Text(t) if t == "spoken text"));
        assert!(matches!(events[5], ClientEvent::TurnComplete));
    }

    #[test]
    fn malformed_message_is_a_protocol_error() {
        let err = decode_server_message("not json").unwrap_err();
        assert!(matches!(err, SessionError::Protocol(_)));
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let events =
            decode_server_message(r#"{"usageMetadata": {"totalTokens": 12}}"#).unwrap();
        assert!(events.is_empty());
    }
}
