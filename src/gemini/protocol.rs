//! Gemini Live wire messages.

use crate::codec::EncodedFrame;
use crate::transport::{LiveConfig, ServerMessage};
use serde::Deserialize;
use serde_json::{json, Value};

pub const LIVE_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// First message on a fresh socket.
pub fn setup_message(config: &LiveConfig) -> Value {
    let mut setup = json!({
        "model": format!("models/{}", config.model.trim_start_matches("models/")),
        "generationConfig": {
            "responseModalities": ["AUDIO"],
            "speechConfig": {
                "voiceConfig": {
                    "prebuiltVoiceConfig": { "voiceName": config.voice },
                },
            },
        },
    });
    if let Some(instruction) = &config.system_instruction {
        setup["systemInstruction"] = json!({ "parts": [{ "text": instruction }] });
    }
    if config.input_transcription {
        setup["inputAudioTranscription"] = json!({});
    }
    if config.output_transcription {
        setup["outputAudioTranscription"] = json!({});
    }
    json!({ "setup": setup })
}

pub fn realtime_input_message(frame: &EncodedFrame) -> Value {
    json!({
        "realtimeInput": {
            "audio": {
                "mimeType": frame.mime_type,
                "data": frame.to_base64(),
            },
        },
    })
}

#[derive(Debug, Clone, PartialEq)]
pub enum LiveFrame {
    SetupComplete,
    Server(ServerMessage),
    /// Anything the session loop has no use for (tool calls, usage metadata).
    Other,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
    setup_complete: Option<Value>,
    server_content: Option<WireServerContent>,
    go_away: Option<WireGoAway>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireServerContent {
    model_turn: Option<WireContent>,
    #[serde(default)]
    interrupted: bool,
    #[serde(default)]
    turn_complete: bool,
    input_transcription: Option<WireTranscription>,
    output_transcription: Option<WireTranscription>,
}

#[derive(Deserialize)]
struct WireContent {
    #[serde(default)]
    parts: Vec<WirePart>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePart {
    inline_data: Option<WireBlob>,
}

#[derive(Deserialize)]
struct WireBlob {
    #[serde(default)]
    data: String,
}

#[derive(Deserialize)]
struct WireTranscription {
    text: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireGoAway {
    time_left: Option<String>,
}

pub fn parse_server_message(text: &str) -> Result<LiveFrame, String> {
    let wire: WireMessage =
        serde_json::from_str(text).map_err(|e| format!("parse error: {}", e))?;

    if wire.setup_complete.is_some() {
        return Ok(LiveFrame::SetupComplete);
    }
    if wire.server_content.is_none() && wire.go_away.is_none() {
        return Ok(LiveFrame::Other);
    }

    let mut msg = ServerMessage::default();
    if let Some(content) = wire.server_content {
        msg.audio = content
            .model_turn
            .and_then(|turn| turn.parts.into_iter().find_map(|p| p.inline_data))
            .map(|blob| blob.data)
            .filter(|data| !data.is_empty());
        msg.interrupted = content.interrupted;
        msg.turn_complete = content.turn_complete;
        msg.input_transcript = content.input_transcription.and_then(|t| t.text);
        msg.output_transcript = content.output_transcription.and_then(|t| t.text);
    }
    if let Some(go_away) = wire.go_away {
        msg.go_away = Some(go_away.time_left.unwrap_or_else(|| "unknown".into()));
    }
    Ok(LiveFrame::Server(msg))
}
