//! Transcript events decoded from the speech-to-text vendor

use serde::Deserialize;

/// Language reported when the vendor names none
pub const DEFAULT_LANGUAGE: &str = "en-US";

/// One event from the transcription stream
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TranscriptEvent {
    pub content: String,
    pub language: String,
    pub is_final: bool,
    pub confidence: Option<f64>,
    pub speech_started: bool,
    pub speech_ended: bool,
}

impl TranscriptEvent {
    /// An interim or final transcript
    #[must_use]
    pub fn transcript(content: impl Into<String>, is_final: bool, confidence: f64) -> Self {
        Self {
            content: content.into(),
            language: DEFAULT_LANGUAGE.to_string(),
            is_final,
            confidence: Some(confidence),
            ..Self::default()
        }
    }

    /// Voice activity began
    #[must_use]
    pub fn speech_started() -> Self {
        Self {
            language: DEFAULT_LANGUAGE.to_string(),
            speech_started: true,
            ..Self::default()
        }
    }

    /// The utterance ended
    #[must_use]
    pub fn speech_ended() -> Self {
        Self {
            language: DEFAULT_LANGUAGE.to_string(),
            speech_ended: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    /// Whether this event carries transcript text
    #[must_use]
    pub fn has_content(&self) -> bool {
        !self.content.trim().is_empty()
    }
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum VendorMessage {
    Results {
        #[serde(default)]
        is_final: bool,
        #[serde(default)]
        channel: Channel,
    },
    SpeechStarted,
    UtteranceEnd,
    #[serde(other)]
    Other,
}

#[derive(Default, Deserialize)]
struct Channel {
    #[serde(default)]
    alternatives: Vec<Alternative>,
}

#[derive(Deserialize)]
struct Alternative {
    #[serde(default)]
    transcript: String,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    languages: Vec<String>,
}

/// Decode one vendor text frame
///
/// Returns `None` for metadata, empty transcripts, and unparseable frames.
#[must_use]
pub fn parse_message(text: &str) -> Option<TranscriptEvent> {
    let message: VendorMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            tracing::debug!(error = %e, "ignoring unparseable transcript frame");
            return None;
        }
    };

    match message {
        VendorMessage::Results { is_final, channel } => {
            let alternative = channel.alternatives.into_iter().next()?;
            let content = alternative.transcript.trim().to_string();
            if content.is_empty() {
                return None;
            }

            let language = alternative
                .language
                .or_else(|| alternative.languages.into_iter().next())
                .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string());

            Some(TranscriptEvent {
                content,
                language,
                is_final,
                confidence: alternative.confidence,
                ..TranscriptEvent::default()
            })
        }
        VendorMessage::SpeechStarted => Some(TranscriptEvent::speech_started()),
        VendorMessage::UtteranceEnd => Some(TranscriptEvent::speech_ended()),
        VendorMessage::Other => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn final_result() {
        let frame = r#"{
            "type": "Results",
            "is_final": true,
            "speech_final": true,
            "channel": {"alternatives": [{"transcript": "Hello", "confidence": 0.95, "languages": ["en"]}]}
        }"#;
        let event = parse_message(frame).unwrap();
        assert_eq!(event.content, "Hello");
        assert!(event.is_final);
        assert_eq!(event.confidence, Some(0.95));
        assert_eq!(event.language, "en");
    }

    #[test]
    fn interim_result_defaults_language() {
        let frame = r#"{"type":"Results","is_final":false,
            "channel":{"alternatives":[{"transcript":"Hel","confidence":0.4}]}}"#;
        let event = parse_message(frame).unwrap();
        assert!(!event.is_final);
        assert_eq!(event.language, DEFAULT_LANGUAGE);
    }

    #[test]
    fn empty_transcript_skipped() {
        let frame = r#"{"type":"Results","is_final":true,
            "channel":{"alternatives":[{"transcript":"  ","confidence":0.0}]}}"#;
        assert_eq!(parse_message(frame), None);
    }

    #[test]
    fn vad_events() {
        let started = parse_message(r#"{"type":"SpeechStarted","timestamp":1.2}"#).unwrap();
        assert!(started.speech_started);
        assert!(!started.has_content());

        let ended = parse_message(r#"{"type":"UtteranceEnd","last_word_end":2.0}"#).unwrap();
        assert!(ended.speech_ended);
    }

    #[test]
    fn metadata_and_garbage_ignored() {
        assert_eq!(parse_message(r#"{"type":"Metadata","request_id":"x"}"#), None);
        assert_eq!(parse_message("not json"), None);
    }
}
