//! Voice processing module
//!
//! Handles audio capture, streaming transcription, speech synthesis, and
//! playback.

mod capture;
mod playback;
mod stt;
mod transcript;
mod tts;

pub use capture::{
    AudioSource, CHUNK_DURATION, SAMPLE_RATE, StaticSource, WavFileSource, encode_linear16,
};
#[cfg(feature = "device-audio")]
pub use capture::MicrophoneCapture;
pub use playback::{AudioOutput, NullOutput, SpeechPlayback};
#[cfg(feature = "device-audio")]
pub use playback::SpeakerOutput;
pub use stt::{DEFAULT_LISTEN_URL, DEFAULT_STT_MODEL, SttConfig, TranscriptEvents, TranscriptStream};
pub use transcript::{DEFAULT_LANGUAGE, TranscriptEvent, parse_message};
pub use tts::{DEFAULT_SPEAK_URL, DeepgramTts, SpeechSynthesizer};
