//! Single-flight speech playback
//!
//! [`SpeechPlayback`] owns the one audio output channel. Starting a new
//! playback stops the current one first, and a stopped or superseded
//! playback resolves with [`Error::Interrupted`].

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::tts::SpeechSynthesizer;
use crate::retry::{RetryPolicy, retry};
use crate::{Error, Result};

/// Plays encoded audio on some output
#[async_trait]
pub trait AudioOutput: Send + Sync {
    /// Play `audio` to completion, returning early once `cancel` fires
    async fn play(&self, audio: Vec<u8>, cancel: CancellationToken) -> Result<()>;
}

/// Output that discards audio, for muted or headless runs
#[derive(Debug, Clone, Copy, Default)]
pub struct NullOutput;

#[async_trait]
impl AudioOutput for NullOutput {
    async fn play(&self, audio: Vec<u8>, _cancel: CancellationToken) -> Result<()> {
        tracing::debug!(bytes = audio.len(), "discarding synthesized audio");
        Ok(())
    }
}

struct Current {
    id: u64,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Slot {
    next_id: u64,
    current: Option<Current>,
}

/// Synthesizes and plays assistant replies, one at a time
#[derive(Clone)]
pub struct SpeechPlayback {
    synthesizer: Arc<dyn SpeechSynthesizer>,
    output: Arc<dyn AudioOutput>,
    retry: RetryPolicy,
    slot: Arc<Mutex<Slot>>,
}

impl SpeechPlayback {
    #[must_use]
    pub fn new(synthesizer: Arc<dyn SpeechSynthesizer>, output: Arc<dyn AudioOutput>) -> Self {
        Self {
            synthesizer,
            output,
            retry: RetryPolicy::default(),
            slot: Arc::new(Mutex::new(Slot::default())),
        }
    }

    /// Retry policy for synthesis
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Speak `text`, resolving when playback finishes
    ///
    /// # Errors
    ///
    /// Returns [`Error::Interrupted`] if stopped or superseded,
    /// [`Error::Synthesis`] if synthesis failed after retries, or the
    /// output's error if playback failed
    pub async fn play(&self, text: &str, language: Option<&str>) -> Result<()> {
        let (id, cancel) = self.begin();

        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::Interrupted),
            result = self.synthesize_and_play(text, language, &cancel) => result,
        };

        self.finish(id);
        if result.is_ok() && cancel.is_cancelled() {
            return Err(Error::Interrupted);
        }
        result
    }

    /// Stop any current playback; a no-op when nothing is playing
    pub fn stop(&self) {
        let current = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .current
            .take();
        if let Some(current) = current {
            tracing::debug!(id = current.id, "stopping playback");
            current.cancel.cancel();
        }
    }

    /// Whether something is currently playing
    #[must_use]
    pub fn is_playing(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .current
            .is_some()
    }

    /// Claim the output, cancelling whatever held it
    fn begin(&self) -> (u64, CancellationToken) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = slot.current.take() {
            tracing::debug!(id = previous.id, "superseding playback");
            previous.cancel.cancel();
        }
        slot.next_id += 1;
        let id = slot.next_id;
        let cancel = CancellationToken::new();
        slot.current = Some(Current {
            id,
            cancel: cancel.clone(),
        });
        (id, cancel)
    }

    /// Release the output if `id` still holds it
    fn finish(&self, id: u64) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.current.as_ref().is_some_and(|c| c.id == id) {
            slot.current = None;
        }
    }

    async fn synthesize_and_play(
        &self,
        text: &str,
        language: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let audio = retry(&self.retry, "tts", |_| {
            self.synthesizer.synthesize(text, language)
        })
        .await
        .map_err(|e| match e {
            Error::Synthesis(_) => e,
            other => Error::Synthesis(other.to_string()),
        })?;

        self.output.play(audio, cancel.clone()).await
    }
}

#[cfg(feature = "device-audio")]
pub use speaker::SpeakerOutput;

#[cfg(feature = "device-audio")]
mod speaker {
    use std::io::Cursor;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex, PoisonError};
    use std::time::Duration;

    use async_trait::async_trait;
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use tokio_util::sync::CancellationToken;

    use super::AudioOutput;
    use crate::{Error, Result};

    /// Default output device via cpal, decoding MP3 with minimp3
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SpeakerOutput;

    #[async_trait]
    impl AudioOutput for SpeakerOutput {
        async fn play(&self, audio: Vec<u8>, cancel: CancellationToken) -> Result<()> {
            let stop = Arc::new(AtomicBool::new(false));
            let stop_flag = Arc::clone(&stop);
            let mut task = tokio::task::spawn_blocking(move || play_blocking(&audio, &stop_flag));

            tokio::select! {
                joined = &mut task => joined.map_err(|e| Error::Audio(e.to_string()))?,
                () = cancel.cancelled() => {
                    stop.store(true, Ordering::SeqCst);
                    let _ = task.await;
                    Err(Error::Interrupted)
                }
            }
        }
    }

    fn play_blocking(mp3: &[u8], stop: &AtomicBool) -> Result<()> {
        let (samples, sample_rate) = decode_mp3(mp3)?;
        if samples.is_empty() {
            return Ok(());
        }

        let device = cpal::default_host()
            .default_output_device()
            .ok_or_else(|| Error::Audio("no output device available".to_string()))?;
        let supported = device
            .default_output_config()
            .map_err(|e| Error::Audio(e.to_string()))?;
        let channels = usize::from(supported.channels().max(1));
        let config = cpal::StreamConfig {
            channels: supported.channels(),
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let total = samples.len();
        let samples = Arc::new(Mutex::new(samples));
        let position = Arc::new(AtomicUsize::new(0));
        let samples_cb = Arc::clone(&samples);
        let position_cb = Arc::clone(&position);

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let samples = samples_cb.lock().unwrap_or_else(PoisonError::into_inner);
                    for frame in data.chunks_mut(channels) {
                        let pos = position_cb.load(Ordering::Relaxed);
                        let sample = samples.get(pos).copied().unwrap_or(0.0);
                        frame.fill(sample);
                        if pos < samples.len() {
                            position_cb.store(pos + 1, Ordering::Relaxed);
                        }
                    }
                },
                |err| {
                    tracing::error!(error = %err, "audio playback error");
                },
                None,
            )
            .map_err(|e| Error::Audio(e.to_string()))?;

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;

        let duration_ms = (total as u64 * 1000) / u64::from(sample_rate.max(1));
        let deadline = std::time::Instant::now() + Duration::from_millis(duration_ms + 500);
        while position.load(Ordering::Relaxed) < total {
            if stop.load(Ordering::SeqCst) || std::time::Instant::now() > deadline {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }

        drop(stream);
        tracing::debug!(samples = total, "playback complete");
        Ok(())
    }

    /// Decode MP3 bytes to mono f32 samples and their sample rate
    fn decode_mp3(mp3: &[u8]) -> Result<(Vec<f32>, u32)> {
        let mut decoder = minimp3::Decoder::new(Cursor::new(mp3));
        let mut samples = Vec::new();
        let mut sample_rate = 24000;

        loop {
            match decoder.next_frame() {
                Ok(frame) => {
                    sample_rate = u32::try_from(frame.sample_rate).unwrap_or(sample_rate);
                    let channels = frame.channels.max(1);
                    samples.extend(frame.data.chunks(channels).map(|chunk| {
                        let sum: f32 = chunk.iter().map(|&s| f32::from(s) / 32768.0).sum();
                        #[allow(clippy::cast_precision_loss)]
                        let n = chunk.len() as f32;
                        sum / n
                    }));
                }
                Err(minimp3::Error::Eof) => break,
                Err(e) => return Err(Error::Audio(format!("MP3 decode error: {e}"))),
            }
        }

        Ok((samples, sample_rate))
    }
}
