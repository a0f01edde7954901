//! Audio sources feeding the speech-to-text stream
//!
//! Every source produces little-endian 16-bit mono PCM (`linear16`) chunks
//! on an unbounded channel, in capture order.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::{Error, Result};

/// Sample rate for speech capture (16kHz)
pub const SAMPLE_RATE: u32 = 16000;

/// Duration of one chunk sent to the transcriber
pub const CHUNK_DURATION: Duration = Duration::from_millis(100);

/// A capture device or stand-in for one
///
/// Only one consumer owns a source at a time; [`AudioSource::stop`] releases
/// the underlying device and must be safe to call repeatedly.
pub trait AudioSource: Send {
    /// Sample rate of the produced PCM
    fn sample_rate(&self) -> u32;

    /// Begin capturing
    ///
    /// # Errors
    ///
    /// Returns [`Error::MediaAccess`] when the device cannot be opened
    fn start(&mut self) -> Result<mpsc::UnboundedReceiver<Vec<u8>>>;

    /// Stop capturing and release the device
    fn stop(&mut self);
}

/// Encode `[-1.0, 1.0]` samples as little-endian 16-bit PCM
#[must_use]
pub fn encode_linear16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        #[allow(clippy::cast_possible_truncation)]
        let value = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

/// Number of samples in one [`CHUNK_DURATION`] at `sample_rate`
fn chunk_len(sample_rate: u32) -> usize {
    let per_second = u64::from(sample_rate);
    let len = per_second * u64::try_from(CHUNK_DURATION.as_millis()).unwrap_or(100) / 1000;
    usize::try_from(len).unwrap_or(1600).max(1)
}

/// Regroups device buffers of any size into [`CHUNK_DURATION`] chunks
#[cfg_attr(not(feature = "device-audio"), allow(dead_code))]
#[derive(Debug)]
struct ChunkBatcher {
    pending: Vec<f32>,
    chunk_len: usize,
}

#[cfg_attr(not(feature = "device-audio"), allow(dead_code))]
impl ChunkBatcher {
    fn new(sample_rate: u32) -> Self {
        let chunk_len = chunk_len(sample_rate);
        Self {
            pending: Vec::with_capacity(chunk_len),
            chunk_len,
        }
    }

    /// Buffer `samples`, returning every chunk they complete as linear16
    fn push(&mut self, samples: &[f32]) -> Vec<Vec<u8>> {
        self.pending.extend_from_slice(samples);
        if self.pending.len() < self.chunk_len {
            return Vec::new();
        }

        let whole = self.pending.len() / self.chunk_len * self.chunk_len;
        let chunks = self.pending[..whole]
            .chunks(self.chunk_len)
            .map(encode_linear16)
            .collect();
        self.pending.drain(..whole);
        chunks
    }
}

/// Pre-recorded chunks, delivered all at once
///
/// The channel stays open until [`AudioSource::stop`] so the consumer sees
/// a live source.
pub struct StaticSource {
    chunks: Vec<Vec<u8>>,
    sample_rate: u32,
    sender: Option<mpsc::UnboundedSender<Vec<u8>>>,
    stopped: Arc<AtomicBool>,
}

impl StaticSource {
    #[must_use]
    pub fn new(chunks: Vec<Vec<u8>>) -> Self {
        Self {
            chunks,
            sample_rate: SAMPLE_RATE,
            sender: None,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag set once the source has been released
    #[must_use]
    pub fn stopped_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stopped)
    }
}

impl AudioSource for StaticSource {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn start(&mut self) -> Result<mpsc::UnboundedReceiver<Vec<u8>>> {
        let (tx, rx) = mpsc::unbounded_channel();
        for chunk in &self.chunks {
            let _ = tx.send(chunk.clone());
        }
        self.sender = Some(tx);
        self.stopped.store(false, Ordering::SeqCst);
        Ok(rx)
    }

    fn stop(&mut self) {
        self.sender = None;
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// Replays a WAV file at real-time pace in [`CHUNK_DURATION`] chunks
///
/// Multi-channel files are downmixed to mono. The channel closes when the
/// file is exhausted.
pub struct WavFileSource {
    samples: Arc<Vec<i16>>,
    sample_rate: u32,
    task: Option<JoinHandle<()>>,
}

impl WavFileSource {
    /// Load a 16-bit integer WAV file
    ///
    /// # Errors
    ///
    /// Returns [`Error::MediaAccess`] if the file cannot be read, or
    /// [`Error::Audio`] if it is not 16-bit integer PCM
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut reader = hound::WavReader::open(path)
            .map_err(|e| Error::MediaAccess(format!("{}: {e}", path.display())))?;

        let spec = reader.spec();
        if spec.sample_format != hound::SampleFormat::Int || spec.bits_per_sample != 16 {
            return Err(Error::Audio(format!(
                "{}: expected 16-bit integer PCM, got {} bit {:?}",
                path.display(),
                spec.bits_per_sample,
                spec.sample_format
            )));
        }

        let interleaved = reader
            .samples::<i16>()
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Audio(e.to_string()))?;

        let channels = usize::from(spec.channels.max(1));
        let samples = if channels == 1 {
            interleaved
        } else {
            interleaved
                .chunks_exact(channels)
                .map(|frame| {
                    let sum: i32 = frame.iter().map(|&s| i32::from(s)).sum();
                    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
                    let mean = (sum / channels as i32) as i16;
                    mean
                })
                .collect()
        };

        tracing::debug!(
            path = %path.display(),
            sample_rate = spec.sample_rate,
            channels = spec.channels,
            samples = samples.len(),
            "wav source loaded"
        );

        Ok(Self {
            samples: Arc::new(samples),
            sample_rate: spec.sample_rate,
            task: None,
        })
    }

}

impl AudioSource for WavFileSource {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn start(&mut self) -> Result<mpsc::UnboundedReceiver<Vec<u8>>> {
        self.stop();

        let (tx, rx) = mpsc::unbounded_channel();
        let samples = Arc::clone(&self.samples);
        let chunk_len = chunk_len(self.sample_rate);

        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CHUNK_DURATION);
            for chunk in samples.chunks(chunk_len) {
                ticker.tick().await;
                let bytes: Vec<u8> = chunk.iter().flat_map(|s| s.to_le_bytes()).collect();
                if tx.send(bytes).is_err() {
                    return;
                }
            }
            tracing::debug!("wav source exhausted");
        }));

        Ok(rx)
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for WavFileSource {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(feature = "device-audio")]
pub use microphone::MicrophoneCapture;

#[cfg(feature = "device-audio")]
mod microphone {
    use std::sync::mpsc as std_mpsc;
    use std::thread::JoinHandle;

    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use tokio::sync::mpsc;

    use super::{AudioSource, ChunkBatcher};
    use crate::{Error, Result};

    /// Default input device via cpal
    ///
    /// cpal streams are not `Send`, so the stream lives on a dedicated
    /// thread that holds it until [`AudioSource::stop`].
    pub struct MicrophoneCapture {
        sample_rate: u32,
        channels: u16,
        stop_tx: Option<std_mpsc::Sender<()>>,
        thread: Option<JoinHandle<()>>,
    }

    impl MicrophoneCapture {
        /// Probe the default input device
        ///
        /// # Errors
        ///
        /// Returns [`Error::MediaAccess`] if no input device is available
        pub fn new() -> Result<Self> {
            let host = cpal::default_host();
            let device = host
                .default_input_device()
                .ok_or_else(|| Error::MediaAccess("no input device available".to_string()))?;

            let config = device
                .default_input_config()
                .map_err(|e| Error::MediaAccess(e.to_string()))?;

            tracing::debug!(
                device = device.name().unwrap_or_default(),
                sample_rate = config.sample_rate().0,
                channels = config.channels(),
                "microphone found"
            );

            Ok(Self {
                sample_rate: config.sample_rate().0,
                channels: config.channels(),
                stop_tx: None,
                thread: None,
            })
        }
    }

    impl AudioSource for MicrophoneCapture {
        fn sample_rate(&self) -> u32 {
            self.sample_rate
        }

        fn start(&mut self) -> Result<mpsc::UnboundedReceiver<Vec<u8>>> {
            self.stop();

            let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
            let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
            let (ready_tx, ready_rx) = std_mpsc::channel::<Result<()>>();
            let channels = usize::from(self.channels.max(1));
            let sample_rate = self.sample_rate;

            let thread = std::thread::spawn(move || {
                let opened = (|| -> Result<cpal::Stream> {
                    let device = cpal::default_host()
                        .default_input_device()
                        .ok_or_else(|| Error::MediaAccess("no input device".to_string()))?;
                    let config = cpal::StreamConfig {
                        channels: u16::try_from(channels).unwrap_or(1),
                        sample_rate: cpal::SampleRate(sample_rate),
                        buffer_size: cpal::BufferSize::Default,
                    };
                    let mut batcher = ChunkBatcher::new(sample_rate);
                    let stream = device
                        .build_input_stream(
                            &config,
                            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                                let mono: Vec<f32> = if channels > 1 {
                                    data.chunks_exact(channels)
                                        .map(|frame| {
                                            #[allow(clippy::cast_precision_loss)]
                                            let n = channels as f32;
                                            frame.iter().sum::<f32>() / n
                                        })
                                        .collect()
                                } else {
                                    data.to_vec()
                                };
                                for chunk in batcher.push(&mono) {
                                    let _ = chunk_tx.send(chunk);
                                }
                            },
                            |err| {
                                tracing::error!(error = %err, "audio capture error");
                            },
                            None,
                        )
                        .map_err(|e| Error::MediaAccess(e.to_string()))?;
                    stream
                        .play()
                        .map_err(|e| Error::MediaAccess(e.to_string()))?;
                    Ok(stream)
                })();

                match opened {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        // Hold the stream until asked to stop
                        let _ = stop_rx.recv();
                        drop(stream);
                        tracing::debug!("audio capture stopped");
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            });

            match ready_rx.recv() {
                Ok(Ok(())) => {
                    tracing::debug!("audio capture started");
                    self.stop_tx = Some(stop_tx);
                    self.thread = Some(thread);
                    Ok(chunk_rx)
                }
                Ok(Err(e)) => {
                    let _ = thread.join();
                    Err(e)
                }
                Err(_) => Err(Error::MediaAccess("capture thread exited".to_string())),
            }
        }

        fn stop(&mut self) {
            if let Some(stop_tx) = self.stop_tx.take() {
                let _ = stop_tx.send(());
            }
            if let Some(thread) = self.thread.take() {
                let _ = thread.join();
            }
        }
    }

    impl Drop for MicrophoneCapture {
        fn drop(&mut self) {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear16_is_little_endian_and_clamped() {
        let bytes = encode_linear16(&[0.0, 1.0, -1.0, 2.0]);
        assert_eq!(bytes.len(), 8);
        assert_eq!(i16::from_le_bytes([bytes[0], bytes[1]]), 0);
        assert_eq!(i16::from_le_bytes([bytes[2], bytes[3]]), 32767);
        assert_eq!(i16::from_le_bytes([bytes[4], bytes[5]]), -32767);
        assert_eq!(i16::from_le_bytes([bytes[6], bytes[7]]), 32767);
    }

    #[tokio::test]
    async fn static_source_delivers_in_order_and_releases() {
        let mut source = StaticSource::new(vec![vec![1], vec![2], vec![3]]);
        let stopped = source.stopped_flag();

        let mut rx = source.start().unwrap();
        assert_eq!(rx.recv().await, Some(vec![1]));
        assert_eq!(rx.recv().await, Some(vec![2]));
        assert_eq!(rx.recv().await, Some(vec![3]));
        assert!(rx.try_recv().is_err());

        source.stop();
        source.stop();
        assert!(stopped.load(Ordering::SeqCst));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn wav_source_chunks_at_100ms() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: SAMPLE_RATE,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        // 250ms of stereo: three chunks (100, 100, 50 ms)
        for i in 0..4000 {
            writer.write_sample(100i16).unwrap();
            writer.write_sample(if i % 2 == 0 { 300i16 } else { 100 }).unwrap();
        }
        writer.finalize().unwrap();

        let mut source = WavFileSource::open(&path).unwrap();
        assert_eq!(source.sample_rate(), SAMPLE_RATE);

        let mut rx = source.start().unwrap();
        let mut sizes = Vec::new();
        while let Some(chunk) = rx.recv().await {
            sizes.push(chunk.len());
        }
        assert_eq!(sizes, vec![3200, 3200, 1600]);
    }

    #[test]
    fn device_buffers_regroup_into_100ms_chunks() {
        let mut batcher = ChunkBatcher::new(SAMPLE_RATE);

        // 10ms callbacks: nothing until the tenth
        for _ in 0..9 {
            assert!(batcher.push(&[0.5; 160]).is_empty());
        }
        let chunks = batcher.push(&[0.5; 160]);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 3200);

        // One oversized buffer yields two chunks and keeps the rest
        let chunks = batcher.push(&[0.0; 3500]);
        assert_eq!(chunks.len(), 2);
        assert!(batcher.push(&[0.0; 1299]).is_empty());
        assert_eq!(batcher.push(&[0.0; 1]).len(), 1);
    }

    #[test]
    fn wav_source_missing_file_is_media_access() {
        let result = WavFileSource::open("/nonexistent/input.wav");
        assert!(matches!(result, Err(Error::MediaAccess(_))));
    }
}
