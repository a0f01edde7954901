//! Streaming speech-to-text over a vendor WebSocket
//!
//! Audio goes out as binary `linear16` frames, transcript events come back as
//! JSON text frames. The connection is driven by a background task that
//! reconnects with the configured [`RetryPolicy`] and releases the capture
//! source on every exit path.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::capture::{AudioSource, SAMPLE_RATE};
use super::transcript::{TranscriptEvent, parse_message};
use crate::retry::{RetryPolicy, retry};
use crate::{Error, Result};

/// Default vendor endpoint
pub const DEFAULT_LISTEN_URL: &str = "wss://api.deepgram.com/v1/listen";

/// Default recognition model
pub const DEFAULT_STT_MODEL: &str = "nova-2";

const KEEP_ALIVE: &str = r#"{"type":"KeepAlive"}"#;
const CLOSE_STREAM: &str = r#"{"type":"CloseStream"}"#;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Transcript events in vendor order; ends when the stream closes
pub type TranscriptEvents = UnboundedReceiverStream<Result<TranscriptEvent>>;

/// Recognition options and connection tuning
#[derive(Debug, Clone)]
pub struct SttConfig {
    pub url: String,
    pub api_key: String,
    pub model: String,
    /// `None` asks the vendor to detect the language
    pub language: Option<String>,
    /// Used when no capture source dictates one
    pub sample_rate: u32,
    pub interim_results: bool,
    /// Silence (ms) that ends an utterance
    pub endpointing_ms: u32,
    pub utterance_end_ms: u32,
    pub retry: RetryPolicy,
    pub connect_timeout: Duration,
    /// Idle period after which a keep-alive frame is sent
    pub keep_alive: Duration,
}

impl SttConfig {
    #[must_use]
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            url: DEFAULT_LISTEN_URL.to_string(),
            api_key: api_key.into(),
            model: DEFAULT_STT_MODEL.to_string(),
            language: None,
            sample_rate: SAMPLE_RATE,
            interim_results: true,
            endpointing_ms: 300,
            utterance_end_ms: 1000,
            retry: RetryPolicy::default(),
            connect_timeout: Duration::from_secs(5),
            keep_alive: Duration::from_secs(8),
        }
    }

    /// Endpoint URL with recognition options in the query
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the base URL is invalid
    pub fn listen_url(&self, sample_rate: u32) -> Result<Url> {
        let mut url = Url::parse(&self.url)
            .map_err(|e| Error::Config(format!("invalid speech-to-text url {}: {e}", self.url)))?;

        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("model", &self.model)
                .append_pair("encoding", "linear16")
                .append_pair("sample_rate", &sample_rate.to_string())
                .append_pair("channels", "1")
                .append_pair("punctuate", "true")
                .append_pair("smart_format", "true")
                .append_pair("interim_results", &self.interim_results.to_string())
                .append_pair("endpointing", &self.endpointing_ms.to_string())
                .append_pair("vad_events", "true");

            if self.interim_results {
                query.append_pair("utterance_end_ms", &self.utterance_end_ms.to_string());
            }

            match &self.language {
                Some(language) => query.append_pair("language", language),
                None => query.append_pair("detect_language", "true"),
            };
        }

        Ok(url)
    }
}

/// An open transcription session
pub struct TranscriptStream {
    audio_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    events: Option<TranscriptEvents>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl TranscriptStream {
    /// Start `source` (if any) and connect to the vendor
    ///
    /// Without a source, audio is supplied through [`TranscriptStream::send`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::MediaAccess`] if the source cannot start, or
    /// [`Error::StreamUnavailable`] once connecting has exhausted its
    /// retries; the source is released in both cases
    pub async fn open(config: SttConfig, mut source: Option<Box<dyn AudioSource>>) -> Result<Self> {
        let sample_rate = source
            .as_ref()
            .map_or(config.sample_rate, |s| s.sample_rate());

        let source_rx = match source.as_mut() {
            Some(source) => Some(source.start()?),
            None => None,
        };

        let socket = match retry(&config.retry, "stt connect", |_| connect(&config, sample_rate)).await
        {
            Ok(socket) => socket,
            Err(e) => {
                if let Some(source) = source.as_mut() {
                    source.stop();
                }
                tracing::error!(error = %e, "speech-to-text unavailable");
                return Err(Error::StreamUnavailable(e.to_string()));
            }
        };

        tracing::info!(sample_rate, model = %config.model, "speech-to-text stream open");

        let (audio_tx, audio_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let driver = Driver {
            config,
            sample_rate,
            source,
            source_rx,
            audio_rx,
            events_tx,
            cancel: cancel.clone(),
            closing: false,
        };
        let task = tokio::spawn(driver.run(socket));

        Ok(Self {
            audio_tx: Some(audio_tx),
            events: Some(UnboundedReceiverStream::new(events_rx)),
            cancel,
            task: Some(task),
        })
    }

    /// Queue an encoded audio chunk; chunks are sent in call order
    ///
    /// # Errors
    ///
    /// Returns [`Error::Stream`] if the stream has closed
    pub fn send(&self, chunk: Vec<u8>) -> Result<()> {
        self.audio_tx
            .as_ref()
            .ok_or_else(|| Error::Stream("stream closed".to_string()))?
            .send(chunk)
            .map_err(|_| Error::Stream("stream closed".to_string()))
    }

    /// Take the event stream; `None` after the first call
    pub fn take_events(&mut self) -> Option<TranscriptEvents> {
        self.events.take()
    }

    /// Close the connection and release the capture source
    ///
    /// Safe to call in any state and more than once.
    pub async fn close(&mut self) {
        self.audio_tx = None;
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "speech-to-text task ended abnormally");
            }
        }
    }
}

impl Drop for TranscriptStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Open one authenticated connection
async fn connect(config: &SttConfig, sample_rate: u32) -> Result<Socket> {
    let url = config.listen_url(sample_rate)?;
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| Error::Config(format!("invalid speech-to-text request: {e}")))?;
    request.headers_mut().insert(
        "Authorization",
        format!("Token {}", config.api_key)
            .parse()
            .map_err(|_| Error::Config("invalid speech-to-text api key".to_string()))?,
    );

    match tokio::time::timeout(config.connect_timeout, tokio_tungstenite::connect_async(request))
        .await
    {
        Err(_) => Err(Error::Stream("connection timed out".to_string())),
        Ok(Ok((socket, _response))) => Ok(socket),
        Ok(Err(tungstenite::Error::Http(response)))
            if matches!(response.status().as_u16(), 401 | 403) =>
        {
            Err(Error::Auth(format!(
                "speech-to-text rejected credentials ({})",
                response.status()
            )))
        }
        Ok(Err(e)) => Err(Error::Stream(e.to_string())),
    }
}

/// How one connection ended
enum Outcome {
    /// Closed on request
    Cancelled,
    /// Audio ran out and the vendor closed after flushing
    Finished,
    Failed(String),
}

struct Driver {
    config: SttConfig,
    sample_rate: u32,
    source: Option<Box<dyn AudioSource>>,
    source_rx: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
    audio_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    events_tx: mpsc::UnboundedSender<Result<TranscriptEvent>>,
    cancel: CancellationToken,
    /// `CloseStream` sent; a server close is now expected
    closing: bool,
}

impl Driver {
    async fn run(mut self, mut socket: Socket) {
        loop {
            match self.pump(&mut socket).await {
                Outcome::Cancelled => {
                    let _ = socket.send(Message::Text(CLOSE_STREAM.to_string())).await;
                    let _ = socket.close(None).await;
                    tracing::debug!("speech-to-text stream closed");
                    break;
                }
                Outcome::Finished => {
                    tracing::debug!("speech-to-text stream finished");
                    break;
                }
                Outcome::Failed(reason) => {
                    tracing::warn!(reason = %reason, "speech-to-text connection lost");
                    let _ = self.events_tx.send(Err(Error::Stream(reason)));

                    let config = &self.config;
                    let sample_rate = self.sample_rate;
                    let reconnect =
                        retry(&config.retry, "stt reconnect", |_| connect(config, sample_rate));
                    let result = tokio::select! {
                        () = self.cancel.cancelled() => break,
                        result = reconnect => result,
                    };

                    match result {
                        Ok(fresh) => {
                            tracing::info!("speech-to-text reconnected");
                            socket = fresh;
                            self.closing = false;
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "speech-to-text unavailable");
                            let _ = self
                                .events_tx
                                .send(Err(Error::StreamUnavailable(e.to_string())));
                            break;
                        }
                    }
                }
            }
        }

        if let Some(source) = self.source.as_mut() {
            source.stop();
        }
    }

    async fn pump(&mut self, socket: &mut Socket) -> Outcome {
        let period = self.config.keep_alive;
        let mut keep_alive = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        let mut outbound_open = true;

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return Outcome::Cancelled,

                chunk = recv_from(&mut self.source_rx), if self.source_rx.is_some() => {
                    match chunk {
                        Some(chunk) => {
                            if let Err(e) = socket.send(Message::Binary(chunk)).await {
                                return Outcome::Failed(e.to_string());
                            }
                            keep_alive.reset();
                        }
                        None => {
                            tracing::debug!("audio source exhausted, flushing transcript");
                            self.source_rx = None;
                            self.closing = true;
                            if let Err(e) = socket.send(Message::Text(CLOSE_STREAM.to_string())).await {
                                return Outcome::Failed(e.to_string());
                            }
                        }
                    }
                }

                chunk = self.audio_rx.recv(), if outbound_open => {
                    match chunk {
                        Some(chunk) => {
                            if let Err(e) = socket.send(Message::Binary(chunk)).await {
                                return Outcome::Failed(e.to_string());
                            }
                            keep_alive.reset();
                        }
                        None => outbound_open = false,
                    }
                }

                _ = keep_alive.tick() => {
                    if let Err(e) = socket.send(Message::Text(KEEP_ALIVE.to_string())).await {
                        return Outcome::Failed(e.to_string());
                    }
                }

                message = socket.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(event) = parse_message(&text) {
                                let _ = self.events_tx.send(Ok(event));
                            }
                        }
                        Some(Ok(Message::Close(_))) | None if self.closing => return Outcome::Finished,
                        Some(Ok(Message::Close(frame))) => {
                            return Outcome::Failed(format!("closed by server: {frame:?}"));
                        }
                        None => return Outcome::Failed("connection dropped".to_string()),
                        Some(Ok(_)) => {}
                        Some(Err(_)) if self.closing => return Outcome::Finished,
                        Some(Err(e)) => return Outcome::Failed(e.to_string()),
                    }
                }
            }
        }
    }
}

async fn recv_from(rx: &mut Option<mpsc::UnboundedReceiver<Vec<u8>>>) -> Option<Vec<u8>> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
