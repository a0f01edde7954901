//! Conversational turn-taking
//!
//! The [`TurnController`] consumes transcript events, decides when the user
//! has finished a turn, and drives the assistant request and the spoken
//! reply. Every request is tagged with a [`RequestToken`]; only the current
//! token's results are ever applied, so a reply that arrives after the user
//! barged in is dropped without trace.
//!
//! ```text
//! Idle ──speech──▶ UserSpeaking ──final──▶ AwaitingAssistant ──reply──▶ Speaking
//!  ▲                    ▲                        │                        │
//!  │                    └──────── barge-in ──────┴────────────────────────┤
//!  └───────────────────────────── playback done / error / stop ──────────┘
//! ```

use std::sync::Arc;

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::client::{Assistant, AssistantReply, AssistantRequest, ReplyMode};
use crate::conversation::{ConversationStore, Message};
use crate::voice::{SpeechPlayback, TranscriptEvent};
use crate::{Error, Result};

/// Interim transcripts below this confidence are ignored
pub const CONFIDENCE_THRESHOLD: f64 = 0.85;

/// Where the conversation currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    UserSpeaking,
    AwaitingAssistant,
    /// Assistant audio is playing
    Speaking,
}

/// Correlates one assistant request (and its playback) with its results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestToken(u64);

impl std::fmt::Display for RequestToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Completion notices from background work
#[derive(Debug)]
pub enum Signal {
    Reply {
        token: RequestToken,
        result: Result<AssistantReply>,
    },
    /// Streamed reply text so far
    Partial {
        token: RequestToken,
        content: String,
    },
    PlaybackDone {
        token: RequestToken,
        result: Result<()>,
    },
}

/// Observable changes, for rendering
#[derive(Debug, Clone, PartialEq)]
pub enum TurnUpdate {
    State(TurnState),
    /// Live preview of a confident interim transcript
    Preview(String),
    /// Streamed assistant text so far
    Draft(String),
    /// A message appended to the conversation
    Message(Message),
}

/// Controller tuning
#[derive(Debug, Clone)]
pub struct TurnOptions {
    pub model: Option<String>,
    pub mode: ReplyMode,
    /// Show replies without speaking them
    pub muted: bool,
    pub confidence_threshold: f64,
}

impl Default for TurnOptions {
    fn default() -> Self {
        Self {
            model: None,
            mode: ReplyMode::Voice,
            muted: false,
            confidence_threshold: CONFIDENCE_THRESHOLD,
        }
    }
}

/// Work in flight for the current token
struct Pending {
    token: RequestToken,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Turn-taking state machine
pub struct TurnController {
    store: ConversationStore,
    assistant: Arc<dyn Assistant>,
    playback: Option<SpeechPlayback>,
    options: TurnOptions,
    state: TurnState,
    next_token: u64,
    current: Option<Pending>,
    preview: String,
    draft: Option<String>,
    language: Option<String>,
    signals_tx: mpsc::UnboundedSender<Signal>,
    signals_rx: mpsc::UnboundedReceiver<Signal>,
    updates: Option<mpsc::UnboundedSender<TurnUpdate>>,
}

impl TurnController {
    /// Create a controller; without `playback` replies are never spoken
    #[must_use]
    pub fn new(
        store: ConversationStore,
        assistant: Arc<dyn Assistant>,
        playback: Option<SpeechPlayback>,
        options: TurnOptions,
    ) -> Self {
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        Self {
            store,
            assistant,
            playback,
            options,
            state: TurnState::Idle,
            next_token: 0,
            current: None,
            preview: String::new(),
            draft: None,
            language: None,
            signals_tx,
            signals_rx,
            updates: None,
        }
    }

    /// Receive [`TurnUpdate`]s from now on
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<TurnUpdate> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.updates = Some(tx);
        rx
    }

    #[must_use]
    pub const fn state(&self) -> TurnState {
        self.state
    }

    /// Token of the request or playback in flight
    #[must_use]
    pub fn current_token(&self) -> Option<RequestToken> {
        self.current.as_ref().map(|p| p.token)
    }

    /// Live preview of what the user is saying
    #[must_use]
    pub fn preview(&self) -> &str {
        &self.preview
    }

    /// Streamed assistant text not yet complete
    #[must_use]
    pub fn draft(&self) -> Option<&str> {
        self.draft.as_deref()
    }

    #[must_use]
    pub const fn store(&self) -> &ConversationStore {
        &self.store
    }

    /// Drive the controller from `events` until they end and the last
    /// turn settles, or until `shutdown` fires
    ///
    /// # Errors
    ///
    /// Returns [`Error::StreamUnavailable`] when transcription is lost for
    /// good; a system notice is appended first
    pub async fn run<S>(&mut self, mut events: S, shutdown: CancellationToken) -> Result<()>
    where
        S: Stream<Item = Result<TranscriptEvent>> + Unpin,
    {
        let mut events_open = true;

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    self.stop();
                    return Ok(());
                }
                event = events.next(), if events_open => match event {
                    Some(Ok(event)) => self.handle_event(event),
                    Some(Err(e @ Error::StreamUnavailable(_))) => {
                        self.stop();
                        self.append(Message::system(format!("Error: {e}")));
                        return Err(e);
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "transcription interrupted");
                        self.stop();
                    }
                    None => events_open = false,
                },
                Some(signal) = self.signals_rx.recv() => self.handle_signal(signal),
            }

            if !events_open && self.current.is_none() {
                return Ok(());
            }
        }
    }

    /// Apply one transcript event
    pub fn handle_event(&mut self, event: TranscriptEvent) {
        if event.speech_started {
            self.barge_in("speech started");
            self.set_state(TurnState::UserSpeaking);
            return;
        }

        if event.speech_ended {
            if self.state == TurnState::UserSpeaking {
                self.set_preview(String::new());
                self.set_state(TurnState::Idle);
            }
            return;
        }

        if !event.has_content() {
            return;
        }

        if event.is_final {
            self.language = Some(event.language.clone());
            self.submit(event.content);
            return;
        }

        let confident = event
            .confidence
            .is_some_and(|c| c >= self.options.confidence_threshold);
        if !confident {
            tracing::trace!(confidence = ?event.confidence, "ignoring low-confidence interim");
            return;
        }

        if self.state != TurnState::UserSpeaking {
            self.barge_in("confident interim transcript");
            self.set_state(TurnState::UserSpeaking);
        }
        self.set_preview(event.content);
    }

    /// Start a turn with `text` as the user's utterance
    ///
    /// Anything in flight is cancelled first.
    pub fn submit(&mut self, text: impl Into<String>) {
        let text = text.into();
        let text = text.trim();
        if text.is_empty() {
            return;
        }

        self.barge_in("new user turn");
        self.set_preview(String::new());
        self.append(Message::user(text));

        let token = self.mint();
        let cancel = CancellationToken::new();
        let request = AssistantRequest::new(text)
            .model(self.options.model.clone())
            .language(self.language.clone())
            .mode(self.options.mode);

        let partials = (self.options.mode == ReplyMode::Streamed).then(|| {
            let (tx, mut rx) = mpsc::unbounded_channel::<String>();
            let signals = self.signals_tx.clone();
            tokio::spawn(async move {
                while let Some(content) = rx.recv().await {
                    if signals.send(Signal::Partial { token, content }).is_err() {
                        break;
                    }
                }
            });
            tx
        });

        let assistant = Arc::clone(&self.assistant);
        let signals = self.signals_tx.clone();
        let request_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            let result = assistant.send(request, request_cancel, partials).await;
            let _ = signals.send(Signal::Reply { token, result });
        });

        tracing::debug!(token = %token, "assistant request issued");
        self.current = Some(Pending {
            token,
            cancel,
            task,
        });
        self.set_state(TurnState::AwaitingAssistant);
    }

    /// Cancel everything in flight and return to idle
    pub fn stop(&mut self) {
        self.barge_in("stopped");
        self.set_preview(String::new());
        self.set_state(TurnState::Idle);
    }

    /// Wait for and apply the next background signal
    pub async fn process_next_signal(&mut self) {
        if let Some(signal) = self.signals_rx.recv().await {
            self.handle_signal(signal);
        }
    }

    /// Apply signals until nothing is in flight
    pub async fn settle(&mut self) {
        while self.current.is_some() {
            self.process_next_signal().await;
        }
    }

    /// Apply one background signal
    pub fn handle_signal(&mut self, signal: Signal) {
        match signal {
            Signal::Partial { token, content } => {
                if self.is_current(token) && self.state == TurnState::AwaitingAssistant {
                    self.draft = Some(content.clone());
                    self.emit(TurnUpdate::Draft(content));
                }
            }
            Signal::Reply { token, result } => {
                if !self.is_current(token) || self.state != TurnState::AwaitingAssistant {
                    tracing::debug!(token = %token, "discarding stale assistant reply");
                    return;
                }
                self.on_reply(token, result);
            }
            Signal::PlaybackDone { token, result } => {
                if !self.is_current(token) {
                    tracing::debug!(token = %token, "ignoring superseded playback");
                    return;
                }
                match result {
                    Ok(()) => tracing::debug!(token = %token, "playback finished"),
                    Err(e) if e.is_barge_in() => {}
                    Err(e) => tracing::warn!(error = %e, "reply not spoken"),
                }
                self.current = None;
                self.set_state(TurnState::Idle);
            }
        }
    }

    fn on_reply(&mut self, token: RequestToken, result: Result<AssistantReply>) {
        self.draft = None;
        self.current = None;

        let reply = match result {
            Ok(reply) => reply,
            Err(e) if e.is_barge_in() => {
                self.set_state(TurnState::Idle);
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "assistant request failed");
                self.append(Message::system(format!("Error: {e}")));
                self.set_state(TurnState::Idle);
                return;
            }
        };

        self.append(Message::assistant(reply.content.clone()));

        let Some(playback) = self.playback.clone().filter(|_| !self.options.muted) else {
            self.set_state(TurnState::Idle);
            return;
        };

        let language = reply.language.or_else(|| self.language.clone());
        let signals = self.signals_tx.clone();
        let cancel = CancellationToken::new();
        let playback_cancel = cancel.clone();
        // A barge-in can land before the task gets to claim the output
        let task = tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                () = playback_cancel.cancelled() => Err(Error::Interrupted),
                result = playback.play(&reply.content, language.as_deref()) => result,
            };
            let _ = signals.send(Signal::PlaybackDone { token, result });
        });

        self.current = Some(Pending {
            token,
            cancel,
            task,
        });
        self.set_state(TurnState::Speaking);
    }

    /// Cancel the in-flight request and silence playback
    fn barge_in(&mut self, reason: &str) {
        if let Some(pending) = self.current.take() {
            tracing::debug!(token = %pending.token, reason, "barge-in");
            pending.cancel.cancel();
        }
        if let Some(playback) = &self.playback {
            playback.stop();
        }
        self.draft = None;
    }

    fn mint(&mut self) -> RequestToken {
        self.next_token += 1;
        RequestToken(self.next_token)
    }

    fn is_current(&self, token: RequestToken) -> bool {
        self.current.as_ref().is_some_and(|p| p.token == token)
    }

    fn append(&self, message: Message) {
        self.store.append(message.clone());
        self.emit(TurnUpdate::Message(message));
    }

    fn set_state(&mut self, state: TurnState) {
        if self.state != state {
            tracing::debug!(from = ?self.state, to = ?state, "turn state");
            self.state = state;
            self.emit(TurnUpdate::State(state));
        }
    }

    fn set_preview(&mut self, preview: String) {
        if self.preview != preview {
            self.preview = preview.clone();
            self.emit(TurnUpdate::Preview(preview));
        }
    }

    fn emit(&self, update: TurnUpdate) {
        if let Some(tx) = &self.updates {
            let _ = tx.send(update);
        }
    }
}

impl Drop for TurnController {
    fn drop(&mut self) {
        if let Some(pending) = self.current.take() {
            pending.cancel.cancel();
            pending.task.abort();
        }
        if let Some(playback) = &self.playback {
            playback.stop();
        }
    }
}
