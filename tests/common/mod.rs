//! Shared test utilities

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use audiosmith::client::{Assistant, AssistantReply, AssistantRequest};
use audiosmith::llm::{ChatModel, Deltas, Prompt};
use audiosmith::voice::{AudioOutput, SpeechSynthesizer};
use audiosmith::{DbPool, Error, Result, db};

/// Set up an in-memory test database
#[must_use]
pub fn setup_test_db() -> DbPool {
    db::init_memory().expect("failed to init test db")
}

/// One scripted assistant answer
#[derive(Debug, Clone)]
pub struct Scripted {
    pub delay: Duration,
    /// `Err` text becomes a 500 server error
    pub reply: std::result::Result<String, String>,
}

impl Scripted {
    pub fn ok(text: &str) -> Self {
        Self {
            delay: Duration::ZERO,
            reply: Ok(text.to_string()),
        }
    }

    pub fn slow(text: &str, delay: Duration) -> Self {
        Self {
            delay,
            reply: Ok(text.to_string()),
        }
    }

    pub fn fail(message: &str) -> Self {
        Self {
            delay: Duration::ZERO,
            reply: Err(message.to_string()),
        }
    }
}

/// Assistant answering from a script, recording what it was asked
#[derive(Default)]
pub struct ScriptedAssistant {
    script: Mutex<VecDeque<Scripted>>,
    pub requests: Mutex<Vec<AssistantRequest>>,
}

impl ScriptedAssistant {
    pub fn new(script: impl IntoIterator<Item = Scripted>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn asked(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.message.clone())
            .collect()
    }
}

#[async_trait]
impl Assistant for ScriptedAssistant {
    async fn send(
        &self,
        request: AssistantRequest,
        cancel: CancellationToken,
        partials: Option<mpsc::UnboundedSender<String>>,
    ) -> Result<AssistantReply> {
        let language = request.language.clone();
        self.requests.lock().unwrap().push(request);
        let next = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Scripted::ok("(no script)"));

        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Error::Cancelled),
            () = tokio::time::sleep(next.delay) => {}
        }

        let content = next.reply.map_err(|body| Error::Server { status: 500, body })?;
        if let Some(tx) = partials {
            let mut so_far = String::new();
            for word in content.split_inclusive(' ') {
                so_far.push_str(word);
                let _ = tx.send(so_far.clone());
            }
        }
        Ok(AssistantReply { content, language })
    }
}

/// Language model with a fixed answer, streamed word by word
pub struct EchoModel {
    pub answer: String,
    pub prompts: Mutex<Vec<Prompt>>,
}

impl EchoModel {
    pub fn new(answer: &str) -> Arc<Self> {
        Arc::new(Self {
            answer: answer.to_string(),
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn last_prompt(&self) -> Option<Prompt> {
        self.prompts.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl ChatModel for EchoModel {
    async fn complete(&self, prompt: Prompt) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt);
        Ok(self.answer.clone())
    }

    async fn stream(&self, prompt: Prompt) -> Result<Deltas> {
        self.prompts.lock().unwrap().push(prompt);
        let parts: Vec<Result<String>> = self
            .answer
            .split_inclusive(' ')
            .map(|p| Ok(p.to_string()))
            .collect();
        Ok(futures::stream::iter(parts).boxed())
    }
}

/// Synthesizer returning a few fixed bytes
#[derive(Default)]
pub struct FixedSynth {
    pub calls: AtomicUsize,
}

#[async_trait]
impl SpeechSynthesizer for FixedSynth {
    async fn synthesize(&self, text: &str, _language: Option<&str>) -> Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(text.as_bytes().to_vec())
    }
}

/// Output that "plays" for a fixed time, honouring cancellation
pub struct TimedOutput {
    pub duration: Duration,
    pub played: AtomicUsize,
}

impl TimedOutput {
    pub fn new(duration: Duration) -> Arc<Self> {
        Arc::new(Self {
            duration,
            played: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl AudioOutput for TimedOutput {
    async fn play(&self, _audio: Vec<u8>, cancel: CancellationToken) -> Result<()> {
        tokio::select! {
            () = cancel.cancelled() => Err(Error::Interrupted),
            () = tokio::time::sleep(self.duration) => {
                self.played.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
    }
}
