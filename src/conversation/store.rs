//! Client-side conversation cache
//!
//! Holds the active conversation in memory, mirrors it to a local JSON cache
//! on every change, and pushes it to the [`ChatBackend`] after a quiet period.
//! Switching conversations serves the cached copy first and reconciles with
//! the backend afterwards.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;

use super::{ChatBackend, Conversation, Message};
use crate::Result;

/// Quiet period before a change is persisted
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(1);

/// Store tuning
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Directory for the local JSON cache; `None` disables it
    pub cache_dir: Option<PathBuf>,
    /// Quiet period before persisting
    pub debounce: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            cache_dir: None,
            debounce: DEFAULT_DEBOUNCE,
        }
    }
}

struct State {
    active: Conversation,
    history: Vec<Conversation>,
    dirty: bool,
    revision: u64,
}

struct Inner {
    state: Mutex<State>,
    backend: Option<Arc<dyn ChatBackend>>,
    options: StoreOptions,
    pending: Mutex<Option<JoinHandle<()>>>,
}

/// Cache of the active conversation and the user's chat history
#[derive(Clone)]
pub struct ConversationStore {
    inner: Arc<Inner>,
}

impl ConversationStore {
    /// Create a store with a fresh, unsaved conversation
    #[must_use]
    pub fn new(backend: Option<Arc<dyn ChatBackend>>, options: StoreOptions) -> Self {
        if let Some(dir) = &options.cache_dir {
            if let Err(e) = std::fs::create_dir_all(dir) {
                tracing::warn!(path = %dir.display(), error = %e, "failed to create conversation cache");
            }
        }

        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    active: Conversation::new(),
                    history: Vec::new(),
                    dirty: false,
                    revision: 0,
                }),
                backend,
                options,
                pending: Mutex::new(None),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of the active conversation
    #[must_use]
    pub fn active(&self) -> Conversation {
        self.state().active.clone()
    }

    /// Id of the active conversation
    #[must_use]
    pub fn active_id(&self) -> String {
        self.state().active.id.clone()
    }

    /// Messages of the active conversation
    #[must_use]
    pub fn messages(&self) -> Vec<Message> {
        self.state().active.messages.clone()
    }

    /// Append to the active conversation
    ///
    /// The local cache is updated immediately and a persist is scheduled
    /// after the debounce period. Must be called inside a tokio runtime.
    pub fn append(&self, message: Message) {
        let snapshot = {
            let mut state = self.state();
            state.active.push(message);
            state.dirty = true;
            state.revision += 1;
            let snapshot = state.active.clone();
            merge_into(&mut state.history, [snapshot.clone()]);
            snapshot
        };

        self.write_cache(&snapshot);
        self.schedule_persist();
    }

    /// Save the active conversation now, cancelling any pending debounce
    ///
    /// Used on shutdown and before switching conversations. A conversation
    /// with nothing persistable in it is never sent.
    ///
    /// # Errors
    ///
    /// Returns the backend error; the conversation stays dirty and is retried
    /// on the next debounce cycle
    pub async fn flush(&self) -> Result<()> {
        if let Some(handle) = self.take_pending() {
            handle.abort();
        }
        self.persist_now().await
    }

    /// Begin a new, unsaved conversation after flushing the current one
    pub async fn start_new(&self) -> Conversation {
        if let Err(e) = self.flush().await {
            tracing::warn!(error = %e, "failed to save conversation before starting a new one");
        }
        let conversation = Conversation::new();
        self.replace_active(conversation.clone(), false);
        conversation
    }

    /// Make `chat_id` active using only the local cache
    ///
    /// Returns the cached copy, or an empty conversation with that id.
    #[must_use]
    pub fn open_cached(&self, chat_id: &str) -> Conversation {
        let conversation = self
            .read_cache(chat_id)
            .unwrap_or_else(|| Conversation::with_id(chat_id));
        self.replace_active(conversation.clone(), false);
        conversation
    }

    /// Reconcile the active conversation with the backend
    ///
    /// A conversation the backend does not know stays as it is. When the
    /// local copy holds more messages than the backend (unsaved appends) the
    /// local copy wins and is re-persisted; otherwise the backend copy
    /// replaces it.
    ///
    /// # Errors
    ///
    /// Returns the backend error; local state is left untouched
    pub async fn reconcile(&self) -> Result<Conversation> {
        let Some(backend) = self.inner.backend.clone() else {
            return Ok(self.active());
        };

        let chat_id = self.active_id();
        let Some(remote) = backend.load(&chat_id).await? else {
            tracing::debug!(chat_id = %chat_id, "conversation not on backend, treating as new");
            return Ok(self.active());
        };

        let (snapshot, local_newer) = {
            let mut state = self.state();
            if state.active.id != chat_id {
                return Ok(state.active.clone());
            }
            let local_newer = state.active.transcript().count() > remote.messages.len();
            if !local_newer {
                state.active = remote;
                state.dirty = false;
                state.revision += 1;
            }
            let snapshot = state.active.clone();
            merge_into(&mut state.history, [snapshot.clone()]);
            (snapshot, local_newer)
        };

        self.write_cache(&snapshot);
        if local_newer {
            tracing::debug!(chat_id = %chat_id, "local copy ahead of backend, re-persisting");
            self.state().dirty = true;
            self.schedule_persist();
        }
        Ok(snapshot)
    }

    /// Switch to another conversation: flush, serve cache, reconcile
    pub async fn switch_to(&self, chat_id: &str) -> Conversation {
        if let Err(e) = self.flush().await {
            tracing::warn!(error = %e, "failed to save conversation before switching");
        }

        let cached = self.open_cached(chat_id);
        match self.reconcile().await {
            Ok(conversation) => conversation,
            Err(e) => {
                tracing::warn!(chat_id, error = %e, "failed to load conversation, using cache");
                cached
            }
        }
    }

    /// Fetch the backend's history and merge it with local entries
    ///
    /// # Errors
    ///
    /// Returns error if the backend call fails
    pub async fn refresh_history(&self) -> Result<Vec<Conversation>> {
        let Some(backend) = self.inner.backend.clone() else {
            return Ok(self.history());
        };

        let remote = backend.history().await?;
        let mut state = self.state();
        merge_into(&mut state.history, remote);
        Ok(state.history.clone())
    }

    /// Known conversations, deduplicated by id
    #[must_use]
    pub fn history(&self) -> Vec<Conversation> {
        self.state().history.clone()
    }

    /// Known conversations whose title contains `query` (case-insensitive)
    #[must_use]
    pub fn search(&self, query: &str) -> Vec<Conversation> {
        let needle = query.to_lowercase();
        self.state()
            .history
            .iter()
            .filter(|c| c.title.to_lowercase().contains(&needle))
            .cloned()
            .collect()
    }

    fn replace_active(&self, conversation: Conversation, dirty: bool) {
        let mut state = self.state();
        state.active = conversation;
        state.dirty = dirty;
        state.revision += 1;
    }

    fn take_pending(&self) -> Option<JoinHandle<()>> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn schedule_persist(&self) {
        if self.inner.backend.is_none() {
            return;
        }

        let store = self.clone();
        let debounce = self.inner.options.debounce;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            if let Err(e) = store.persist_now().await {
                tracing::warn!(error = %e, "failed to persist conversation, will retry on next change");
            }
        });

        let previous = self
            .inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    async fn persist_now(&self) -> Result<()> {
        let Some(backend) = self.inner.backend.clone() else {
            return Ok(());
        };

        let (snapshot, revision) = {
            let state = self.state();
            if !state.dirty || !state.active.has_transcript() {
                return Ok(());
            }
            (state.active.clone(), state.revision)
        };

        backend.save(&snapshot).await?;
        tracing::debug!(
            chat_id = %snapshot.id,
            messages = snapshot.messages.len(),
            "conversation persisted"
        );

        let mut state = self.state();
        if state.revision == revision && state.active.id == snapshot.id {
            state.dirty = false;
        }
        Ok(())
    }

    fn cache_path(&self, chat_id: &str) -> Option<PathBuf> {
        let dir = self.inner.options.cache_dir.as_deref()?;
        Some(cache_file(dir, chat_id))
    }

    fn write_cache(&self, conversation: &Conversation) {
        let Some(path) = self.cache_path(&conversation.id) else {
            return;
        };

        let result = serde_json::to_vec(conversation)
            .map_err(crate::Error::from)
            .and_then(|bytes| std::fs::write(&path, bytes).map_err(crate::Error::from));
        if let Err(e) = result {
            tracing::warn!(path = %path.display(), error = %e, "failed to write conversation cache");
        }
    }

    fn read_cache(&self, chat_id: &str) -> Option<Conversation> {
        let path = self.cache_path(chat_id)?;
        let bytes = std::fs::read(&path).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(conversation) => Some(conversation),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring corrupt conversation cache");
                None
            }
        }
    }
}

/// Cache file for a chat id, with anything but `[A-Za-z0-9_-]` replaced
fn cache_file(dir: &Path, chat_id: &str) -> PathBuf {
    let name: String = chat_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    dir.join(format!("{name}.json"))
}

/// Merge `incoming` into `history` by id; incoming entries replace existing
/// ones, new ids are added at the front
fn merge_into(history: &mut Vec<Conversation>, incoming: impl IntoIterator<Item = Conversation>) {
    for conversation in incoming {
        if let Some(existing) = history.iter_mut().find(|c| c.id == conversation.id) {
            *existing = conversation;
        } else {
            history.insert(0, conversation);
        }
    }
}
