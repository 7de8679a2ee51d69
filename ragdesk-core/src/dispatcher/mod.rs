//! Task dispatcher: the only writer of application state.
//!
//! The UI calls intents on a [`Dispatcher`]. Each intent is a plain synchronous call:
//! it validates its input, claims the channel it runs on, and spawns the remote work onto
//! the runtime handle it was built with. Everything the work produces comes back to the UI
//! as [`StateUpdate`]s through the [`StateObserver`].
//!
//! ```text
//! UI thread                 Dispatcher                         runtime
//! ---------                 ----------                         -------
//! send_message(text) -----> claim chat slot (or Busy)
//!                           publish TurnStarted
//!                           spawn ----------------------------> TurnRunner::run
//! observer.drain() <------- PartialText / Retrying / ... <----- progress
//! observer.drain() <------- TurnSealed, OperationFinished <---- sealed
//! ```

mod channel;
pub mod state;

pub use channel::{Channel, OperationId};
pub use state::{AppState, ChannelState, PendingTurn, RetryNotice, StateUpdate};

use crate::chat::{ChatSettings, TurnEvent, TurnRunner};
use crate::config::Config;
use crate::error::{Failure, FailureKind, Outcome, RemoteError};
use crate::knowledge::{DocumentStore, FileBlob, SyncContext, SyncError, SyncEvent, Synchronizer};
use crate::pricing::{PriceTable, TurnCost};
use crate::prompts;
use crate::provider::{Provider, ReasoningEffort, Turn};
use crate::resilience::{RetryError, RetryEvent};
use crate::stream::{Progress, TurnError};
use channel::{ChannelSlot, InFlightToken};
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, Instrument};

/// An intent that was refused before any work started.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("Another {channel} operation is still running")]
    Busy { channel: Channel },

    #[error("Message is empty")]
    EmptyMessage,

    #[error("Name must not be empty")]
    EmptyName,

    #[error("Model id must not be empty")]
    EmptyModel,

    #[error("Unknown collection '{0}'")]
    UnknownCollection(String),

    #[error("Unknown file '{0}'")]
    UnknownFile(String),

    #[error("Unknown prompt mode '{0}'")]
    UnknownPromptMode(String),
}

pub type Result<T> = std::result::Result<T, DispatchError>;

/// Applies updates to the authoritative state and forwards them to the observer.
#[derive(Debug, Clone)]
pub(crate) struct Publisher {
    state: Arc<Mutex<AppState>>,
    sender: mpsc::UnboundedSender<StateUpdate>,
}

impl Publisher {
    fn lock(&self) -> MutexGuard<'_, AppState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn publish(&self, update: StateUpdate) {
        let mut state = self.lock();
        state.apply(update.clone());
        // A closed receiver only means the UI is gone.
        let _ = self.sender.send(update);
    }

    /// Derives an update from the current state and publishes it atomically.
    fn publish_with<T>(
        &self,
        derive: impl FnOnce(&AppState) -> std::result::Result<StateUpdate, T>,
    ) -> std::result::Result<(), T> {
        let mut state = self.lock();
        let update = derive(&state)?;
        state.apply(update.clone());
        let _ = self.sender.send(update);
        Ok(())
    }

    fn snapshot(&self) -> AppState {
        self.lock().clone()
    }
}

/// Knowledge-base work, routed to the synchronizer on the knowledge channel.
#[derive(Debug)]
enum KnowledgeOp {
    LoadCache,
    Refresh(Option<String>),
    Create(String),
    Rename { id: String, name: String },
    Delete(String),
    Upload { id: String, blob: FileBlob },
    RemoveFile { id: String, file_id: String },
}

impl KnowledgeOp {
    fn label(&self) -> String {
        match self {
            KnowledgeOp::LoadCache => "load knowledge cache".to_string(),
            KnowledgeOp::Refresh(None) => "refresh knowledge base".to_string(),
            KnowledgeOp::Refresh(Some(id)) => format!("refresh {id}"),
            KnowledgeOp::Create(name) => format!("create '{name}'"),
            KnowledgeOp::Rename { id, name } => format!("rename {id} to '{name}'"),
            KnowledgeOp::Delete(id) => format!("delete {id}"),
            KnowledgeOp::Upload { blob, .. } => format!("upload '{}'", blob.name),
            KnowledgeOp::RemoveFile { file_id, .. } => format!("remove {file_id}"),
        }
    }

    async fn run(
        self,
        sync: &mut Synchronizer,
        ctx: SyncContext<'_>,
    ) -> std::result::Result<(), SyncError> {
        match self {
            KnowledgeOp::LoadCache => {
                sync.load_cache().await;
                Ok(())
            }
            KnowledgeOp::Refresh(target) => sync.refresh(target.as_deref(), ctx).await,
            KnowledgeOp::Create(name) => sync.create(&name, ctx).await.map(|_| ()),
            KnowledgeOp::Rename { id, name } => sync.rename(&id, &name, ctx).await,
            KnowledgeOp::Delete(id) => sync.delete(&id, ctx).await,
            KnowledgeOp::Upload { id, blob } => sync.upload(&id, blob, ctx).await.map(|_| ()),
            KnowledgeOp::RemoveFile { id, file_id } => {
                sync.remove_file(&id, &file_id, ctx).await
            }
        }
    }
}

struct Inner {
    runtime: Handle,
    runner: TurnRunner,
    prices: PriceTable,
    sync: tokio::sync::Mutex<Synchronizer>,
    publisher: Publisher,
    chat: Arc<ChannelSlot>,
    knowledge: Arc<ChannelSlot>,
    next_op: AtomicU64,
}

/// Entry point for every user intent.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(
        config: &Config,
        provider: Arc<dyn Provider>,
        store: Arc<dyn DocumentStore>,
        runtime: Handle,
    ) -> (Self, StateObserver) {
        let state = AppState::new(ChatSettings::from(config));
        let (sender, updates) = mpsc::unbounded_channel();
        let observer = StateObserver {
            state: state.clone(),
            updates,
        };

        let inner = Inner {
            runtime,
            runner: TurnRunner::new(provider, config.retry.clone()),
            prices: PriceTable::from_config(&config.pricing),
            sync: tokio::sync::Mutex::new(Synchronizer::new(
                store,
                config.retry.clone(),
                config.knowledge.clone(),
            )),
            publisher: Publisher {
                state: Arc::new(Mutex::new(state)),
                sender,
            },
            chat: Arc::new(ChannelSlot::new(Channel::Chat)),
            knowledge: Arc::new(ChannelSlot::new(Channel::Knowledge)),
            next_op: AtomicU64::new(1),
        };

        (
            Self {
                inner: Arc::new(inner),
            },
            observer,
        )
    }

    /// Copy of the authoritative state.
    pub fn snapshot(&self) -> AppState {
        self.inner.publisher.snapshot()
    }

    // Chat intents

    /// Appends a user turn and streams the assistant's answer.
    pub fn send_message(&self, text: &str) -> Result<OperationId> {
        let text = text.trim();
        if text.is_empty() {
            return Err(DispatchError::EmptyMessage);
        }

        let token = self.acquire(Channel::Chat, "send message")?;
        let publisher = &self.inner.publisher;
        publisher.publish(StateUpdate::TurnStarted {
            user: Turn::user(text),
        });

        let state = publisher.snapshot();
        let settings = state.settings;
        let request = settings.build_request(&state.conversation);
        info!(op = %token.op(), model = %settings.model, "Sending message");

        let inner = Arc::clone(&self.inner);
        Ok(self.spawn_operation(token, move |cancel| async move {
            let publisher = inner.publisher.clone();
            let events = move |event: TurnEvent| match event {
                TurnEvent::AttemptStarted(1) => {}
                TurnEvent::AttemptStarted(_) => publisher.publish(StateUpdate::TurnRestarted),
                TurnEvent::Progress(Progress::ResponseCreated(id)) => {
                    publisher.publish(StateUpdate::ResponseCreated { id })
                }
                TurnEvent::Progress(Progress::PartialText(delta)) => {
                    publisher.publish(StateUpdate::PartialText { delta })
                }
                TurnEvent::Progress(Progress::Usage(usage)) => {
                    publisher.publish(StateUpdate::UsageUpdated(usage))
                }
                TurnEvent::Retrying(event) => publisher.publish(retrying(Channel::Chat, event)),
            };

            match inner.runner.run(request, &cancel, &events).await {
                Ok(done) => {
                    let sealed = done.value;
                    let cost = TurnCost::from(inner.prices.estimate(&settings.model, &sealed.usage));
                    if let TurnCost::Unavailable { model } = &cost {
                        info!(model = %model, "No price for model, turn left unpriced");
                    }

                    let mut turn = Turn::assistant(sealed.text);
                    turn.usage = sealed.usage;
                    turn.model = Some(settings.model.clone());
                    turn.response_id = sealed.response_id;
                    turn.incomplete = sealed.incomplete;

                    inner.publisher.publish(StateUpdate::TurnSealed {
                        turn,
                        cost,
                        attempts: done.attempts,
                    });
                    Outcome::Completed
                }
                Err(err) => {
                    inner.publisher.publish(StateUpdate::TurnDiscarded);
                    turn_outcome(err)
                }
            }
        }))
    }

    /// Requests cancellation of whatever runs on `channel`. Returns whether anything was.
    pub fn cancel(&self, channel: Channel) -> bool {
        let cancelled = self.slot(channel).cancel();
        if cancelled {
            info!(%channel, "Cancellation requested");
        }
        cancelled
    }

    /// Resets the conversation, response id and session cost. Refused while a turn runs.
    pub fn clear_conversation(&self) -> Result<()> {
        let publisher = &self.inner.publisher;
        self.inner
            .chat
            .while_idle(|| publisher.publish(StateUpdate::ConversationCleared))
            .ok_or(DispatchError::Busy {
                channel: Channel::Chat,
            })
    }

    // Settings intents. These apply to the next turn and never wait for a running one.

    pub fn set_model(&self, model: &str) -> Result<()> {
        let model = model.trim();
        if model.is_empty() {
            return Err(DispatchError::EmptyModel);
        }
        self.update_settings(|settings| {
            settings.model = model.to_string();
            Ok(())
        })
    }

    pub fn set_reasoning_effort(&self, effort: Option<ReasoningEffort>) -> Result<()> {
        self.update_settings(|settings| {
            settings.reasoning_effort = effort;
            Ok(())
        })
    }

    /// Enables file search over `collection_id`, or disables it with `None`.
    pub fn set_file_search(&self, collection_id: Option<&str>) -> Result<()> {
        let publisher = &self.inner.publisher;
        publisher.publish_with(|state| {
            if let Some(id) = collection_id {
                if !state.knowledge.contains(id) {
                    return Err(DispatchError::UnknownCollection(id.to_string()));
                }
            }
            let mut settings = state.settings.clone();
            settings.file_search = collection_id.map(str::to_string);
            Ok(StateUpdate::SettingsChanged(settings))
        })
    }

    /// Uses a custom system prompt, leaving preset mode.
    pub fn set_system_prompt(&self, prompt: &str) -> Result<()> {
        self.update_settings(|settings| {
            settings.system_prompt = prompt.to_string();
            settings.prompt_mode = None;
            Ok(())
        })
    }

    /// Switches to one of the built-in prompt presets.
    pub fn apply_prompt_mode(&self, mode: &str) -> Result<()> {
        let prompt = prompts::preset(mode)
            .ok_or_else(|| DispatchError::UnknownPromptMode(mode.to_string()))?;
        let mode = mode.trim().to_ascii_lowercase();
        self.update_settings(|settings| {
            settings.system_prompt = prompt.to_string();
            settings.prompt_mode = Some(mode);
            Ok(())
        })
    }

    // Knowledge intents

    /// Replaces the knowledge view with the local cache, if one exists.
    pub fn load_knowledge_cache(&self) -> Result<OperationId> {
        self.run_knowledge(KnowledgeOp::LoadCache)
    }

    pub fn refresh_knowledge(&self, collection_id: Option<&str>) -> Result<OperationId> {
        if let Some(id) = collection_id {
            self.require_collection(id)?;
        }
        self.run_knowledge(KnowledgeOp::Refresh(collection_id.map(str::to_string)))
    }

    pub fn create_collection(&self, name: &str) -> Result<OperationId> {
        let name = name.trim();
        if name.is_empty() {
            return Err(DispatchError::EmptyName);
        }
        self.run_knowledge(KnowledgeOp::Create(name.to_string()))
    }

    pub fn rename_collection(&self, id: &str, name: &str) -> Result<OperationId> {
        let name = name.trim();
        if name.is_empty() {
            return Err(DispatchError::EmptyName);
        }
        self.require_collection(id)?;
        self.run_knowledge(KnowledgeOp::Rename {
            id: id.to_string(),
            name: name.to_string(),
        })
    }

    pub fn delete_collection(&self, id: &str) -> Result<OperationId> {
        self.require_collection(id)?;
        self.run_knowledge(KnowledgeOp::Delete(id.to_string()))
    }

    pub fn upload_file(&self, id: &str, blob: FileBlob) -> Result<OperationId> {
        self.require_collection(id)?;
        self.run_knowledge(KnowledgeOp::Upload {
            id: id.to_string(),
            blob,
        })
    }

    pub fn remove_file(&self, id: &str, file_id: &str) -> Result<OperationId> {
        self.require_collection(id)?;
        if !self.snapshot().knowledge.files.contains_key(file_id) {
            return Err(DispatchError::UnknownFile(file_id.to_string()));
        }
        self.run_knowledge(KnowledgeOp::RemoveFile {
            id: id.to_string(),
            file_id: file_id.to_string(),
        })
    }

    // Plumbing

    fn slot(&self, channel: Channel) -> &Arc<ChannelSlot> {
        match channel {
            Channel::Chat => &self.inner.chat,
            Channel::Knowledge => &self.inner.knowledge,
        }
    }

    fn acquire(&self, channel: Channel, label: &str) -> Result<InFlightToken> {
        let op = OperationId(self.inner.next_op.fetch_add(1, Ordering::Relaxed));
        self.slot(channel)
            .try_acquire(op, label, &self.inner.publisher)
            .ok_or(DispatchError::Busy { channel })
    }

    fn require_collection(&self, id: &str) -> Result<()> {
        if self.snapshot().knowledge.contains(id) {
            Ok(())
        } else {
            Err(DispatchError::UnknownCollection(id.to_string()))
        }
    }

    fn update_settings(&self, change: impl FnOnce(&mut ChatSettings) -> Result<()>) -> Result<()> {
        self.inner.publisher.publish_with(|state| {
            let mut settings = state.settings.clone();
            change(&mut settings)?;
            debug!(model = %settings.model, mode = ?settings.prompt_mode, "Settings changed");
            Ok(StateUpdate::SettingsChanged(settings))
        })
    }

    fn run_knowledge(&self, op: KnowledgeOp) -> Result<OperationId> {
        let token = self.acquire(Channel::Knowledge, &op.label())?;
        info!(op = %token.op(), action = %op.label(), "Knowledge operation accepted");

        let inner = Arc::clone(&self.inner);
        Ok(self.spawn_operation(token, move |cancel| async move {
            let mut sync = inner.sync.lock().await;
            let publisher = inner.publisher.clone();
            let events = move |event: SyncEvent| match event {
                SyncEvent::Changed(view) => publisher.publish(StateUpdate::KnowledgeChanged(view)),
                SyncEvent::Retrying(event) => {
                    publisher.publish(retrying(Channel::Knowledge, event))
                }
            };

            let loading = matches!(op, KnowledgeOp::LoadCache);
            let result = op.run(&mut sync, SyncContext::new(&cancel, &events)).await;
            if loading {
                events(SyncEvent::Changed(sync.view().clone()));
            }

            match result {
                Ok(()) => Outcome::Completed,
                Err(err) => sync_outcome(err),
            }
        }))
    }

    /// Runs `work` on the runtime and releases `token` with its outcome, whatever happens.
    fn spawn_operation<F, Fut>(&self, token: InFlightToken, work: F) -> OperationId
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Outcome> + Send + 'static,
    {
        let op = token.op();
        let span = info_span!("operation", channel = %token.channel(), op = op.0);
        let work = work(token.cancel_token());

        self.inner.runtime.spawn(
            async move {
                let outcome = match AssertUnwindSafe(work).catch_unwind().await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        error!("Operation panicked");
                        Outcome::Failed(Failure::internal("the operation panicked"))
                    }
                };
                match &outcome {
                    Outcome::Failed(failure) => info!(failure = %failure, "Operation failed"),
                    other => info!(outcome = ?other, "Operation finished"),
                }
                token.complete(outcome);
            }
            .instrument(span),
        );
        op
    }
}

fn retrying(channel: Channel, event: RetryEvent) -> StateUpdate {
    StateUpdate::Retrying {
        channel,
        attempt: event.attempt,
        delay: event.delay,
        reason: event.reason,
    }
}

fn turn_outcome(err: RetryError<TurnError>) -> Outcome {
    match err {
        RetryError::Cancelled { .. }
        | RetryError::Fatal {
            error: TurnError::Cancelled,
            ..
        }
        | RetryError::Exhausted {
            last: TurnError::Cancelled,
            ..
        } => Outcome::Cancelled,
        RetryError::Fatal {
            error: TurnError::Remote(err),
            ..
        } => Outcome::Failed(Failure::fatal(&err)),
        RetryError::Exhausted {
            last: TurnError::Remote(err),
            attempts,
        } => Outcome::Failed(Failure::exhausted(attempts, &err)),
    }
}

fn sync_outcome(err: SyncError) -> Outcome {
    match err {
        SyncError::Cancelled => Outcome::Cancelled,
        SyncError::Exhausted { last, attempts } => {
            Outcome::Failed(Failure::exhausted(attempts, &last))
        }
        SyncError::Fatal(err) => Outcome::Failed(Failure::fatal(&err)),
        SyncError::Conflict(detail) => Outcome::Failed(Failure::conflict(detail)),
        other @ (SyncError::UnknownCollection(_)
        | SyncError::UnknownFile(_)
        | SyncError::EmptyName) => Outcome::Failed(Failure::fatal(&RemoteError::new(
            FailureKind::InvalidRequest,
            other.to_string(),
        ))),
    }
}

/// The UI's mirror of application state.
///
/// Updates are applied to the mirror in the order the dispatcher published them, so the
/// mirror always equals some past state of the dispatcher's copy.
#[derive(Debug)]
pub struct StateObserver {
    state: AppState,
    updates: mpsc::UnboundedReceiver<StateUpdate>,
}

impl StateObserver {
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Applies and returns every update that is already queued. Never blocks.
    pub fn drain(&mut self) -> Vec<StateUpdate> {
        let mut drained = Vec::new();
        while let Ok(update) = self.updates.try_recv() {
            self.state.apply(update.clone());
            drained.push(update);
        }
        drained
    }

    /// Waits for the next update and applies it. `None` once the dispatcher is gone.
    pub async fn recv(&mut self) -> Option<StateUpdate> {
        let update = self.updates.recv().await?;
        self.state.apply(update.clone());
        Some(update)
    }

    /// Applies updates until `op` finishes, handing each one to `on_update` first.
    pub async fn until_finished(
        &mut self,
        op: OperationId,
        mut on_update: impl FnMut(&StateUpdate, &AppState),
    ) -> Option<Outcome> {
        while let Some(update) = self.recv().await {
            on_update(&update, &self.state);
            if let StateUpdate::OperationFinished {
                op: finished,
                outcome,
                ..
            } = update
            {
                if finished == op {
                    return Some(outcome);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::MemoryStore;
    use crate::provider::{Script, ScriptedProvider, TokenUsage};
    use crate::resilience::RetryPolicy;
    use tokio::sync::Notify;

    fn config() -> Config {
        let mut config = Config::default();
        config.retry = RetryPolicy::immediate(3);
        config.knowledge.cache_path = None;
        config.knowledge.poll_interval_ms = 1;
        config
    }

    fn dispatcher(provider: ScriptedProvider) -> (Dispatcher, StateObserver) {
        Dispatcher::new(
            &config(),
            Arc::new(provider),
            Arc::new(MemoryStore::new()),
            Handle::current(),
        )
    }

    #[tokio::test]
    async fn test_empty_message_is_refused() {
        let (dispatcher, _observer) = dispatcher(ScriptedProvider::default());
        assert_eq!(
            dispatcher.send_message("   "),
            Err(DispatchError::EmptyMessage)
        );
    }

    #[tokio::test]
    async fn test_second_message_while_running_is_busy() {
        let gate = Arc::new(Notify::new());
        let provider = ScriptedProvider::new([
            Script::reply(["ok"], TokenUsage::new(1, 1)).held_by(gate.clone())
        ]);
        let (dispatcher, mut observer) = dispatcher(provider.clone());

        let op = dispatcher.send_message("first").unwrap();
        assert_eq!(
            dispatcher.send_message("second"),
            Err(DispatchError::Busy {
                channel: Channel::Chat
            })
        );
        assert_eq!(
            dispatcher.clear_conversation(),
            Err(DispatchError::Busy {
                channel: Channel::Chat
            })
        );

        gate.notify_one();
        let outcome = observer.until_finished(op, |_, _| {}).await;

        assert_eq!(outcome, Some(Outcome::Completed));
        assert_eq!(provider.calls(), 1);
        assert_eq!(observer.state().conversation.len(), 2);
        assert!(observer.state().chat_channel.is_idle());
    }

    #[tokio::test]
    async fn test_cancel_finishes_as_cancelled() {
        let gate = Arc::new(Notify::new());
        let provider = ScriptedProvider::new([
            Script::reply(["never"], TokenUsage::new(1, 1)).held_by(gate)
        ]);
        let (dispatcher, mut observer) = dispatcher(provider);

        let op = dispatcher.send_message("question").unwrap();
        assert!(dispatcher.cancel(Channel::Chat));
        let outcome = observer.until_finished(op, |_, _| {}).await;

        assert_eq!(outcome, Some(Outcome::Cancelled));
        let state = observer.state();
        assert!(state.pending.is_none());
        assert_eq!(state.conversation.len(), 1);
        assert!(!dispatcher.cancel(Channel::Chat));
    }

    #[tokio::test]
    async fn test_fatal_failure_is_classified() {
        let provider =
            ScriptedProvider::new([Script::refuse(FailureKind::InvalidCredentials, "bad key")]);
        let (dispatcher, mut observer) = dispatcher(provider);

        let op = dispatcher.send_message("hi").unwrap();
        let outcome = observer.until_finished(op, |_, _| {}).await.unwrap();

        let failure = outcome.failure().unwrap();
        assert_eq!(
            failure.reason,
            crate::error::FailureReason::Fatal {
                kind: FailureKind::InvalidCredentials
            }
        );
        assert_eq!(observer.state().last_error.as_ref(), Some(failure));
    }

    #[tokio::test]
    async fn test_file_search_requires_known_collection() {
        let (dispatcher, _observer) = dispatcher(ScriptedProvider::default());
        assert_eq!(
            dispatcher.set_file_search(Some("vs_404")),
            Err(DispatchError::UnknownCollection("vs_404".into()))
        );
        assert_eq!(dispatcher.set_file_search(None), Ok(()));
    }

    #[tokio::test]
    async fn test_prompt_mode_sets_prompt() {
        let (dispatcher, mut observer) = dispatcher(ScriptedProvider::default());

        dispatcher.apply_prompt_mode("Financial").unwrap();
        observer.drain();
        assert_eq!(
            observer.state().settings.prompt_mode.as_deref(),
            Some("financial")
        );
        assert!(!observer.state().settings.system_prompt.is_empty());

        assert_eq!(
            dispatcher.apply_prompt_mode("limerick"),
            Err(DispatchError::UnknownPromptMode("limerick".into()))
        );
    }

    #[tokio::test]
    async fn test_mirror_matches_authoritative_state() {
        let provider = ScriptedProvider::new([Script::reply(
            ["Hel", "lo"],
            TokenUsage::new(10, 2),
        )]);
        let (dispatcher, mut observer) = dispatcher(provider);

        let op = dispatcher.send_message("greet me").unwrap();
        observer.until_finished(op, |_, _| {}).await;
        observer.drain();

        assert_eq!(observer.state(), &dispatcher.snapshot());
        assert_eq!(observer.state().conversation[1].content, "Hello");
    }

    #[tokio::test]
    async fn test_knowledge_intent_validates_collection() {
        let (dispatcher, _observer) = dispatcher(ScriptedProvider::default());
        assert_eq!(
            dispatcher.delete_collection("vs_1"),
            Err(DispatchError::UnknownCollection("vs_1".into()))
        );
        assert_eq!(
            dispatcher.create_collection("  "),
            Err(DispatchError::EmptyName)
        );
    }

    #[tokio::test]
    async fn test_create_collection_publishes_view() {
        let (dispatcher, mut observer) = dispatcher(ScriptedProvider::default());

        let op = dispatcher.create_collection("Reports").unwrap();
        let outcome = observer.until_finished(op, |_, _| {}).await;

        assert_eq!(outcome, Some(Outcome::Completed));
        let view = &observer.state().knowledge;
        assert_eq!(view.collections.len(), 1);
        assert!(view.resolve("Reports").is_some());
        assert!(observer.state().knowledge_channel.is_idle());
    }
}
