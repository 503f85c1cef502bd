//! Public session engine: the session arena and the request/response API.
//!
//! Sessions live in an owned table addressed by project id. A generation
//! holds a temporary exclusive lease on one entry (`generation_state !=
//! Idle`) rather than a lock; a second start for the same project fails fast
//! instead of queuing. Across projects, operations are fully independent.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::Config;
use crate::core::agent;
use crate::core::events::{EventBus, EventRx, SessionEvent};
use crate::error::EngineError;
use crate::providers::{ChatTransport, HttpChatTransport, ProviderRegistry};
use crate::session::store::{FileMessageStore, MessageStore};
use crate::session::{GenerationState, Message, Session};
use crate::tools::ToolMap;

/// Session and generation engine.
///
/// One instance serves every project; callers share it behind an `Arc`.
pub struct SessionEngine {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    registry: ProviderRegistry,
    config: Config,
    store: Arc<dyn MessageStore>,
    transport: Arc<dyn ChatTransport>,
    events: EventBus,
}

impl SessionEngine {
    pub fn new(
        config: Config,
        store: Arc<dyn MessageStore>,
        transport: Arc<dyn ChatTransport>,
    ) -> Self {
        let registry = ProviderRegistry::new(config.providers.clone());
        Self {
            sessions: Mutex::new(HashMap::new()),
            registry,
            config,
            store,
            transport,
            events: EventBus::new(),
        }
    }

    /// Engine wired to the default file store and HTTP transport.
    pub fn with_defaults(config: Config) -> Self {
        let store = Arc::new(FileMessageStore::new(crate::config::paths::sessions_dir()));
        Self::new(config, store, Arc::new(HttpChatTransport::new()))
    }

    /// Returns the session for a project, creating and restoring it on first
    /// use.
    ///
    /// The tool maps only apply to a newly constructed session; on a cache
    /// hit they are ignored, since session identity is keyed by project id
    /// alone. The arena lock is held across the restore so concurrent first
    /// calls converge on a single session.
    pub async fn load_session(
        &self,
        project_id: &str,
        tools: ToolMap,
        custom_tools: ToolMap,
    ) -> Arc<Session> {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(project_id) {
            return Arc::clone(session);
        }

        let messages = match self.store.load(project_id).await {
            Ok(Some(messages)) => messages,
            Ok(None) => Vec::new(),
            Err(err) => {
                warn!(
                    project_id,
                    error = %err,
                    "failed to restore session history; starting empty"
                );
                Vec::new()
            }
        };

        debug!(project_id, restored = messages.len(), "session loaded");
        let session = Arc::new(Session::new(project_id, tools, custom_tools, messages));
        sessions.insert(project_id.to_string(), Arc::clone(&session));
        session
    }

    /// Pure lookup; never constructs a session.
    pub async fn get_session(&self, project_id: &str) -> Option<Arc<Session>> {
        self.sessions.lock().await.get(project_id).map(Arc::clone)
    }

    /// Attaches an ordered event subscriber for one project.
    pub fn subscribe(&self, project_id: &str) -> EventRx {
        self.events.subscribe(project_id)
    }

    /// Appends a caller-supplied message to the project's conversation,
    /// loading the session (with empty tool sets) if needed.
    ///
    /// The in-memory append always succeeds; persistence runs in the
    /// background and is advisory.
    pub async fn add_message(&self, project_id: &str, message: Message) {
        let session = self
            .load_session(project_id, ToolMap::new(), ToolMap::new())
            .await;
        self.append_message(&session, message).await;
    }

    /// Runs one generation for the project to completion.
    ///
    /// `provider_model_id` has the form `"providerId/modelId"`. The future
    /// resolves with the final assistant message once the agent loop exits;
    /// callers typically spawn it and watch events.
    ///
    /// # Errors
    /// Resolution and in-progress failures are returned before the
    /// conversation is touched; transport failures, the iteration cap, and
    /// cancellation surface after the loop stops, with the session back at
    /// Idle.
    pub async fn start_generation(
        &self,
        project_id: &str,
        provider_model_id: &str,
    ) -> Result<Message, EngineError> {
        let session = self
            .load_session(project_id, ToolMap::new(), ToolMap::new())
            .await;

        // Guard first, then resolve: both happen before any mutation.
        if session.generation_state() != GenerationState::Idle {
            return Err(EngineError::GenerationInProgress(project_id.to_string()));
        }
        let (provider, model) = {
            let resolved = self.registry.resolve(provider_model_id)?;
            (resolved.provider.clone(), resolved.model)
        };

        let cancel = CancellationToken::new();
        session.try_begin_generation(cancel.clone())?;
        debug!(project_id, model = %model, "generation claimed");

        agent::run_generation(self, &session, &provider, &model, cancel).await
    }

    /// Cancels the project's running generation.
    ///
    /// # Errors
    /// `NoActiveGeneration` when the project is unknown or idle.
    pub async fn cancel_generation(&self, project_id: &str) -> Result<(), EngineError> {
        let session = self
            .get_session(project_id)
            .await
            .ok_or_else(|| EngineError::NoActiveGeneration(project_id.to_string()))?;
        if session.request_cancel() {
            Ok(())
        } else {
            Err(EngineError::NoActiveGeneration(project_id.to_string()))
        }
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn events(&self) -> &EventBus {
        &self.events
    }

    pub(crate) fn transport(&self) -> &dyn ChatTransport {
        self.transport.as_ref()
    }

    /// Appends to the in-memory conversation, kicks off a background persist,
    /// and notifies subscribers.
    pub(crate) async fn append_message(&self, session: &Arc<Session>, message: Message) {
        session.push_message(message.clone());
        self.spawn_persist(session);
        self.events
            .send(SessionEvent::MessageAdded {
                project_id: session.project_id().to_string(),
                message,
            })
            .await;
    }

    fn spawn_persist(&self, session: &Arc<Session>) {
        let store = Arc::clone(&self.store);
        let session = Arc::clone(session);
        tokio::spawn(async move {
            // Writes serialize per session, and the snapshot is taken after
            // the lock is held, so the last completed write always carries
            // the newest state even when earlier tasks finish late.
            let _guard = session.persist_lock().lock().await;
            let messages = session.messages();
            if let Err(err) = store.save(session.project_id(), &messages).await {
                warn!(
                    project_id = session.project_id(),
                    error = %err,
                    "failed to persist session messages"
                );
            }
        });
    }
}
