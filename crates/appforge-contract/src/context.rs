//! Scoped agent context.
//!
//! Binds `{session, workspace, stores}` into a single value that tools and
//! middleware resolve via [`current_context`]. The primary mechanism is a
//! tokio task-local that follows the logical execution; a guarded
//! process-wide cell serves as fallback for threads created outside the task
//! tree (LLM client libraries commonly run callbacks on their own worker
//! threads). One run per process keeps the fallback unambiguous.

use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::storage::{EventStore, MessageStore};

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("agent context not set; wrap the call in with_context or install a fallback")]
    NotSet,
}

/// Runtime binding of a single agent execution.
#[derive(Clone)]
pub struct AgentContext {
    pub session_id: String,
    pub workspace_id: String,
    pub workspace_path: PathBuf,
    pub events: Arc<dyn EventStore>,
    pub messages: Arc<dyn MessageStore>,
    pub trace_id: Option<String>,
    /// Base URL of the gateway for protocol-peer tool callbacks.
    pub api_base: Option<String>,
    /// `X-API-Key` used for those callbacks (equals the session id).
    pub api_key: Option<String>,
}

impl std::fmt::Debug for AgentContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentContext")
            .field("session_id", &self.session_id)
            .field("workspace_id", &self.workspace_id)
            .field("workspace_path", &self.workspace_path)
            .field("trace_id", &self.trace_id)
            .finish_non_exhaustive()
    }
}

tokio::task_local! {
    static CURRENT: Arc<AgentContext>;
}

static GLOBAL_FALLBACK: Mutex<Option<Arc<AgentContext>>> = Mutex::new(None);

/// Run `fut` with `ctx` as the current context. The previous value is
/// restored on return; concurrent sibling scopes do not observe each other.
pub async fn with_context<F>(ctx: Arc<AgentContext>, fut: F) -> F::Output
where
    F: Future,
{
    CURRENT.scope(ctx, fut).await
}

/// Install the process-wide fallback so unparented threads still resolve a
/// context. Call [`clear_global_fallback`] when the run ends.
pub fn install_global_fallback(ctx: Arc<AgentContext>) {
    *GLOBAL_FALLBACK.lock().expect("context fallback poisoned") = Some(ctx);
}

pub fn clear_global_fallback() {
    *GLOBAL_FALLBACK.lock().expect("context fallback poisoned") = None;
}

/// Resolve the current context: task-local first, then the global fallback.
pub fn current_context() -> Result<Arc<AgentContext>, ContextError> {
    if let Ok(ctx) = CURRENT.try_with(|c| c.clone()) {
        return Ok(ctx);
    }
    GLOBAL_FALLBACK
        .lock()
        .expect("context fallback poisoned")
        .clone()
        .ok_or(ContextError::NotSet)
}
