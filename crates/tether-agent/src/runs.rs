//! Per-conversation run state.
//!
//! One run per conversation id at a time: beginning a run for an id that is
//! already running cancels the older run. Every run gets an id so a
//! superseded run finishing late cannot overwrite its successor's state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::approval::PendingApproval;
use crate::draft::DraftMessage;

struct RunState {
    run_id: u64,
    is_loading: bool,
    draft: Option<DraftMessage>,
    error: Option<String>,
    cancel: CancellationToken,
}

/// What an observer sees for one conversation
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSnapshot {
    pub is_loading: bool,
    pub draft: Option<DraftMessage>,
    pub error: Option<String>,
    pub pending_approval: Option<PendingApproval>,
}

/// Registry of conversation runs
#[derive(Default)]
pub struct RunRegistry {
    runs: Mutex<HashMap<String, RunState>>,
    next_run_id: AtomicU64,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a run, cancelling any run already active for the conversation
    pub fn begin(&self, conversation_id: &str) -> (u64, CancellationToken) {
        let run_id = self.next_run_id.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = CancellationToken::new();

        let previous = self.runs.lock().insert(
            conversation_id.to_string(),
            RunState {
                run_id,
                is_loading: true,
                draft: None,
                error: None,
                cancel: cancel.clone(),
            },
        );
        if let Some(previous) = previous.filter(|p| p.is_loading) {
            tracing::warn!(conversation_id, "Superseding active run");
            previous.cancel.cancel();
        }

        (run_id, cancel)
    }

    /// Publish the current draft of a run
    pub fn update_draft(&self, conversation_id: &str, run_id: u64, draft: &DraftMessage) {
        if let Some(state) = self.runs.lock().get_mut(conversation_id) {
            if state.run_id == run_id {
                state.draft = Some(draft.clone());
            }
        }
    }

    /// Mark a run finished. Ignored if a newer run has replaced it. A clean
    /// finish drops the entry; a failed one keeps its error for observers.
    pub fn finish(&self, conversation_id: &str, run_id: u64, error: Option<String>) {
        let mut runs = self.runs.lock();
        let Some(state) = runs.get_mut(conversation_id).filter(|s| s.run_id == run_id) else {
            return;
        };
        match error {
            Some(error) => {
                state.is_loading = false;
                state.draft = None;
                state.error = Some(error);
            }
            None => {
                runs.remove(conversation_id);
            }
        }
    }

    /// Forget a conversation, cancelling its run if one is active
    pub fn remove(&self, conversation_id: &str) {
        if let Some(state) = self.runs.lock().remove(conversation_id) {
            state.cancel.cancel();
        }
    }

    /// Cancel the active run of a conversation. Returns whether one was running.
    pub fn stop(&self, conversation_id: &str) -> bool {
        match self.runs.lock().get(conversation_id) {
            Some(state) if state.is_loading => {
                state.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    pub fn is_running(&self, conversation_id: &str) -> bool {
        self.runs
            .lock()
            .get(conversation_id)
            .is_some_and(|state| state.is_loading)
    }

    /// Clear a stored error, e.g. after the UI displayed it
    pub fn clear_error(&self, conversation_id: &str) {
        let mut runs = self.runs.lock();
        let idle = match runs.get_mut(conversation_id) {
            Some(state) => {
                state.error = None;
                !state.is_loading
            }
            None => false,
        };
        if idle {
            runs.remove(conversation_id);
        }
    }

    /// Loading flag, draft and error of a conversation
    pub fn snapshot(&self, conversation_id: &str) -> RunSnapshot {
        self.runs
            .lock()
            .get(conversation_id)
            .map(|state| RunSnapshot {
                is_loading: state.is_loading,
                draft: state.draft.clone(),
                error: state.error.clone(),
                pending_approval: None,
            })
            .unwrap_or_default()
    }
}
