//! Human approval gate for risk-tiered tool calls.
//!
//! At most one approval is pending at a time. A new request supersedes (and
//! denies) the previous one, every request is denied after a fixed timeout,
//! and a tier can be allowed for the rest of the session.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::tool::RiskTier;

/// How long a request waits for a human before it is denied
pub const DEFAULT_APPROVAL_TIMEOUT: Duration = Duration::from_secs(60);

/// The single decision currently shown to the user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingApproval {
    pub id: String,
    /// Conversation whose turn asked; informational only
    pub conversation_id: String,
    pub tool_name: String,
    pub arguments: Value,
    pub tier: RiskTier,
}

struct PendingSlot {
    approval: PendingApproval,
    responder: oneshot::Sender<bool>,
    timer: Option<JoinHandle<()>>,
}

impl PendingSlot {
    fn resolve(self, approved: bool) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        // The requester may have given up already
        let _ = self.responder.send(approved);
    }
}

#[derive(Default)]
struct GatewayState {
    pending: Option<PendingSlot>,
    session: HashSet<RiskTier>,
}

struct Inner {
    state: Mutex<GatewayState>,
    timeout: Duration,
    pending_tx: watch::Sender<Option<PendingApproval>>,
}

impl Inner {
    /// Remove the pending slot if `matches` accepts it, publishing the change
    fn take_pending_if(&self, matches: impl FnOnce(&PendingApproval) -> bool) -> Option<PendingSlot> {
        let mut state = self.state.lock();
        if !state.pending.as_ref().is_some_and(|slot| matches(&slot.approval)) {
            return None;
        }
        let slot = state.pending.take();
        self.pending_tx.send_replace(None);
        slot
    }

    fn expire(&self, id: &str) {
        if let Some(slot) = self.take_pending_if(|p| p.id == id) {
            tracing::warn!(
                tool = %slot.approval.tool_name,
                id = %id,
                "Approval timed out after {:?}, denying",
                self.timeout
            );
            slot.resolve(false);
        }
    }
}

/// Cloneable handle to the process-wide approval state
#[derive(Clone)]
pub struct ApprovalGateway {
    inner: Arc<Inner>,
}

impl Default for ApprovalGateway {
    fn default() -> Self {
        Self::new(DEFAULT_APPROVAL_TIMEOUT)
    }
}

impl std::fmt::Debug for ApprovalGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApprovalGateway")
            .field("timeout", &self.inner.timeout)
            .field("pending", &self.pending())
            .finish()
    }
}

impl ApprovalGateway {
    /// Create a gateway whose requests expire after `timeout`
    pub fn new(timeout: Duration) -> Self {
        let (pending_tx, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(GatewayState::default()),
                timeout,
                pending_tx,
            }),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// Ask for permission to run a tool call.
    ///
    /// The state change happens before this returns; the returned ticket
    /// resolves to the decision. Must be called inside a tokio runtime when
    /// a prompt is actually needed, since the timeout runs as a task.
    pub fn request_approval(
        &self,
        conversation_id: &str,
        tool_name: &str,
        arguments: Value,
        tier: RiskTier,
    ) -> ApprovalTicket {
        if !tier.requires_approval() {
            return ApprovalTicket::immediate(true);
        }

        let mut state = self.inner.state.lock();
        if state.session.contains(&tier) {
            tracing::debug!(tool = tool_name, tier = tier.as_str(), "Tier allowed for session");
            return ApprovalTicket::immediate(true);
        }

        if let Some(previous) = state.pending.take() {
            tracing::warn!(
                superseded = %previous.approval.tool_name,
                by = tool_name,
                "Superseding pending approval"
            );
            previous.resolve(false);
        }

        let approval = PendingApproval {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            tool_name: tool_name.to_string(),
            arguments,
            tier,
        };
        let (responder, receiver) = oneshot::channel();

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let timer_id = approval.id.clone();
        let timeout = self.inner.timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                inner.expire(&timer_id);
            }
        });

        tracing::info!(tool = tool_name, tier = tier.as_str(), id = %approval.id, "Approval requested");
        let id = approval.id.clone();
        self.inner.pending_tx.send_replace(Some(approval.clone()));
        state.pending = Some(PendingSlot {
            approval,
            responder,
            timer: Some(timer),
        });

        ApprovalTicket {
            id: Some(id),
            decision: Decision::Waiting(receiver),
        }
    }

    /// Approve the pending request. Returns false if `id` is not current.
    pub fn approve(&self, id: &str) -> bool {
        self.resolve(id, true)
    }

    /// Deny the pending request. Returns false if `id` is not current.
    pub fn deny(&self, id: &str) -> bool {
        self.resolve(id, false)
    }

    fn resolve(&self, id: &str, approved: bool) -> bool {
        match self.inner.take_pending_if(|p| p.id == id) {
            Some(slot) => {
                tracing::info!(tool = %slot.approval.tool_name, approved, "Approval resolved");
                slot.resolve(approved);
                true
            }
            None => {
                tracing::debug!(id, "Ignoring decision for stale approval");
                false
            }
        }
    }

    /// Allow every request of `tier` until `clear_session`; a pending request
    /// of the same tier is approved
    pub fn allow_all_for_session(&self, tier: RiskTier) {
        self.inner.state.lock().session.insert(tier);
        if let Some(slot) = self.inner.take_pending_if(|p| p.tier == tier) {
            slot.resolve(true);
        }
    }

    /// Forget every session allowance
    pub fn clear_session(&self) {
        self.inner.state.lock().session.clear();
    }

    pub fn is_session_allowed(&self, tier: RiskTier) -> bool {
        self.inner.state.lock().session.contains(&tier)
    }

    /// The request currently waiting for a decision
    pub fn pending(&self) -> Option<PendingApproval> {
        self.inner
            .state
            .lock()
            .pending
            .as_ref()
            .map(|slot| slot.approval.clone())
    }

    /// Watch the pending request as it changes
    pub fn subscribe(&self) -> watch::Receiver<Option<PendingApproval>> {
        self.inner.pending_tx.subscribe()
    }
}

enum Decision {
    Immediate(bool),
    Waiting(oneshot::Receiver<bool>),
}

/// Future resolving to the approval decision
pub struct ApprovalTicket {
    id: Option<String>,
    decision: Decision,
}

impl ApprovalTicket {
    fn immediate(approved: bool) -> Self {
        Self {
            id: None,
            decision: Decision::Immediate(approved),
        }
    }

    /// Id of the pending approval, or `None` if no prompt was needed
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }
}

impl Future for ApprovalTicket {
    type Output = bool;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<bool> {
        match &mut self.get_mut().decision {
            Decision::Immediate(approved) => Poll::Ready(*approved),
            // A dropped responder means the gateway went away
            Decision::Waiting(rx) => Pin::new(rx).poll(cx).map(|r| r.unwrap_or(false)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::time::Instant;

    fn request(gateway: &ApprovalGateway, tool: &str, tier: RiskTier) -> ApprovalTicket {
        gateway.request_approval("conv-1", tool, json!({"command": "rm tempfile"}), tier)
    }

    #[tokio::test]
    async fn test_unclassified_never_prompts() {
        let gateway = ApprovalGateway::default();
        let ticket = request(&gateway, "read_file", RiskTier::Unclassified);
        assert!(ticket.id().is_none());
        assert!(gateway.pending().is_none());
        assert!(ticket.await);
    }

    #[tokio::test]
    async fn test_approve_matching_id() {
        let gateway = ApprovalGateway::default();
        let ticket = request(&gateway, "bash", RiskTier::Dangerous);
        let id = ticket.id().unwrap().to_string();
        assert_eq!(gateway.pending().unwrap().id, id);

        assert!(gateway.approve(&id));
        assert!(ticket.await);
        assert!(gateway.pending().is_none());
    }

    #[tokio::test]
    async fn test_stale_id_is_noop() {
        let gateway = ApprovalGateway::default();
        let ticket = request(&gateway, "bash", RiskTier::Dangerous);
        assert!(!gateway.approve("not-the-id"));
        assert!(!gateway.deny("not-the-id"));
        assert!(gateway.pending().is_some());

        let id = ticket.id().unwrap().to_string();
        assert!(gateway.deny(&id));
        assert!(!ticket.await);
        // second decision for the same id does nothing
        assert!(!gateway.approve(&id));
    }

    #[tokio::test]
    async fn test_second_request_supersedes_first() {
        let gateway = ApprovalGateway::default();
        let first = request(&gateway, "bash", RiskTier::Dangerous);
        let first_id = first.id().unwrap().to_string();
        let second = request(&gateway, "browser_click", RiskTier::Moderate);

        // first is already resolved false before the second is visible
        assert!(!first.await);
        let pending = gateway.pending().unwrap();
        assert_eq!(pending.tool_name, "browser_click");
        assert_ne!(pending.id, first_id);
        assert!(!gateway.approve(&first_id));

        assert!(gateway.approve(second.id().unwrap()));
        assert!(second.await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_denies_after_exactly_timeout() {
        let gateway = ApprovalGateway::default();
        let start = Instant::now();
        let mut ticket = request(&gateway, "bash", RiskTier::Dangerous);

        let early = tokio::time::timeout(Duration::from_secs(59), &mut ticket).await;
        assert!(early.is_err());
        assert!(gateway.pending().is_some());

        assert!(!ticket.await);
        assert_eq!(start.elapsed(), DEFAULT_APPROVAL_TIMEOUT);
        assert!(gateway.pending().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolved_request_is_not_touched_by_timer() {
        let gateway = ApprovalGateway::new(Duration::from_secs(5));
        let first = request(&gateway, "bash", RiskTier::Dangerous);
        assert!(gateway.approve(first.id().unwrap()));
        assert!(first.await);

        tokio::time::sleep(Duration::from_secs(3)).await;
        let second = request(&gateway, "bash", RiskTier::Dangerous);
        // the first request's deadline passes while the second is pending
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(gateway.pending().map(|p| p.id), second.id().map(String::from));
    }

    #[tokio::test]
    async fn test_allow_all_for_session() {
        let gateway = ApprovalGateway::default();
        let pending = request(&gateway, "bash", RiskTier::Dangerous);
        gateway.allow_all_for_session(RiskTier::Dangerous);
        assert!(pending.await);
        assert!(gateway.pending().is_none());

        let next = request(&gateway, "bash", RiskTier::Dangerous);
        assert!(next.id().is_none());
        assert!(gateway.pending().is_none());
        assert!(next.await);

        // other tiers still ask
        let moderate = request(&gateway, "browser_click", RiskTier::Moderate);
        assert!(moderate.id().is_some());

        gateway.clear_session();
        assert!(!gateway.is_session_allowed(RiskTier::Dangerous));
        let after_clear = request(&gateway, "bash", RiskTier::Dangerous);
        assert!(after_clear.id().is_some());
    }

    #[tokio::test]
    async fn test_allow_other_tier_leaves_pending() {
        let gateway = ApprovalGateway::default();
        let ticket = request(&gateway, "bash", RiskTier::Dangerous);
        gateway.allow_all_for_session(RiskTier::Moderate);
        assert_eq!(gateway.pending().unwrap().id, ticket.id().unwrap());
    }

    #[tokio::test]
    async fn test_watch_publishes_pending() {
        let gateway = ApprovalGateway::default();
        let mut rx = gateway.subscribe();
        assert!(rx.borrow().is_none());

        let ticket = request(&gateway, "bash", RiskTier::Dangerous);
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().as_ref().unwrap().tool_name, "bash");

        gateway.deny(ticket.id().unwrap());
        rx.changed().await.unwrap();
        assert!(rx.borrow().is_none());
    }
}
