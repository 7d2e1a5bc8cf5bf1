//! The turn loop: stream a step, run the requested tools, repeat.

use std::sync::Arc;

use futures::StreamExt;
use tether_ai::{Message, StreamEvent};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::{
    approval::ApprovalGateway,
    context::{Compaction, CompactionConfig, CompactionReason, ContextManager},
    draft::DraftMessage,
    error::{Error, Result},
    events::{AgentEvent, TurnStatus},
    prompt::SystemPrompt,
    registry::{ToolRegistry, error_result},
    runs::{RunRegistry, RunSnapshot},
    store::{Attachment, ChatMessage, ConversationStore, ToolCallRecord, to_model_messages},
    tool::ToolResult,
    transport::{StreamRequest, Transport},
};

/// Round trips allowed in one turn
pub const DEFAULT_MAX_STEPS: u32 = 15;

/// Agent configuration
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// System prompt sections
    pub system_prompt: SystemPrompt,
    /// Maximum model/tool round trips per turn
    pub max_steps: u32,
    /// Maximum tokens per response
    pub max_tokens: Option<u32>,
    /// Context compaction configuration
    pub compaction: CompactionConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: SystemPrompt::default(),
            max_steps: DEFAULT_MAX_STEPS,
            max_tokens: None,
            compaction: CompactionConfig::default(),
        }
    }
}

/// How a turn ended, with the assistant message that was persisted
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Completed(ChatMessage),
    /// Stopped by the user; partial output is persisted if there was any
    Aborted(Option<ChatMessage>),
    Failed {
        message: Option<ChatMessage>,
        error: String,
    },
}

impl TurnOutcome {
    pub fn status(&self) -> TurnStatus {
        match self {
            TurnOutcome::Completed(_) => TurnStatus::Completed,
            TurnOutcome::Aborted(_) => TurnStatus::Aborted,
            TurnOutcome::Failed { .. } => TurnStatus::Failed,
        }
    }

    pub fn message(&self) -> Option<&ChatMessage> {
        match self {
            TurnOutcome::Completed(message) => Some(message),
            TurnOutcome::Aborted(message) | TurnOutcome::Failed { message, .. } => message.as_ref(),
        }
    }
}

enum Terminal {
    Completed,
    Aborted,
    Failed(Error),
}

enum StepEnd {
    Finished,
    Aborted,
    Failed(Error),
}

/// Runs conversational turns against a transport, a store and a tool set
pub struct AgentLoop {
    config: AgentConfig,
    transport: Arc<dyn Transport>,
    store: Arc<dyn ConversationStore>,
    tools: ToolRegistry,
    approvals: ApprovalGateway,
    context: ContextManager,
    runs: RunRegistry,
    event_tx: broadcast::Sender<AgentEvent>,
}

impl AgentLoop {
    /// Create a new agent loop
    pub fn new(
        config: AgentConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn ConversationStore>,
        tools: ToolRegistry,
        approvals: ApprovalGateway,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        let context = ContextManager::new(Arc::clone(&transport), config.compaction.clone());
        Self {
            config,
            transport,
            store,
            tools,
            approvals,
            context,
            runs: RunRegistry::new(),
            event_tx,
        }
    }

    /// Subscribe to agent events
    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.event_tx.subscribe()
    }

    /// Get the agent config
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// The gateway answering approval requests
    pub fn approvals(&self) -> &ApprovalGateway {
        &self.approvals
    }

    /// Loading flag, draft, error and pending approval of a conversation
    pub fn snapshot(&self, conversation_id: &str) -> RunSnapshot {
        let mut snapshot = self.runs.snapshot(conversation_id);
        snapshot.pending_approval = self
            .approvals
            .pending()
            .filter(|p| p.conversation_id == conversation_id);
        snapshot
    }

    /// Whether a turn is running for the conversation
    pub fn is_running(&self, conversation_id: &str) -> bool {
        self.runs.is_running(conversation_id)
    }

    /// Abort the running turn of one conversation
    pub fn stop(&self, conversation_id: &str) -> bool {
        let stopped = self.runs.stop(conversation_id);
        if stopped {
            tracing::info!(conversation_id, "Stop requested");
        }
        stopped
    }

    /// Forget the error shown for a conversation
    pub fn clear_error(&self, conversation_id: &str) {
        self.runs.clear_error(conversation_id);
    }

    /// Drop all run state of a conversation the caller is done with,
    /// stopping its turn if one is still running
    pub fn forget(&self, conversation_id: &str) {
        self.runs.remove(conversation_id);
    }

    fn emit(&self, event: AgentEvent) {
        let _ = self.event_tx.send(event);
    }

    fn publish_draft(&self, conversation_id: &str, run_id: u64, draft: &DraftMessage) {
        self.runs.update_draft(conversation_id, run_id, draft);
        self.emit(AgentEvent::DraftUpdated {
            conversation_id: conversation_id.to_string(),
            draft: draft.clone(),
        });
    }

    /// Run one turn.
    ///
    /// The user message is persisted before the model is called; the
    /// assistant message and its tool calls once the turn reaches a terminal
    /// state. Returns `Err` only when the user message could not be stored.
    pub async fn run_turn(
        &self,
        conversation_id: &str,
        user_content: &str,
        model: &str,
        attachments: Vec<Attachment>,
    ) -> Result<TurnOutcome> {
        let (run_id, cancel) = self.runs.begin(conversation_id);
        self.emit(AgentEvent::TurnStart {
            conversation_id: conversation_id.to_string(),
        });
        tracing::info!(conversation_id, model, "Turn started");

        let user_message = ChatMessage::user(conversation_id, user_content, attachments);
        if let Err(e) = self.store.create_message(&user_message).await {
            self.end_run(conversation_id, run_id, TurnStatus::Failed, Some(e.to_string()));
            return Err(e);
        }

        let mut draft = DraftMessage::new();
        let terminal = self
            .drive(conversation_id, run_id, model, &cancel, &mut draft)
            .await;

        let (mut status, mut error) = match terminal {
            Terminal::Completed => (TurnStatus::Completed, None),
            Terminal::Aborted => (TurnStatus::Aborted, None),
            Terminal::Failed(e) => (TurnStatus::Failed, Some(e.to_string())),
        };

        if status != TurnStatus::Completed {
            draft.cancel_pending();
        }

        let message = if status == TurnStatus::Completed || !draft.is_empty() {
            match self.persist(conversation_id, &draft).await {
                Ok(message) => Some(message),
                Err(e) => {
                    tracing::error!(conversation_id, "Failed to persist assistant message: {}", e);
                    status = TurnStatus::Failed;
                    error = Some(e.to_string());
                    None
                }
            }
        } else {
            None
        };

        self.end_run(conversation_id, run_id, status, error.clone());

        Ok(match (status, message) {
            (TurnStatus::Completed, Some(message)) => TurnOutcome::Completed(message),
            (TurnStatus::Aborted, message) => TurnOutcome::Aborted(message),
            (_, message) => TurnOutcome::Failed {
                message,
                error: error.unwrap_or_default(),
            },
        })
    }

    fn end_run(&self, conversation_id: &str, run_id: u64, status: TurnStatus, error: Option<String>) {
        match (&status, &error) {
            (TurnStatus::Failed, Some(e)) => tracing::warn!(conversation_id, "Turn failed: {}", e),
            _ => tracing::info!(conversation_id, ?status, "Turn ended"),
        }
        self.runs.finish(conversation_id, run_id, error.clone());
        self.emit(AgentEvent::TurnEnd {
            conversation_id: conversation_id.to_string(),
            status,
            error,
        });
    }

    async fn persist(&self, conversation_id: &str, draft: &DraftMessage) -> Result<ChatMessage> {
        let message = draft.to_chat_message(conversation_id);
        self.store.create_message(&message).await?;
        for call in &message.tool_calls {
            self.store.create_tool_call(&message.id, call).await?;
        }
        Ok(message)
    }

    async fn compact(
        &self,
        conversation_id: &str,
        model: &str,
        messages: &[Message],
        reason: CompactionReason,
        cancel: &CancellationToken,
    ) -> Result<Option<Compaction>> {
        self.emit(AgentEvent::CompactionStart {
            conversation_id: conversation_id.to_string(),
            reason,
        });
        let result = self
            .context
            .compact(model, messages, reason, cancel.clone())
            .await;
        if let Ok(Some(compaction)) = &result {
            self.emit(AgentEvent::CompactionEnd {
                conversation_id: conversation_id.to_string(),
                tokens_before: compaction.tokens_before,
                tokens_after: compaction.tokens_after,
            });
        }
        result
    }

    /// Core step loop
    async fn drive(
        &self,
        conversation_id: &str,
        run_id: u64,
        model: &str,
        cancel: &CancellationToken,
        draft: &mut DraftMessage,
    ) -> Terminal {
        let history = match self.store.get_messages(conversation_id).await {
            Ok(history) => history,
            Err(e) => return Terminal::Failed(e),
        };
        let mut messages = to_model_messages(&history);
        let mut system_prompt = self.config.system_prompt.clone();
        // At most one compaction per turn, proactive or reactive
        let mut compaction_attempted = false;

        if self
            .context
            .needs_compaction(model, &system_prompt.render(), &messages)
        {
            compaction_attempted = true;
            match self
                .compact(conversation_id, model, &messages, CompactionReason::Threshold, cancel)
                .await
            {
                Ok(Some(compaction)) => {
                    messages = compaction.kept;
                    system_prompt = system_prompt.with_summary(compaction.summary);
                }
                Ok(None) => {}
                Err(Error::Aborted) => return Terminal::Aborted,
                Err(e) => tracing::warn!(conversation_id, "Proactive compaction failed: {}", e),
            }
        }

        let tools = self.tools.definitions();
        let mut step = 0u32;

        while step < self.config.max_steps {
            step += 1;
            self.emit(AgentEvent::StepStart {
                conversation_id: conversation_id.to_string(),
                step,
            });

            let before_step = draft.clone();
            draft.begin_step();

            let request = StreamRequest {
                model: model.to_string(),
                system_prompt: Some(system_prompt.render()),
                messages: messages.clone(),
                tools: tools.clone(),
                max_tokens: self.config.max_tokens,
            };

            match self
                .stream_step(conversation_id, run_id, request, cancel, draft)
                .await
            {
                StepEnd::Finished => {}
                StepEnd::Aborted => return Terminal::Aborted,
                StepEnd::Failed(err) if err.is_context_overflow() && !compaction_attempted => {
                    compaction_attempted = true;
                    tracing::warn!(conversation_id, "Context overflow, compacting and retrying: {}", err);
                    *draft = before_step;
                    match self
                        .compact(conversation_id, model, &messages, CompactionReason::Overflow, cancel)
                        .await
                    {
                        Ok(Some(compaction)) => {
                            messages = compaction.kept;
                            system_prompt = system_prompt.with_summary(compaction.summary);
                            step -= 1;
                            continue;
                        }
                        Ok(None) => return Terminal::Failed(err),
                        Err(Error::Aborted) => return Terminal::Aborted,
                        Err(e) => {
                            tracing::warn!(conversation_id, "Emergency compaction failed: {}", e);
                            return Terminal::Failed(err);
                        }
                    }
                }
                StepEnd::Failed(err) => return Terminal::Failed(err),
            }

            let calls = draft.step_calls().to_vec();
            if calls.is_empty() {
                return Terminal::Completed;
            }
            messages.push(draft.step_message());

            // Sequential: the next step needs every result of this one
            let mut hand_back = false;
            for call in calls {
                let Some((result, ends_turn)) = self.run_tool_call(conversation_id, &call, cancel).await
                else {
                    return Terminal::Aborted;
                };

                draft.complete_call(&call.id, &result);
                self.publish_draft(conversation_id, run_id, draft);
                self.emit(AgentEvent::ToolExecutionEnd {
                    conversation_id: conversation_id.to_string(),
                    tool_call_id: call.id.clone(),
                    tool_name: call.tool_name.clone(),
                    result: result.payload.clone(),
                    is_error: result.is_error,
                });

                messages.push(Message::tool_result(
                    &call.id,
                    &call.tool_name,
                    result.to_model_text(),
                    result.is_error,
                ));
                hand_back |= ends_turn && !result.is_error;
            }

            if hand_back {
                tracing::debug!(conversation_id, "Tool handed control back to the user");
                return Terminal::Completed;
            }
        }

        tracing::warn!(
            conversation_id,
            max_steps = self.config.max_steps,
            "Step limit reached, ending turn"
        );
        Terminal::Completed
    }

    /// Stream one step into the draft
    async fn stream_step(
        &self,
        conversation_id: &str,
        run_id: u64,
        request: StreamRequest,
        cancel: &CancellationToken,
        draft: &mut DraftMessage,
    ) -> StepEnd {
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return StepEnd::Aborted,
            opened = self.transport.stream(request, cancel.clone()) => opened,
        };
        let mut events = match opened {
            Ok(events) => events,
            Err(Error::Aborted) => return StepEnd::Aborted,
            Err(_) if cancel.is_cancelled() => return StepEnd::Aborted,
            Err(e) => return StepEnd::Failed(e),
        };

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => return StepEnd::Aborted,
                event = events.next() => event,
            };

            match event {
                None => return StepEnd::Finished,
                Some(StreamEvent::Error { message }) => {
                    if cancel.is_cancelled() {
                        return StepEnd::Aborted;
                    }
                    return StepEnd::Failed(Error::from_stream_message(message));
                }
                Some(event @ StreamEvent::Finish { .. }) => {
                    draft.apply(&event);
                    return StepEnd::Finished;
                }
                Some(event) => {
                    if let StreamEvent::ToolCall { name, .. } = &event {
                        tracing::debug!(conversation_id, tool = %name, "Tool call requested");
                    }
                    if draft.apply(&event) {
                        self.publish_draft(conversation_id, run_id, draft);
                    }
                }
            }
        }
    }

    /// Prepare, approve and execute one call. `None` means the turn was
    /// cancelled before the call produced a result.
    async fn run_tool_call(
        &self,
        conversation_id: &str,
        call: &ToolCallRecord,
        cancel: &CancellationToken,
    ) -> Option<(ToolResult, bool)> {
        self.emit(AgentEvent::ToolExecutionStart {
            conversation_id: conversation_id.to_string(),
            tool_call_id: call.id.clone(),
            tool_name: call.tool_name.clone(),
            arguments: call.input.clone(),
        });

        let prepared = match self.tools.prepare(&call.tool_name, call.input.clone()) {
            Ok(prepared) => prepared,
            Err(e) => {
                tracing::debug!(tool = %call.tool_name, "Tool call rejected: {}", e);
                return Some((error_result(&e), false));
            }
        };

        let ticket = self.approvals.request_approval(
            conversation_id,
            &call.tool_name,
            prepared.arguments.clone(),
            prepared.tier(),
        );
        let ticket_id = ticket.id().map(str::to_string);
        if let Some(approval) = self
            .approvals
            .pending()
            .filter(|p| ticket_id.as_deref() == Some(p.id.as_str()))
        {
            self.emit(AgentEvent::ApprovalRequested {
                conversation_id: conversation_id.to_string(),
                approval,
            });
        }

        let approved = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                // Take the prompt down; nobody is waiting for the answer
                if let Some(id) = ticket_id {
                    self.approvals.deny(&id);
                }
                return None;
            }
            approved = ticket => approved,
        };
        if !approved {
            tracing::info!(tool = %call.tool_name, "Tool call not approved");
            return Some((error_result(&Error::ApprovalDenied(call.tool_name.clone())), false));
        }

        let ends_turn = prepared.tool.ends_turn();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            result = self.tools.execute(&prepared, &call.id, cancel.clone()) => result,
        };
        Some((result, ends_turn))
    }
}
