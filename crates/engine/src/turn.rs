//! Turn execution — the reason/approve/execute loop.
//!
//! Entry point: [`TurnEngine::run_turn`] spawns the loop and returns a
//! channel of [`ClientEvent`]s. Approval prompts are emitted one at a
//! time in model order; once every call in the turn has a verdict, the
//! approved ones execute concurrently behind one barrier, and the
//! results are fed back to the model. The loop is depth-bounded.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, Semaphore};
use tracing::Instrument;

use tb_domain::config::EngineSettings;
use tb_domain::event::ClientEvent;
use tb_domain::message::{ConversationMessage, ToolCallRecord, ToolCallState};
use tb_domain::model::{LanguageModel, ModelToolCall};
use tb_domain::tool::ToolDefinition;
use tb_domain::{Error, Result};
use tb_sessions::ConversationStore;

use crate::approval::ApprovalGate;
use crate::cancel::{CancelMap, CancelToken};
use crate::dispatch::{JobDispatcher, ToolJob};
use crate::executor::ToolExecutor;

/// Cap on tool output embedded into the follow-up prompt.
const RESULT_PROMPT_LIMIT: usize = 4000;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Engine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct TurnEngine {
    model: Arc<dyn LanguageModel>,
    executor: Arc<dyn ToolExecutor>,
    conversations: Arc<ConversationStore>,
    approvals: ApprovalGate,
    dispatcher: Option<Arc<JobDispatcher>>,
    cancellations: CancelMap,
    /// One permit per session: a session never runs two turns at once.
    turn_locks: parking_lot::Mutex<HashMap<String, Arc<Semaphore>>>,
    settings: EngineSettings,
}

pub struct TurnEngineBuilder {
    model: Arc<dyn LanguageModel>,
    executor: Arc<dyn ToolExecutor>,
    conversations: Arc<ConversationStore>,
    dispatcher: Option<Arc<JobDispatcher>>,
    settings: EngineSettings,
}

impl TurnEngineBuilder {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        executor: Arc<dyn ToolExecutor>,
        conversations: Arc<ConversationStore>,
    ) -> Self {
        Self {
            model,
            executor,
            conversations,
            dispatcher: None,
            settings: EngineSettings::default(),
        }
    }

    /// Route approved calls through the dispatch plane instead of
    /// executing them inline.
    pub fn dispatcher(mut self, dispatcher: Arc<JobDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn build(self) -> Arc<TurnEngine> {
        Arc::new(TurnEngine {
            model: self.model,
            executor: self.executor,
            conversations: self.conversations,
            approvals: ApprovalGate::new(),
            dispatcher: self.dispatcher,
            cancellations: CancelMap::new(),
            turn_locks: parking_lot::Mutex::new(HashMap::new()),
            settings: self.settings,
        })
    }
}

/// Outcome of one call after the approval/execution phase.
struct CallOutcome {
    record: ToolCallRecord,
    output: Value,
    executed: bool,
}

impl TurnEngine {
    /// Provider identifier of the backing model (for the `ready` event).
    pub fn provider(&self) -> &str {
        self.model.provider()
    }

    pub fn model_name(&self) -> &str {
        self.model.model()
    }

    /// The `ready` event announcing a bound session to its client.
    pub fn ready_event(&self, session_id: &str, sandbox_id: &str) -> ClientEvent {
        ClientEvent::Ready {
            session_id: session_id.to_owned(),
            sandbox_id: sandbox_id.to_owned(),
            provider: self.model.provider().to_owned(),
            model: self.model.model().to_owned(),
        }
    }

    /// Start one turn. Events stream out of the returned receiver; the
    /// channel closes when the turn ends.
    pub fn run_turn(self: &Arc<Self>, session_id: &str, user_text: String) -> mpsc::Receiver<ClientEvent> {
        let (tx, rx) = mpsc::channel(64);
        let engine = self.clone();
        let session_id = session_id.to_owned();

        let span = tracing::info_span!("turn", session_id = %session_id);
        tokio::spawn(
            async move {
                let lock = engine.turn_lock(&session_id);
                let _permit = match lock.try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        let _ = tx
                            .send(ClientEvent::Error {
                                code: "backpressure".into(),
                                message: "a turn is already in progress for this session".into(),
                            })
                            .await;
                        return;
                    }
                };

                let cancel = engine.cancellations.register(&session_id);
                let result = engine
                    .run_turn_inner(&session_id, &user_text, &tx, &cancel)
                    .await;
                engine.cancellations.remove(&session_id);

                match result {
                    Ok(()) => {}
                    Err(Error::Cancelled) => {
                        tracing::debug!("turn abandoned by cancellation");
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "turn failed");
                        let _ = tx
                            .send(ClientEvent::Error {
                                code: err.code().into(),
                                message: err.to_string(),
                            })
                            .await;
                    }
                }
            }
            .instrument(span),
        );

        rx
    }

    /// Deliver a user verdict for an outstanding call.
    pub fn resolve_approval(&self, call_id: &str, approved: bool) -> bool {
        self.approvals.resolve(call_id, approved)
    }

    /// Cancel the running turn for a session (client disconnect).
    pub fn cancel_session(&self, session_id: &str) -> bool {
        self.cancellations.cancel(session_id)
    }

    pub fn is_running(&self, session_id: &str) -> bool {
        self.cancellations.is_running(session_id)
    }

    /// Drop per-session state once the session is gone.
    pub fn cleanup(&self, session_id: &str) {
        self.cancellations.cancel(session_id);
        self.cancellations.remove(session_id);
        self.turn_locks.lock().remove(session_id);
    }

    fn turn_lock(&self, session_id: &str) -> Arc<Semaphore> {
        self.turn_locks
            .lock()
            .entry(session_id.to_owned())
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone()
    }

    // ── The loop ─────────────────────────────────────────────────

    async fn run_turn_inner(
        &self,
        session_id: &str,
        user_text: &str,
        tx: &mpsc::Sender<ClientEvent>,
        cancel: &CancelToken,
    ) -> Result<()> {
        self.conversations
            .append(session_id, &ConversationMessage::user(user_text))
            .await?;

        let catalog = self.executor.catalog().await;
        let tool_defs: Vec<ToolDefinition> = catalog.iter().map(ToolDefinition::from).collect();
        tracing::debug!(tools = tool_defs.len(), "turn context assembled");

        let mut prompt = user_text.to_owned();
        for depth in 0..self.settings.max_tool_loops {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let _ = tx.send(ClientEvent::Thinking).await;

            let history = self.conversations.window(session_id).await?;
            let turn = tokio::select! {
                turn = self.model.complete(&history, &prompt, &tool_defs) => turn?,
                _ = cancel.cancelled() => return Err(Error::Cancelled),
            };

            if turn.tool_calls.is_empty() {
                let text = turn.text.unwrap_or_default();
                self.conversations
                    .append(session_id, &ConversationMessage::model(&text))
                    .await?;
                let _ = tx.send(ClientEvent::Response { text }).await;
                return Ok(());
            }

            tracing::debug!(depth, calls = turn.tool_calls.len(), "model requested tools");
            let records = self.resolve_calls(&turn.tool_calls).await;

            // Record the model message, tool calls included, before
            // pausing for approval.
            let mut model_message =
                ConversationMessage::model(turn.text.clone().unwrap_or_default());
            model_message.tool_calls = Some(records.clone());
            self.conversations.append(session_id, &model_message).await?;

            let verdicts = self.gather_verdicts(&records, tx, cancel).await?;
            let outcomes = self
                .execute_calls(session_id, records, &verdicts, cancel)
                .await?;
            if cancel.is_cancelled() {
                // Results that raced the cancellation are discarded.
                return Err(Error::Cancelled);
            }

            for outcome in &outcomes {
                if outcome.executed {
                    let _ = tx
                        .send(ClientEvent::ToolOutput {
                            call_id: outcome.record.call_id.clone(),
                            output: outcome.output.clone(),
                        })
                        .await;
                }
                self.conversations
                    .append(
                        session_id,
                        &ConversationMessage::tool(outcome.record.clone(), outcome.output.clone()),
                    )
                    .await?;
            }

            prompt = results_prompt(&outcomes);
        }

        tracing::warn!(limit = self.settings.max_tool_loops, "tool loop limit reached");
        let _ = tx
            .send(ClientEvent::Error {
                code: "loop_limit".into(),
                message: format!(
                    "tool loop limit reached ({} iterations)",
                    self.settings.max_tool_loops
                ),
            })
            .await;
        Ok(())
    }

    /// Resolve model calls to `(server, original)` records. Calls naming
    /// a tool no server owns become pre-failed records that skip the
    /// approval queue.
    async fn resolve_calls(&self, calls: &[ModelToolCall]) -> Vec<ToolCallRecord> {
        let mut records = Vec::with_capacity(calls.len());
        for call in calls {
            match self.executor.resolve(&call.name).await {
                Some((server_name, original_name)) => {
                    records.push(ToolCallRecord::new(
                        &call.call_id,
                        server_name,
                        original_name,
                        call.args.clone(),
                    ));
                }
                None => {
                    tracing::warn!(tool = %call.name, "model requested unknown tool");
                    let mut record =
                        ToolCallRecord::new(&call.call_id, "", &call.name, call.args.clone());
                    record.state = ToolCallState::Failed;
                    records.push(record);
                }
            }
        }
        records
    }

    /// Emit approval prompts one at a time, in model order, and collect
    /// verdicts keyed by call id. Pre-failed records get no prompt.
    async fn gather_verdicts(
        &self,
        records: &[ToolCallRecord],
        tx: &mpsc::Sender<ClientEvent>,
        cancel: &CancelToken,
    ) -> Result<HashMap<String, bool>> {
        let approvable: Vec<&ToolCallRecord> = records
            .iter()
            .filter(|record| record.state == ToolCallState::PendingApproval)
            .collect();
        let total = approvable.len();

        let mut verdicts = HashMap::new();
        for (idx, record) in approvable.into_iter().enumerate() {
            let _ = tx
                .send(ClientEvent::ApprovalRequired {
                    call_id: record.call_id.clone(),
                    server_name: record.server_name.clone(),
                    tool_name: record.original_name.clone(),
                    args: record.args.clone(),
                    position: idx + 1,
                    total,
                })
                .await;

            let receiver = self.approvals.register(&record.call_id);
            let approved = tokio::select! {
                verdict = receiver => verdict.unwrap_or(false),
                _ = cancel.cancelled() => {
                    self.approvals.abandon(&record.call_id);
                    return Err(Error::Cancelled);
                }
            };
            tracing::debug!(call_id = %record.call_id, approved, "approval verdict received");
            verdicts.insert(record.call_id.clone(), approved);
        }
        Ok(verdicts)
    }

    /// Execute every approved call concurrently (one barrier), convert
    /// rejections and failures to synthetic results, and preserve the
    /// model's call order.
    async fn execute_calls(
        &self,
        session_id: &str,
        records: Vec<ToolCallRecord>,
        verdicts: &HashMap<String, bool>,
        cancel: &CancelToken,
    ) -> Result<Vec<CallOutcome>> {
        // Partition while remembering each record's original position.
        let mut outcomes: Vec<Option<CallOutcome>> = Vec::with_capacity(records.len());
        let mut to_execute: Vec<(usize, ToolCallRecord)> = Vec::new();

        for (idx, mut record) in records.into_iter().enumerate() {
            if record.state == ToolCallState::Failed {
                outcomes.push(Some(CallOutcome {
                    output: serde_json::json!({
                        "error": format!("no server owns tool {:?}", record.original_name)
                    }),
                    record,
                    executed: false,
                }));
                continue;
            }
            if verdicts.get(&record.call_id).copied().unwrap_or(false) {
                record.state = ToolCallState::Approved;
                outcomes.push(None);
                to_execute.push((idx, record));
            } else {
                record.state = ToolCallState::Rejected;
                outcomes.push(Some(CallOutcome {
                    output: serde_json::json!({ "denied": "denied by user" }),
                    record,
                    executed: false,
                }));
            }
        }

        let executed = match &self.dispatcher {
            Some(dispatcher) => {
                self.execute_via_dispatch(session_id, dispatcher, &to_execute, cancel)
                    .await?
            }
            None => self.execute_inline(&to_execute).await,
        };

        for ((idx, record), (output, is_error)) in to_execute.into_iter().zip(executed) {
            let mut record = record;
            record.state = if is_error {
                ToolCallState::Failed
            } else {
                ToolCallState::Done
            };
            outcomes[idx] = Some(CallOutcome {
                record,
                output,
                executed: true,
            });
        }

        Ok(outcomes.into_iter().flatten().collect())
    }

    /// Inline execution: all approved calls run concurrently and join at
    /// one barrier. A failing tool becomes a failure payload, not a turn
    /// failure.
    async fn execute_inline(&self, calls: &[(usize, ToolCallRecord)]) -> Vec<(Value, bool)> {
        let futures: Vec<_> = calls
            .iter()
            .map(|(_, record)| {
                let executor = self.executor.clone();
                async move {
                    match executor
                        .call(&record.server_name, &record.original_name, record.args.clone())
                        .await
                    {
                        Ok(result) => {
                            let is_error = result.is_error;
                            let output = serde_json::to_value(&result)
                                .unwrap_or_else(|_| Value::Null);
                            (output, is_error)
                        }
                        Err(err) => (serde_json::json!({ "error": err.to_string() }), true),
                    }
                }
            })
            .collect();
        futures_util::future::join_all(futures).await
    }

    /// Worker-mode execution: enqueue jobs, await the per-session result
    /// channel.
    async fn execute_via_dispatch(
        &self,
        session_id: &str,
        dispatcher: &JobDispatcher,
        calls: &[(usize, ToolCallRecord)],
        cancel: &CancelToken,
    ) -> Result<Vec<(Value, bool)>> {
        let jobs: Vec<ToolJob> = calls
            .iter()
            .map(|(_, record)| {
                ToolJob::new(
                    session_id,
                    &record.call_id,
                    &record.server_name,
                    &record.original_name,
                    record.args.clone(),
                )
            })
            .collect();

        let results = dispatcher.execute_batch(session_id, jobs, cancel).await?;
        Ok(results
            .into_iter()
            .map(|result| {
                if result.success {
                    (result.output.unwrap_or(Value::Null), false)
                } else {
                    (
                        serde_json::json!({
                            "error": result.error.unwrap_or_else(|| "tool job failed".into())
                        }),
                        true,
                    )
                }
            })
            .collect())
    }
}

/// Frame all results as the next prompt for the model.
fn results_prompt(outcomes: &[CallOutcome]) -> String {
    let mut prompt = String::from(
        "The requested tool calls have completed. Results, in order:\n",
    );
    for outcome in outcomes {
        let status = match outcome.record.state {
            ToolCallState::Done => "ok",
            ToolCallState::Rejected => "denied by user",
            _ => "failed",
        };
        let payload = serde_json::to_string(&outcome.output).unwrap_or_default();
        prompt.push_str(&format!(
            "- {} [{}]: {}\n",
            outcome.record.original_name,
            status,
            truncate(&payload, RESULT_PROMPT_LIMIT)
        ));
    }
    prompt.push_str("Respond to the user based on these results.");
    prompt
}

fn truncate(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_owned();
    }
    let mut cut = limit;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…", &text[..cut])
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
