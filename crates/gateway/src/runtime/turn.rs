//! Turn execution loop — the inner orchestrator that streams LLM
//! responses, dispatches tool calls, and tracks run state.
//!
//! Entry point: [`run_turn`] spawns the async loop and returns a
//! channel of [`TurnEvent`]s.
//!
//! The loop follows the seven-phase turn lifecycle: attachment
//! validation, intent routing (narrowing the injected skill index),
//! context assembly, pre-turn state snapshot, the tool-call loop itself
//! (long-running/dangerous-op/cost-gate HITL plus backtrack-driven
//! control flow), and final cleanup (discard the snapshot on success,
//! keep it around for rollback otherwise).

use std::collections::HashSet;
use std::sync::Arc;

use futures_util::StreamExt;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::Instrument;

use sa_domain::error::Error as DomainError;
use sa_domain::stream::{StreamEvent, Usage};
use sa_domain::tool::{Message, ToolCall, ToolDefinition};
use sa_providers::LlmProvider;

use crate::state::AppState;

use super::agent;
use super::backtrack::{BacktrackDecision, BacktrackType};
use super::cancel::CancelToken;
use super::compact;
use super::guardrails::{Complexity, Tier};
use super::runs;
use super::session_engine::SessionStatus;
use super::snapshot::{self, StateManager, StateSnapshot};
use super::tools;
use super::{
    build_assistant_tool_message, build_system_context, fire_auto_capture, load_raw_transcript,
    persist_transcript, resolve_provider, resolve_summarizer, transcript_lines_to_messages,
    truncate_str,
};

/// Maximum number of tool-call loops before we force-stop.
const MAX_TOOL_LOOPS: usize = 25;

/// Long-running-turn HITL threshold: once a turn's tool loop crosses this
/// many iterations we ask the human whether to keep going, mirroring the
/// `long_running` confirmation kind in `session_engine`.
const LONG_RUNNING_LOOP_THRESHOLD: usize = 10;

/// Tool names that mutate the workspace or the host in ways a human
/// should approve before they run.
const DANGEROUS_TOOLS: &[&str] = &["exec", "process"];

/// What to do with a dangerous tool call that the human rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OnRejection {
    /// Roll back anything the turn has touched so far, then stop.
    RollbackAndStop,
}

fn on_rejection_policy(_tool_name: &str) -> OnRejection {
    // Every currently-dangerous tool gets the same conservative policy;
    // this becomes a per-tool table if a less destructive tool is ever
    // added to DANGEROUS_TOOLS.
    OnRejection::RollbackAndStop
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// TurnContext — pre-built state for one turn
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything the tool loop needs, built once before the first LLM call.
pub(super) struct TurnContext {
    provider: Arc<dyn sa_providers::LlmProvider>,
    /// Model name resolved by the router/role-default chain, if any —
    /// `None` means the caller's `input.model` (or the provider default)
    /// applies unchanged.
    resolved_model: Option<String>,
    messages: Vec<Message>,
    tool_defs: Vec<ToolDefinition>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// TurnEvent — the SSE event type
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Events emitted during a single agent turn.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum TurnEvent {
    /// Reasoning/thinking content from the model.
    #[serde(rename = "thought")]
    Thought { content: String },

    /// Incremental text from the assistant.
    #[serde(rename = "assistant_delta")]
    AssistantDelta { text: String },

    /// The model is invoking a tool.
    #[serde(rename = "tool_call")]
    ToolCallEvent {
        call_id: String,
        tool_name: String,
        arguments: Value,
    },

    /// Tool execution result.
    #[serde(rename = "tool_result")]
    ToolResult {
        call_id: String,
        tool_name: String,
        content: String,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },

    /// The final assistant message (full text).
    #[serde(rename = "final")]
    Final { content: String },

    /// The turn was stopped by a cancellation request.
    #[serde(rename = "stopped")]
    Stopped {
        /// Partial content accumulated before the stop.
        content: String,
    },

    /// An error occurred.
    #[serde(rename = "error")]
    Error { message: String },

    /// Token usage for the turn.
    #[serde(rename = "usage")]
    UsageEvent {
        input_tokens: u32,
        output_tokens: u32,
        total_tokens: u32,
    },

    /// A human-in-the-loop confirmation is pending; the client must
    /// `POST` a response referencing `confirmation_id` to unblock the turn.
    #[serde(rename = "confirmation_required")]
    ConfirmationRequired {
        confirmation_id: String,
        kind: &'static str,
        question: String,
        options: Vec<String>,
    },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run parameters
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Input to a single turn.
pub struct TurnInput {
    pub session_key: String,
    pub session_id: String,
    pub user_message: String,
    /// Model override (e.g. "openai/gpt-4o"). None = use role default.
    pub model: Option<String>,
    /// Ask the model to respond with valid JSON only.
    pub json_mode: bool,
    /// Attachments submitted alongside the user message (arbitrary
    /// channel-provided JSON — validated in phase 1 before the turn
    /// proceeds).
    pub attachments: Vec<Value>,
    /// When running as a sub-agent, carries agent-scoped overrides.
    pub agent: Option<agent::AgentContext>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// run_turn — the core orchestrator
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Run one agent turn: build context, call LLM, dispatch tools, loop.
///
/// Returns the `run_id` (UUID) and a channel receiver of [`TurnEvent`]s
/// (the caller reads events as they arrive for SSE streaming, or drains
/// them for non-streaming).
///
/// Registers a cancel token so `POST /v1/sessions/:key/stop` can abort
/// the turn cleanly.
pub fn run_turn(
    state: AppState,
    input: TurnInput,
) -> (uuid::Uuid, mpsc::Receiver<TurnEvent>) {
    let (tx, rx) = mpsc::channel::<TurnEvent>(64);

    // ── Create run record ────────────────────────────────────────
    let mut run = runs::Run::new(
        input.session_key.clone(),
        input.session_id.clone(),
        &input.user_message,
    );
    run.model = input.model.clone();
    run.agent_id = input.agent.as_ref().map(|a| a.agent_id.clone());
    run.status = runs::RunStatus::Running;
    let run_id = run.run_id;
    state.run_store.insert(run);
    state.run_store.emit(
        &run_id,
        runs::RunEvent::RunStatus {
            run_id,
            status: runs::RunStatus::Running,
        },
    );

    // Register a cancel token for this session.
    let cancel_token = state.cancel_map.register(&input.session_key);
    let session_key = input.session_key.clone();
    let session_id = input.session_id.clone();
    let state_ref = state;

    // Guardrails are tracked per session_id across the whole turn; the
    // complexity/tier pair is a placeholder until intent routing (§6.2)
    // or account tiering feeds a real estimate.
    state_ref
        .guardrails
        .start_session(&session_id, Complexity::Medium, Tier::Pro);
    // Session-engine lifecycle (stop events, state-manager registration).
    state_ref.session_engine.create_session(&session_id);

    let turn_span = tracing::info_span!(
        "turn",
        %run_id,
        session_key = %session_key,
        "otel.kind" = "SERVER",
    );
    tokio::spawn(tracing::Instrument::instrument(async move {
        tracing::debug!("turn started");
        let result =
            run_turn_inner(state_ref.clone(), input, tx.clone(), &cancel_token, run_id).await;

        // Cleanup: remove the cancel token and end the guardrail/backtrack session.
        state_ref.cancel_map.remove(&session_key);
        state_ref.guardrails.end_session(&session_id);
        state_ref.backtrack.clear_history(&session_id);

        if let Err(e) = result {
            let err_msg = e.to_string();
            state_ref.run_store.update(&run_id, |r| {
                r.error = Some(err_msg.clone());
                r.finish(runs::RunStatus::Failed);
            });
            if let Some(run) = state_ref.run_store.get(&run_id) {
                state_ref.run_store.persist(&run);
            }
            state_ref.run_store.emit(
                &run_id,
                runs::RunEvent::RunStatus {
                    run_id,
                    status: runs::RunStatus::Failed,
                },
            );
            state_ref.run_store.cleanup_channel(&run_id);
            let _ = tx
                .send(TurnEvent::Error {
                    message: err_msg,
                })
                .await;
        }

        // ── Phase 7: snapshot disposition ────────────────────────
        // Success discards the snapshot (nothing to roll back to);
        // failure or a human stop keeps it registered so the session
        // can still preview/rollback after the turn ends.
        let final_status = state_ref
            .run_store
            .get(&run_id)
            .map(|r| r.status)
            .unwrap_or(runs::RunStatus::Completed);
        let session_status = match final_status {
            runs::RunStatus::Completed => SessionStatus::Completed,
            runs::RunStatus::Stopped => SessionStatus::Stopped,
            _ => SessionStatus::Failed,
        };
        state_ref.session_engine.end_session(&session_id, session_status);
        if session_status == SessionStatus::Completed {
            state_ref.session_engine.unregister_state_manager(&session_id);
        }
    }, turn_span));

    (run_id, rx)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Extracted helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Phase 1: validate attachments before the turn touches the model or
/// the filesystem. Each attachment must be a JSON object naming either
/// inline `content` or a workspace-relative `path` — no absolute paths,
/// no `..` traversal.
fn validate_attachments(attachments: &[Value]) -> Result<(), DomainError> {
    for (idx, att) in attachments.iter().enumerate() {
        let obj = att.as_object().ok_or_else(|| {
            DomainError::AttachmentValidation(format!("attachment {idx} is not a JSON object"))
        })?;
        let has_content = obj.get("content").is_some_and(|v| v.is_string());
        let path = obj.get("path").and_then(|v| v.as_str());
        if !has_content && path.is_none() {
            return Err(DomainError::AttachmentValidation(format!(
                "attachment {idx} has neither inline `content` nor a `path`"
            )));
        }
        if let Some(path) = path {
            if path.contains("..") || path.starts_with('/') {
                return Err(DomainError::AttachmentValidation(format!(
                    "attachment {idx} path escapes the workspace: {path}"
                )));
            }
        }
    }
    Ok(())
}

/// Phase 2: ask the model which of the ready skills are relevant to this
/// request. Returns `None` (inject the full index) on any failure —
/// empty selection, parse error, or provider error — matching the
/// documented fallback.
async fn route_intent(
    provider: &Arc<dyn sa_providers::LlmProvider>,
    user_message: &str,
    skill_names: &[String],
) -> Option<Vec<String>> {
    if skill_names.is_empty() {
        return None;
    }

    let prompt = format!(
        "Available skill names: {}\n\nUser request:\n{user_message}\n\n\
         Return a JSON array containing only the skill names above that are \
         relevant to this request. Return an empty array if none apply.",
        skill_names.join(", ")
    );
    let req = sa_providers::ChatRequest {
        messages: vec![
            Message::system("You route user requests to relevant skills. Respond with a JSON array of skill names only, nothing else."),
            Message::user(&prompt),
        ],
        tools: vec![],
        temperature: Some(0.1),
        max_tokens: Some(256),
        json_mode: true,
        model: None,
    };

    let resp = match provider.chat(req).await {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(error = %e, "intent routing call failed, injecting full skill index");
            return None;
        }
    };

    match serde_json::from_str::<Vec<String>>(&resp.content) {
        Ok(names) if !names.is_empty() => Some(names),
        Ok(_) => None,
        Err(e) => {
            tracing::warn!(error = %e, content = %resp.content, "intent routing response unparseable, injecting full skill index");
            None
        }
    }
}

/// Handle a cancellation event: update the run store, persist a
/// transcript marker, and send a [`TurnEvent::Stopped`] to the caller.
///
/// Used by the streaming and tool-dispatch cancellation sites.
async fn handle_cancellation(
    state: &AppState,
    tx: &mpsc::Sender<TurnEvent>,
    session_id: &str,
    run_id: uuid::Uuid,
    partial_content: &str,
    context_msg: &str,
) {
    state.run_store.update(&run_id, |r| {
        r.output_preview = Some(truncate_str(partial_content, 200));
        r.finish(runs::RunStatus::Stopped);
    });
    if let Some(run) = state.run_store.get(&run_id) {
        state.run_store.persist(&run);
    }
    state.run_store.emit(
        &run_id,
        runs::RunEvent::RunStatus {
            run_id,
            status: runs::RunStatus::Stopped,
        },
    );
    state.run_store.cleanup_channel(&run_id);
    persist_transcript(
        &state.transcripts,
        session_id,
        "system",
        &format!(
            "[run aborted by user{context_msg}]{}",
            if partial_content.is_empty() {
                String::new()
            } else {
                format!(" partial: {partial_content}")
            }
        ),
        Some(serde_json::json!({ "stopped": true })),
        None,
    )
    .await;
    let _ = tx
        .send(TurnEvent::Stopped {
            content: partial_content.to_string(),
        })
        .await;
}

/// Finalize a successful run: persist the assistant transcript, send
/// Final + Usage events, record usage in the session store, update and
/// persist the run, emit completion events, and fire auto-capture.
async fn finalize_run_success(
    state: &AppState,
    tx: &mpsc::Sender<TurnEvent>,
    input: &TurnInput,
    run_id: uuid::Uuid,
    text_buf: &str,
    total_usage: &Usage,
) {
    persist_transcript(
        &state.transcripts,
        &input.session_id,
        "assistant",
        text_buf,
        None,
        None,
    )
    .await;

    let _ = tx
        .send(TurnEvent::Final {
            content: text_buf.to_string(),
        })
        .await;

    let _ = tx
        .send(TurnEvent::UsageEvent {
            input_tokens: total_usage.prompt_tokens,
            output_tokens: total_usage.completion_tokens,
            total_tokens: total_usage.total_tokens,
        })
        .await;

    state.sessions.record_usage(
        &input.session_key,
        total_usage.prompt_tokens as u64,
        total_usage.completion_tokens as u64,
    );

    // ── Finalize run (success) ───────────────────────────
    let pricing_map = &state.config.llm.pricing;
    state.run_store.update(&run_id, |r| {
        r.input_tokens = total_usage.prompt_tokens;
        r.output_tokens = total_usage.completion_tokens;
        r.total_tokens = total_usage.total_tokens;
        r.output_preview = Some(truncate_str(text_buf, 200));
        // Compute estimated cost from per-model pricing config.
        if let Some(model_name) = r.model.as_deref() {
            if let Some(pricing) = pricing_map.get(model_name) {
                r.estimated_cost_usd =
                    pricing.estimate_cost(total_usage.prompt_tokens, total_usage.completion_tokens);
            }
        }
        r.finish(runs::RunStatus::Completed);
    });
    if let Some(run) = state.run_store.get(&run_id) {
        state.run_store.persist(&run);
    }
    state.run_store.emit(
        &run_id,
        runs::RunEvent::RunStatus {
            run_id,
            status: runs::RunStatus::Completed,
        },
    );
    state.run_store.emit(
        &run_id,
        runs::RunEvent::Usage {
            run_id,
            input_tokens: total_usage.prompt_tokens,
            output_tokens: total_usage.completion_tokens,
            total_tokens: total_usage.total_tokens,
        },
    );
    state.run_store.cleanup_channel(&run_id);

    // ── Record usage against quota tracker ─────────────────
    {
        let estimated_cost = state
            .run_store
            .get(&run_id)
            .map(|r| r.estimated_cost_usd)
            .unwrap_or(0.0);
        state.quota_tracker.record_usage(
            input.agent.as_ref().map(|a| a.agent_id.as_str()),
            total_usage.total_tokens as u64,
            estimated_cost,
        );
    }

    // ── Memory auto-capture (fire-and-forget) ─────────────
    fire_auto_capture(state, input, text_buf);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// run_turn_inner — the main tool loop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn run_turn_inner(
    state: AppState,
    input: TurnInput,
    tx: mpsc::Sender<TurnEvent>,
    cancel: &CancelToken,
    run_id: uuid::Uuid,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut node_seq: u32 = 0;

    // ── Pre-flight: quota check ─────────────────────────────────────────
    {
        let agent_id = input.agent.as_ref().map(|a| a.agent_id.as_str());
        if let Err(exceeded) = state.quota_tracker.check_quota(agent_id) {
            let msg = format!(
                "daily {} quota exceeded: {:.2}/{:.2}",
                exceeded.kind, exceeded.used, exceeded.limit,
            );
            let _ = tx.send(TurnEvent::Error { message: msg }).await;
            state.run_store.update(&run_id, |r| {
                r.error = Some(format!("quota exceeded: {}", exceeded.kind));
                r.finish(runs::RunStatus::Failed);
            });
            if let Some(run) = state.run_store.get(&run_id) {
                state.run_store.persist(&run);
            }
            state.run_store.emit(
                &run_id,
                runs::RunEvent::RunStatus {
                    run_id,
                    status: runs::RunStatus::Failed,
                },
            );
            state.run_store.cleanup_channel(&run_id);
            return Ok(());
        }
    }

    // ── Phase 1: attachment validation ──────────────────────────────────
    if let Err(e) = validate_attachments(&input.attachments) {
        let msg = e.public_message();
        let _ = tx.send(TurnEvent::Error { message: msg.clone() }).await;
        state.run_store.update(&run_id, |r| {
            r.error = Some(msg);
            r.finish(runs::RunStatus::Failed);
        });
        if let Some(run) = state.run_store.get(&run_id) {
            state.run_store.persist(&run);
        }
        state.run_store.emit(
            &run_id,
            runs::RunEvent::RunStatus {
                run_id,
                status: runs::RunStatus::Failed,
            },
        );
        state.run_store.cleanup_channel(&run_id);
        return Ok(());
    }

    // ── Phase 4: pre-turn snapshot ───────────────────────────────────────
    // Fingerprint the workspace before the turn can mutate it, so a later
    // dangerous-op rejection or backtrack-budget exhaustion can offer a
    // byte-exact rollback.
    {
        let root = input
            .agent
            .as_ref()
            .map(|a| a.workspace.root())
            .unwrap_or_else(|| state.workspace.root())
            .to_path_buf();
        match snapshot::discover_inventory(&root) {
            Ok(inventory) => match StateSnapshot::capture(input.session_id.clone(), root, &inventory) {
                Ok(snap) => {
                    state
                        .session_engine
                        .register_state_manager(&input.session_id, Arc::new(StateManager::new(snap)));
                }
                Err(e) => tracing::warn!(error = %e, "failed to capture pre-turn snapshot"),
            },
            Err(e) => tracing::warn!(error = %e, "failed to discover workspace inventory for snapshot"),
        }
    }

    // ── Phase 2+3: Build the turn context (provider, messages, tool defs) ──
    let ctx = prepare_turn_context(&state, &input).await?;
    let TurnContext {
        provider,
        resolved_model,
        mut messages,
        tool_defs,
    } = ctx;
    let effective_model = resolved_model.or_else(|| input.model.clone());

    // Tools banned for the rest of this turn by a ToolReplace backtrack.
    let mut banned_tools: HashSet<String> = HashSet::new();

    // ── Tool loop ───────────────────────────────────────────────────────
    let mut total_usage = Usage {
        prompt_tokens: 0,
        completion_tokens: 0,
        total_tokens: 0,
    };

    for loop_idx in 0..MAX_TOOL_LOOPS {
        tracing::debug!(loop_idx, "tool loop iteration");

        state.guardrails.record_turn(&input.session_id);
        let blocking = state.guardrails.blocking_issues(&input.session_id);
        if let Some(issue) = blocking.first() {
            let _ = tx
                .send(TurnEvent::Error {
                    message: format!("guardrail blocked: {}", issue.message),
                })
                .await;
            state.run_store.update(&run_id, |r| {
                r.error = Some(issue.message.clone());
                r.finish(runs::RunStatus::Failed);
            });
            if let Some(run) = state.run_store.get(&run_id) {
                state.run_store.persist(&run);
            }
            state.run_store.emit(
                &run_id,
                runs::RunEvent::RunStatus {
                    run_id,
                    status: runs::RunStatus::Failed,
                },
            );
            state.run_store.cleanup_channel(&run_id);
            return Ok(());
        }

        // ── Long-running-turn HITL: ask the human whether to keep going ──
        if loop_idx == LONG_RUNNING_LOOP_THRESHOLD {
            let (confirm_id, info) = state.session_engine.request_long_running(&input.session_id, loop_idx);
            let _ = tx
                .send(TurnEvent::ConfirmationRequired {
                    confirmation_id: confirm_id.to_string(),
                    kind: "long_running",
                    question: info.question.clone(),
                    options: info.options.clone(),
                })
                .await;
            match state.session_engine.wait_long_running(confirm_id).await {
                Ok(keep_going) if !keep_going => {
                    handle_cancellation(
                        &state,
                        &tx,
                        &input.session_id,
                        run_id,
                        "",
                        " (human stopped a long-running turn)",
                    )
                    .await;
                    return Ok(());
                }
                Ok(_) => {}
                Err(_) => {
                    tracing::warn!("long-running confirmation lookup failed, continuing");
                }
            }
        }

        // ── Check cancellation before each LLM call ──────────────
        // (lightweight: no run-store update since we haven't started yet)
        if cancel.is_cancelled() || state.session_engine.is_stopped(&input.session_id) {
            persist_transcript(
                &state.transcripts,
                &input.session_id,
                "system",
                "[run aborted by user]",
                Some(serde_json::json!({ "stopped": true })),
                None,
            )
            .await;
            let _ = tx
                .send(TurnEvent::Stopped {
                    content: String::new(),
                })
                .await;
            return Ok(());
        }

        // ── Track LLM node ────────────────────────────────────────
        node_seq += 1;
        let llm_node_id = node_seq;
        let llm_start = chrono::Utc::now();
        let llm_node = runs::RunNode {
            node_id: llm_node_id,
            kind: runs::NodeKind::LlmRequest,
            name: "llm".into(),
            status: runs::RunStatus::Running,
            started_at: llm_start,
            ended_at: None,
            duration_ms: None,
            input_preview: None,
            output_preview: None,
            is_error: false,
            input_tokens: 0,
            output_tokens: 0,
        };
        state.run_store.update(&run_id, |r| {
            r.loop_count = loop_idx as u32 + 1;
            r.nodes.push(llm_node.clone());
        });
        state.run_store.emit(
            &run_id,
            runs::RunEvent::NodeStarted {
                run_id,
                node: llm_node,
            },
        );

        // Call LLM (streaming). Tools banned by a ToolReplace backtrack
        // are filtered out of the candidate list for the rest of the turn.
        let active_tool_defs: Vec<ToolDefinition> = tool_defs
            .iter()
            .filter(|t| !banned_tools.contains(&t.name))
            .cloned()
            .collect();
        let req = sa_providers::ChatRequest {
            messages: messages.clone(),
            tools: active_tool_defs,
            temperature: Some(0.2),
            max_tokens: None,
            json_mode: input.json_mode,
            model: effective_model.clone(),
        };
        let req_model = req.model.clone();

        let llm_call_span = tracing::info_span!(
            "llm.call",
            "otel.kind" = "CLIENT",
            model = req_model.as_deref().unwrap_or("default"),
            input_tokens = tracing::field::Empty,
            output_tokens = tracing::field::Empty,
        );

        let mut stream = provider
            .chat_stream(req)
            .instrument(llm_call_span.clone())
            .await?;

        // Accumulate the response.
        let mut text_buf = String::new();
        let mut pending_tool_calls: Vec<ToolCall> = Vec::new();
        let mut turn_usage: Option<Usage> = None;
        let mut was_cancelled = false;
        let mut stream_failed = false;

        // Tool call assembly state.
        let mut tc_bufs: std::collections::HashMap<String, (String, String)> =
            std::collections::HashMap::new(); // call_id -> (name, args_json)

        while let Some(event_result) = stream.next().await {
            // Check cancellation during streaming.
            if cancel.is_cancelled() {
                was_cancelled = true;
                break;
            }

            let event = event_result?;
            match event {
                StreamEvent::Token { text } => {
                    let _ = tx
                        .send(TurnEvent::AssistantDelta { text: text.clone() })
                        .await;
                    text_buf.push_str(&text);
                }
                StreamEvent::ToolCallStarted {
                    call_id,
                    tool_name,
                } => {
                    tc_bufs.insert(call_id, (tool_name, String::new()));
                }
                StreamEvent::ToolCallDelta { call_id, delta } => {
                    if let Some((_, args)) = tc_bufs.get_mut(&call_id) {
                        args.push_str(&delta);
                    }
                }
                StreamEvent::ToolCallFinished {
                    call_id,
                    tool_name,
                    arguments,
                } => {
                    pending_tool_calls.push(ToolCall {
                        call_id: call_id.clone(),
                        tool_name: tool_name.clone(),
                        arguments: arguments.clone(),
                    });
                    tc_bufs.remove(&call_id);
                }
                StreamEvent::Done {
                    usage,
                    finish_reason: _,
                } => {
                    turn_usage = usage;
                }
                StreamEvent::Error { message } => {
                    let classified = state.backtrack.classifier().classify_llm_error(&message);
                    let decision = state.backtrack.evaluate_and_decide(
                        &input.session_id,
                        loop_idx as u32,
                        &classified,
                        None,
                    );
                    tracing::warn!(
                        error = %message,
                        decision = ?decision.decision,
                        reason = %decision.reason,
                        "llm stream error classified"
                    );
                    if decision.reason.contains("backtrack budget exhausted") {
                        if handle_backtrack_exhausted(&state, &tx, &input, run_id, &text_buf).await? {
                            return Ok(());
                        }
                    }
                    let _ = tx.send(TurnEvent::Error { message }).await;
                    stream_failed = true;
                    break;
                }
            }
        }

        if let Some(u) = &turn_usage {
            llm_call_span.record("input_tokens", u.prompt_tokens);
            llm_call_span.record("output_tokens", u.completion_tokens);
        }

        // ── Finalize LLM node ─────────────────────────────────────
        {
            let llm_end = chrono::Utc::now();
            let llm_dur = (llm_end - llm_start).num_milliseconds().max(0) as u64;
            let llm_status = if was_cancelled {
                runs::RunStatus::Stopped
            } else if stream_failed {
                runs::RunStatus::Failed
            } else {
                runs::RunStatus::Completed
            };
            let t_in = turn_usage.as_ref().map(|u| u.prompt_tokens).unwrap_or(0);
            let t_out = turn_usage
                .as_ref()
                .map(|u| u.completion_tokens)
                .unwrap_or(0);
            state.run_store.update(&run_id, |r| {
                if let Some(n) = r.nodes.iter_mut().find(|n| n.node_id == llm_node_id) {
                    n.status = llm_status;
                    n.ended_at = Some(llm_end);
                    n.duration_ms = Some(llm_dur);
                    n.input_tokens = t_in;
                    n.output_tokens = t_out;
                    n.output_preview = Some(truncate_str(&text_buf, 200));
                    n.is_error = stream_failed;
                }
            });
        }

        // Handle cancellation during streaming.
        if was_cancelled {
            handle_cancellation(&state, &tx, &input.session_id, run_id, &text_buf, "").await;
            return Ok(());
        }
        if stream_failed {
            return Ok(());
        }

        // Assemble any tool calls that came through start/delta but not
        // through ToolCallFinished (some providers only use start+delta).
        for (call_id, (name, args_str)) in tc_bufs.drain() {
            let arguments = if args_str.trim().is_empty() {
                // Empty arguments (common with DeepSeek) → default to empty object.
                Value::Object(Default::default())
            } else {
                match serde_json::from_str(&args_str) {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!(
                            call_id = %call_id,
                            tool = %name,
                            error = %e,
                            "tool call arguments are not valid JSON; defaulting to empty object"
                        );
                        Value::Object(Default::default())
                    }
                }
            };
            pending_tool_calls.push(ToolCall {
                call_id,
                tool_name: name,
                arguments,
            });
        }

        // Accumulate usage.
        if let Some(u) = &turn_usage {
            total_usage.prompt_tokens += u.prompt_tokens;
            total_usage.completion_tokens += u.completion_tokens;
            total_usage.total_tokens += u.total_tokens;
            state
                .guardrails
                .record_tokens(&input.session_id, u.total_tokens as u64);
        }

        // If no tool calls, this is the final answer.
        if pending_tool_calls.is_empty() {
            finalize_run_success(&state, &tx, &input, run_id, &text_buf, &total_usage).await;
            return Ok(());
        }

        // ── Cost gate: check estimated spend so far against the
        // configured soft/urgent thresholds ───────────────────────
        if let Some(model_name) = input.model.as_deref().or(req_model.as_deref()) {
            if let Some(pricing) = state.config.llm.pricing.get(model_name) {
                let spent =
                    pricing.estimate_cost(total_usage.prompt_tokens, total_usage.completion_tokens);
                if let Some(urgent) = state.guardrails.cost_gate_check(spent) {
                    let (confirm_id, info) =
                        state.session_engine.request_cost_gate(&input.session_id, urgent, spent);
                    let _ = tx
                        .send(TurnEvent::ConfirmationRequired {
                            confirmation_id: confirm_id.to_string(),
                            kind: "cost_gate",
                            question: info.question.clone(),
                            options: info.options.clone(),
                        })
                        .await;
                    match state.session_engine.wait_cost_gate(confirm_id).await {
                        Ok(true) => {}
                        _ => {
                            handle_cancellation(
                                &state,
                                &tx,
                                &input.session_id,
                                run_id,
                                &text_buf,
                                " (human stopped at a cost gate)",
                            )
                            .await;
                            return Ok(());
                        }
                    }
                }
            }
        }

        // ── Tool dispatch ──────────────────────────────────────────
        messages.push(build_assistant_tool_message(&text_buf, &pending_tool_calls));

        let tc_json = serde_json::to_string(&pending_tool_calls).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to serialize tool calls for transcript");
            String::new()
        });
        persist_transcript(
            &state.transcripts,
            &input.session_id,
            "assistant",
            &text_buf,
            Some(serde_json::json!({ "tool_calls": tc_json })),
            None,
        )
        .await;

        // 1. Emit all ToolCallEvents and create run nodes.
        let mut tool_node_info: Vec<(u32, chrono::DateTime<chrono::Utc>)> = Vec::new();
        for tc in &pending_tool_calls {
            // Check cancellation before each tool.
            if cancel.is_cancelled() {
                handle_cancellation(
                    &state,
                    &tx,
                    &input.session_id,
                    run_id,
                    &text_buf,
                    " during tool dispatch",
                )
                .await;
                return Ok(());
            }

            // ── Track tool node ────────────────────────────────
            node_seq += 1;
            let tool_node_id = node_seq;
            let tool_start = chrono::Utc::now();
            let tool_input_preview = serde_json::to_string(&tc.arguments)
                .ok()
                .map(|s| truncate_str(&s, 200));
            let tool_node = runs::RunNode {
                node_id: tool_node_id,
                kind: runs::NodeKind::ToolCall,
                name: tc.tool_name.clone(),
                status: runs::RunStatus::Running,
                started_at: tool_start,
                ended_at: None,
                duration_ms: None,
                input_preview: tool_input_preview,
                output_preview: None,
                is_error: false,
                input_tokens: 0,
                output_tokens: 0,
            };
            state.run_store.update(&run_id, |r| {
                r.nodes.push(tool_node.clone());
            });
            state.run_store.emit(
                &run_id,
                runs::RunEvent::NodeStarted {
                    run_id,
                    node: tool_node,
                },
            );
            tool_node_info.push((tool_node_id, tool_start));

            let _ = tx
                .send(TurnEvent::ToolCallEvent {
                    call_id: tc.call_id.clone(),
                    tool_name: tc.tool_name.clone(),
                    arguments: tc.arguments.clone(),
                })
                .await;
        }

        // 2. Check cancellation once before the batch.
        if cancel.is_cancelled() {
            handle_cancellation(
                &state,
                &tx,
                &input.session_id,
                run_id,
                &text_buf,
                " during tool dispatch",
            )
            .await;
            return Ok(());
        }

        // 2b. Dangerous-op HITL gate: ask the human to approve each
        // dangerous tool call before it reaches the dispatcher.
        let mut approved_calls: Vec<ToolCall> = Vec::with_capacity(pending_tool_calls.len());
        let mut rejected_results: Vec<(ToolCall, String)> = Vec::new();
        for tc in pending_tool_calls {
            if !DANGEROUS_TOOLS.contains(&tc.tool_name.as_str()) {
                approved_calls.push(tc);
                continue;
            }
            let question = format!(
                "the agent wants to run `{}` with arguments {} — approve?",
                tc.tool_name, tc.arguments
            );
            let (confirm_id, info) = state.session_engine.request_hitl(&input.session_id, question);
            let _ = tx
                .send(TurnEvent::ConfirmationRequired {
                    confirmation_id: confirm_id.to_string(),
                    kind: "hitl",
                    question: info.question.clone(),
                    options: info.options.clone(),
                })
                .await;
            let approved = state.session_engine.wait_hitl(confirm_id).await.unwrap_or(false);
            if approved {
                approved_calls.push(tc);
                continue;
            }

            match on_rejection_policy(&tc.tool_name) {
                OnRejection::RollbackAndStop => {
                    if let Some(manager) = state.session_engine.get_state_manager(&input.session_id) {
                        if let Err(e) = manager.rollback(None) {
                            tracing::warn!(error = %e, "rollback after HITL rejection failed");
                        }
                    }
                    rejected_results.push((tc, "rejected by human reviewer; workspace rolled back".into()));
                }
            }
        }

        if !rejected_results.is_empty() {
            for (tc, msg) in &rejected_results {
                let _ = tx
                    .send(TurnEvent::ToolResult {
                        call_id: tc.call_id.clone(),
                        tool_name: tc.tool_name.clone(),
                        content: msg.clone(),
                        is_error: true,
                    })
                    .await;
            }
            handle_cancellation(
                &state,
                &tx,
                &input.session_id,
                run_id,
                &text_buf,
                " (dangerous operation rejected by human reviewer)",
            )
            .await;
            return Ok(());
        }

        let pending_tool_calls = approved_calls;

        // 3. Dispatch all tools concurrently.
        //    Latency = max(tool_latencies) instead of sum(tool_latencies).
        //    Results are collected in original order via join_all to preserve
        //    deterministic SSE sequencing.
        let tool_futures: Vec<_> = pending_tool_calls
            .iter()
            .map(|tc| {
                let tool_span = tracing::info_span!(
                    "tool.call",
                    tool_name = %tc.tool_name,
                );
                tools::dispatch_tool(
                    &state,
                    &tc.tool_name,
                    &tc.arguments,
                    Some(&input.session_key),
                )
                .instrument(tool_span)
            })
            .collect();
        let tool_results = futures_util::future::join_all(tool_futures).await;

        // 4. Emit results, finalize nodes, and persist transcripts.
        let mut backtrack_exhausted = false;
        for ((tc, (result_content, is_error)), (tool_node_id, tool_start)) in
            pending_tool_calls.iter().zip(tool_results).zip(tool_node_info)
        {
            // ── Finalize tool node ───────────────────────────────
            let tool_end = chrono::Utc::now();
            let tool_dur = (tool_end - tool_start).num_milliseconds().max(0) as u64;
            let tool_status = if is_error {
                runs::RunStatus::Failed
            } else {
                runs::RunStatus::Completed
            };
            state.run_store.update(&run_id, |r| {
                if let Some(n) = r.nodes.iter_mut().find(|n| n.node_id == tool_node_id) {
                    n.status = tool_status;
                    n.ended_at = Some(tool_end);
                    n.duration_ms = Some(tool_dur);
                    n.output_preview = Some(truncate_str(&result_content, 200));
                    n.is_error = is_error;
                }
            });
            state.guardrails.record_tool_call(&input.session_id);

            if is_error {
                let classified = state
                    .backtrack
                    .classifier()
                    .classify_tool_error(&result_content, &tc.tool_name);
                let decision = state.backtrack.evaluate_and_decide(
                    &input.session_id,
                    loop_idx as u32,
                    &classified,
                    None,
                );
                tracing::warn!(
                    tool = %tc.tool_name,
                    decision = ?decision.decision,
                    backtrack_type = ?decision.backtrack_type,
                    reason = %decision.reason,
                    "tool error classified for backtrack"
                );

                if decision.reason.contains("backtrack budget exhausted") {
                    backtrack_exhausted = true;
                } else {
                    match decision.decision {
                        BacktrackDecision::Backtrack if decision.backtrack_type == BacktrackType::ToolReplace => {
                            banned_tools.insert(tc.tool_name.clone());
                        }
                        BacktrackDecision::Escalate => {
                            let (confirm_id, info) = state.session_engine.request_intent_clarify(
                                &input.session_id,
                                format!(
                                    "`{}` failed and the intent is unclear — can you clarify what you want?",
                                    tc.tool_name
                                ),
                            );
                            let _ = tx
                                .send(TurnEvent::ConfirmationRequired {
                                    confirmation_id: confirm_id.to_string(),
                                    kind: "intent_clarify",
                                    question: info.question.clone(),
                                    options: info.options.clone(),
                                })
                                .await;
                            if let Ok(answer) = state.session_engine.wait_intent_clarify(confirm_id).await {
                                if !answer.is_empty() {
                                    messages.push(Message::user(&answer));
                                }
                            }
                        }
                        _ => {}
                    }
                }
            }

            let _ = tx
                .send(TurnEvent::ToolResult {
                    call_id: tc.call_id.clone(),
                    tool_name: tc.tool_name.clone(),
                    content: result_content.clone(),
                    is_error,
                })
                .await;

            messages.push(Message::tool_result(&tc.call_id, &result_content));

            persist_transcript(
                &state.transcripts,
                &input.session_id,
                "tool",
                &result_content,
                Some(serde_json::json!({
                    "call_id": tc.call_id,
                    "tool_name": tc.tool_name,
                    "is_error": is_error,
                })),
                None,
            )
            .await;
        }

        if backtrack_exhausted
            && handle_backtrack_exhausted(&state, &tx, &input, run_id, &text_buf).await?
        {
            return Ok(());
        }

        if loop_idx == MAX_TOOL_LOOPS - 1 {
            let _ = tx
                .send(TurnEvent::Error {
                    message: format!("tool loop limit reached ({MAX_TOOL_LOOPS} iterations)"),
                })
                .await;
        }
    }

    Ok(())
}

/// Phase 6g: the backtrack budget is exhausted for this session — ask
/// the human whether to retry (reset nothing, let the loop continue),
/// roll back the workspace to the pre-turn snapshot, or stop outright.
///
/// Returns `Ok(true)` if the turn loop should return immediately
/// (rollback or stop), `Ok(false)` if it should keep looping (retry).
async fn handle_backtrack_exhausted(
    state: &AppState,
    tx: &mpsc::Sender<TurnEvent>,
    input: &TurnInput,
    run_id: uuid::Uuid,
    partial_content: &str,
) -> Result<bool, Box<dyn std::error::Error + Send + Sync>> {
    let (confirm_id, info) = state.session_engine.request_backtrack_exhausted(&input.session_id);
    let _ = tx
        .send(TurnEvent::ConfirmationRequired {
            confirmation_id: confirm_id.to_string(),
            kind: "backtrack_exhausted",
            question: info.question.clone(),
            options: info.options.clone(),
        })
        .await;
    let choice = state
        .session_engine
        .wait_backtrack_exhausted(confirm_id)
        .await
        .unwrap_or_else(|_| "stop".to_string());

    match choice.as_str() {
        "retry" => Ok(false),
        "rollback" => {
            if let Some(manager) = state.session_engine.get_state_manager(&input.session_id) {
                if let Err(e) = manager.rollback(None) {
                    tracing::warn!(error = %e, "rollback after backtrack exhaustion failed");
                }
            }
            handle_cancellation(
                state,
                tx,
                &input.session_id,
                run_id,
                partial_content,
                " (backtrack budget exhausted, workspace rolled back)",
            )
            .await;
            Ok(true)
        }
        _ => {
            handle_cancellation(
                state,
                tx,
                &input.session_id,
                run_id,
                partial_content,
                " (backtrack budget exhausted)",
            )
            .await;
            Ok(true)
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Phase 1 helper
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Phase 1: Resolve the provider, build the system prompt, load and
/// compact the transcript, assemble messages, and persist the user turn.
///
/// Returns a [`TurnContext`] containing everything the tool loop needs.
async fn prepare_turn_context(
    state: &AppState,
    input: &TurnInput,
) -> Result<TurnContext, Box<dyn std::error::Error + Send + Sync>> {
    // 1. Resolve the LLM provider (agent models -> global roles -> any).
    let (provider, resolved_model) =
        resolve_provider(state, input.model.as_deref(), input.agent.as_ref(), None)?;

    // 2. Intent routing (phase 2): narrow the injected skill index to
    //    what's relevant to this request, falling back to the full index.
    let skill_names: Vec<String> = match input.agent.as_ref() {
        Some(ctx) => ctx.skills.list_ready().into_iter().map(|e| e.name).collect(),
        None => state.skills.list_ready().into_iter().map(|e| e.name).collect(),
    };
    let allowed_skills = route_intent(&provider, &input.user_message, &skill_names).await;

    // 3. Build system context (agent-scoped workspace/skills if present).
    let system_prompt =
        build_system_context(state, input.agent.as_ref(), allowed_skills.as_deref()).await;

    // 4. Load raw transcript and check compaction.
    //    Child agents have compaction disabled by default (short-lived sessions).
    let mut all_lines = load_raw_transcript(&state.transcripts, &input.session_id);

    let compaction_enabled = input.agent.is_none() && state.config.compaction.auto;

    // Compute the compaction boundary once to avoid redundant reverse scans.
    let mut boundary = compact::compaction_boundary(&all_lines);

    if compaction_enabled && compact::should_compact(&all_lines, &state.config.compaction) {
        // Pick the summarizer (or fall back to the executor provider).
        let summarizer = resolve_summarizer(state).unwrap_or_else(|| provider.clone());
        match compact::run_compaction(
            summarizer.as_ref(),
            &state.transcripts,
            &input.session_id,
            &all_lines,
            &state.config.compaction,
        )
        .await
        {
            Ok(summary) => {
                // Optionally ingest the summary to long-term memory.
                if state.config.memory_lifecycle.capture_on_compaction && !summary.is_empty() {
                    let memory = state.memory.clone();
                    let sk = input.session_key.clone();
                    let sid = input.session_id.clone();
                    // Build provenance metadata (includes agent fields for child agents).
                    let mut meta =
                        agent::provenance_metadata(input.agent.as_ref(), &sk, &sid)
                            .unwrap_or_default();
                    meta.insert("sa.compaction".into(), serde_json::json!(true));
                    meta.insert("sa.session_key".into(), serde_json::json!(&sk));

                    tokio::spawn(async move {
                        let req = sa_memory::MemoryIngestRequest {
                            content: format!("Session summary (compacted):\n{summary}"),
                            source: Some("session_summary".into()),
                            session_id: Some(sid),
                            metadata: Some(meta),
                            extract_entities: Some(true),
                        };
                        if let Err(e) = memory.ingest(req).await {
                            tracing::warn!(error = %e, "compaction memory ingest failed");
                        }
                    });
                }

                // Reload transcript (now includes the compaction marker).
                all_lines = load_raw_transcript(&state.transcripts, &input.session_id);
                boundary = compact::compaction_boundary(&all_lines);
            }
            Err(e) => {
                tracing::warn!(error = %e, "auto-compaction failed, continuing with full history");
            }
        }
    }

    // 5. Convert active transcript lines (after last compaction) to messages.
    let history = transcript_lines_to_messages(&all_lines[boundary..]);

    // 6. Build the tool definitions (filtered by agent tool policy).
    let tool_policy = input.agent.as_ref().map(|a| &a.tool_policy);
    let tool_defs = tools::build_tool_definitions(state, tool_policy);

    // 7. Build conversation messages.
    let mut messages = Vec::new();
    messages.push(Message::system(&system_prompt));
    messages.extend(history);
    messages.push(Message::user(&input.user_message));

    // 8. Persist user message to transcript.
    persist_transcript(
        &state.transcripts,
        &input.session_id,
        "user",
        &input.user_message,
        None,
        None,
    )
    .await;

    Ok(TurnContext {
        provider,
        resolved_model,
        messages,
        tool_defs,
    })
}
