//! Adaptive guardrails — five budget dimensions (turns, tool_calls,
//! tokens, wall-time, depth), each scaled by task complexity and account
//! tier, each reporting one of `Allow/Warn/Throttle/Block/Suggest`.
//!
//! Grounded on `core/guardrails/adaptive.py`'s `AdaptiveGuardrails`; the
//! bookkeeping style (lock-protected counters, UTC-agnostic per-session
//! state) follows this codebase's existing `quota.rs`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Complexity {
    Simple,
    Medium,
    Complex,
}

impl Complexity {
    fn multiplier(self) -> f64 {
        match self {
            Complexity::Simple => 0.5,
            Complexity::Medium => 1.0,
            Complexity::Complex => 1.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Free,
    Basic,
    Pro,
    Enterprise,
}

impl Tier {
    fn multiplier(self) -> f64 {
        match self {
            Tier::Free => 0.5,
            Tier::Basic => 0.8,
            Tier::Pro => 1.0,
            Tier::Enterprise => 2.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GuardrailConfig {
    pub max_turns: u32,
    pub max_tool_calls: u32,
    pub max_tokens: u64,
    pub max_execution_time: Duration,
    pub max_depth: u32,
    pub warn_threshold: f64,
    pub throttle_threshold: f64,
    /// Soft cost-gate threshold (USD spent so far this turn). `None`
    /// disables the cost gate entirely.
    pub cost_soft_usd: Option<f64>,
    /// Urgent cost-gate threshold — crossed after the soft one, surfaced
    /// with a stronger prompt to the human.
    pub cost_urgent_usd: Option<f64>,
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            max_turns: 15,
            max_tool_calls: 50,
            max_tokens: 100_000,
            max_execution_time: Duration::from_secs(300),
            max_depth: 5,
            warn_threshold: 0.8,
            throttle_threshold: 0.95,
            cost_soft_usd: None,
            cost_urgent_usd: None,
        }
    }
}

impl GuardrailConfig {
    /// `max(1, floor(base * complexity_mult * tier_mult))` — the spec's
    /// own suggested rounding rule for scaled budgets (see DESIGN.md Open
    /// Question #2).
    pub fn adjusted_limit(base: f64, complexity: Complexity, tier: Tier) -> u64 {
        let scaled = base * complexity.multiplier() * tier.multiplier();
        scaled.floor().max(1.0) as u64
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Check result
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardrailAction {
    Allow,
    Warn,
    Throttle,
    Block,
    Suggest,
}

impl GuardrailAction {
    pub fn is_allowed(self) -> bool {
        matches!(self, GuardrailAction::Allow | GuardrailAction::Warn | GuardrailAction::Suggest)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardrailDimension {
    Turns,
    ToolCalls,
    Tokens,
    ExecutionTime,
    Depth,
}

#[derive(Debug, Clone, Serialize)]
pub struct GuardrailCheckResult {
    pub action: GuardrailAction,
    pub dimension: &'static str,
    pub current_value: f64,
    pub limit_value: f64,
    pub usage_ratio: f64,
    pub message: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Per-session tracker
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct SessionCounters {
    turns: u32,
    tool_calls: u32,
    tokens: u64,
    started_at: Instant,
    depth: u32,
    history: Vec<GuardrailCheckResult>,
}

impl SessionCounters {
    fn new() -> Self {
        Self {
            turns: 0,
            tool_calls: 0,
            tokens: 0,
            started_at: Instant::now(),
            depth: 0,
            history: Vec::new(),
        }
    }
}

/// Tracks budget usage per session across the five dimensions, adjusted
/// by the session's complexity/tier context set at session start.
pub struct AdaptiveGuardrails {
    config: GuardrailConfig,
    sessions: Mutex<HashMap<String, (Complexity, Tier, SessionCounters)>>,
}

impl AdaptiveGuardrails {
    pub fn new(config: GuardrailConfig) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn start_session(&self, session_id: &str, complexity: Complexity, tier: Tier) {
        self.sessions
            .lock()
            .insert(session_id.to_string(), (complexity, tier, SessionCounters::new()));
    }

    fn check(
        &self,
        dimension: GuardrailDimension,
        name: &'static str,
        current: f64,
        limit: f64,
    ) -> GuardrailCheckResult {
        let ratio = if limit > 0.0 { current / limit } else { 0.0 };
        let action = if ratio >= 1.0 {
            GuardrailAction::Block
        } else if ratio >= self.config.throttle_threshold {
            GuardrailAction::Throttle
        } else if ratio >= self.config.warn_threshold {
            GuardrailAction::Warn
        } else {
            GuardrailAction::Allow
        };
        let message = match action {
            GuardrailAction::Block => format!("{name} budget exhausted: {current}/{limit}"),
            GuardrailAction::Throttle => format!("{name} nearing limit: {current}/{limit}"),
            GuardrailAction::Warn => format!("{name} usage high: {current}/{limit}"),
            _ => format!("{name} within budget: {current}/{limit}"),
        };
        let _ = dimension;
        GuardrailCheckResult {
            action,
            dimension: name,
            current_value: current,
            limit_value: limit,
            usage_ratio: ratio,
            message,
        }
    }

    /// Run every dimension's check for a session and record the results.
    /// Panics (via `expect`) only if `start_session` was never called —
    /// a programmer error, not a runtime condition.
    pub fn check_all(&self, session_id: &str) -> Vec<GuardrailCheckResult> {
        let mut sessions = self.sessions.lock();
        let (complexity, tier, counters) = sessions
            .get_mut(session_id)
            .expect("start_session must be called before check_all");

        let turns_limit = GuardrailConfig::adjusted_limit(self.config.max_turns as f64, *complexity, *tier);
        let tool_calls_limit =
            GuardrailConfig::adjusted_limit(self.config.max_tool_calls as f64, *complexity, *tier);
        let tokens_limit = GuardrailConfig::adjusted_limit(self.config.max_tokens as f64, *complexity, *tier);
        let time_limit =
            GuardrailConfig::adjusted_limit(self.config.max_execution_time.as_secs_f64(), *complexity, *tier);
        let depth_limit = GuardrailConfig::adjusted_limit(self.config.max_depth as f64, *complexity, *tier);

        let results = vec![
            self.check(GuardrailDimension::Turns, "turns", counters.turns as f64, turns_limit as f64),
            self.check(
                GuardrailDimension::ToolCalls,
                "tool_calls",
                counters.tool_calls as f64,
                tool_calls_limit as f64,
            ),
            self.check(GuardrailDimension::Tokens, "tokens", counters.tokens as f64, tokens_limit as f64),
            self.check(
                GuardrailDimension::ExecutionTime,
                "execution_time",
                counters.started_at.elapsed().as_secs_f64(),
                time_limit as f64,
            ),
            self.check(GuardrailDimension::Depth, "depth", counters.depth as f64, depth_limit as f64),
        ];

        counters.history.extend(results.iter().cloned());
        results
    }

    pub fn blocking_issues(&self, session_id: &str) -> Vec<GuardrailCheckResult> {
        self.check_all(session_id)
            .into_iter()
            .filter(|r| r.action == GuardrailAction::Block)
            .collect()
    }

    pub fn record_turn(&self, session_id: &str) {
        if let Some((_, _, c)) = self.sessions.lock().get_mut(session_id) {
            c.turns += 1;
        }
    }

    pub fn record_tool_call(&self, session_id: &str) {
        if let Some((_, _, c)) = self.sessions.lock().get_mut(session_id) {
            c.tool_calls += 1;
        }
    }

    pub fn record_tokens(&self, session_id: &str, tokens: u64) {
        if let Some((_, _, c)) = self.sessions.lock().get_mut(session_id) {
            c.tokens += tokens;
        }
    }

    pub fn enter_depth(&self, session_id: &str) {
        if let Some((_, _, c)) = self.sessions.lock().get_mut(session_id) {
            c.depth += 1;
        }
    }

    pub fn exit_depth(&self, session_id: &str) {
        if let Some((_, _, c)) = self.sessions.lock().get_mut(session_id) {
            c.depth = c.depth.saturating_sub(1);
        }
    }

    /// Human-readable tuning suggestions, surfaced on the dashboard/debug
    /// endpoint (not on the hot path) — see SPEC_FULL.md §B.2.
    pub fn suggest_adjustments(&self, session_id: &str) -> Vec<String> {
        self.check_all(session_id)
            .into_iter()
            .filter(|r| r.usage_ratio >= self.config.warn_threshold)
            .map(|r| format!("{} is at {:.0}% of budget — consider raising its limit", r.dimension, r.usage_ratio * 100.0))
            .collect()
    }

    pub fn end_session(&self, session_id: &str) {
        self.sessions.lock().remove(session_id);
    }

    /// Checks `spent_usd` against the configured cost-gate thresholds.
    /// `Some(true)` = urgent threshold crossed, `Some(false)` = soft
    /// threshold crossed, `None` = under both (or the gate is unconfigured).
    pub fn cost_gate_check(&self, spent_usd: f64) -> Option<bool> {
        if let Some(urgent) = self.config.cost_urgent_usd {
            if spent_usd >= urgent {
                return Some(true);
            }
        }
        if let Some(soft) = self.config.cost_soft_usd {
            if spent_usd >= soft {
                return Some(false);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adjusted_limit_floors_and_floors_at_one() {
        assert_eq!(GuardrailConfig::adjusted_limit(15.0, Complexity::Simple, Tier::Free), 3);
        assert_eq!(GuardrailConfig::adjusted_limit(1.0, Complexity::Simple, Tier::Free), 1);
    }

    #[test]
    fn block_when_budget_exhausted() {
        let guardrails = AdaptiveGuardrails::new(GuardrailConfig {
            max_turns: 2,
            ..Default::default()
        });
        guardrails.start_session("s1", Complexity::Medium, Tier::Pro);
        guardrails.record_turn("s1");
        guardrails.record_turn("s1");
        let results = guardrails.check_all("s1");
        let turns = results.iter().find(|r| r.dimension == "turns").unwrap();
        assert_eq!(turns.action, GuardrailAction::Block);
    }

    #[test]
    fn warn_before_block() {
        let guardrails = AdaptiveGuardrails::new(GuardrailConfig {
            max_tool_calls: 10,
            ..Default::default()
        });
        guardrails.start_session("s1", Complexity::Medium, Tier::Pro);
        for _ in 0..9 {
            guardrails.record_tool_call("s1");
        }
        let results = guardrails.check_all("s1");
        let tc = results.iter().find(|r| r.dimension == "tool_calls").unwrap();
        assert_eq!(tc.action, GuardrailAction::Warn);
    }

    #[test]
    fn cost_gate_disabled_by_default() {
        let guardrails = AdaptiveGuardrails::new(GuardrailConfig::default());
        assert_eq!(guardrails.cost_gate_check(1_000_000.0), None);
    }

    #[test]
    fn cost_gate_reports_soft_then_urgent() {
        let guardrails = AdaptiveGuardrails::new(GuardrailConfig {
            cost_soft_usd: Some(1.0),
            cost_urgent_usd: Some(5.0),
            ..Default::default()
        });
        assert_eq!(guardrails.cost_gate_check(0.5), None);
        assert_eq!(guardrails.cost_gate_check(1.5), Some(false));
        assert_eq!(guardrails.cost_gate_check(5.5), Some(true));
    }
}
