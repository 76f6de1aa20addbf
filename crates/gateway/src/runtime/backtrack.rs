//! Backtrack controller: classifies a failure as infrastructure or
//! business-logic, then decides whether the turn loop should continue,
//! backtrack (and how), fail gracefully, or escalate to a human.
//!
//! Grounded directly on `core/agent/backtrack/manager.py` and
//! `error_classifier.py` — the closest thing to a line-for-line port in
//! this codebase, re-expressed as enums and match arms instead of
//! dict-of-regex-lists.

use std::collections::HashMap;

use parking_lot::Mutex;
use regex::RegexSet;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Classification
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorLayer {
    Infrastructure,
    BusinessLogic,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    ApiTimeout,
    RateLimit,
    ServiceUnavailable,
    NetworkError,
    AuthenticationError,
    QuotaExceeded,
    PlanInvalid,
    ToolMismatch,
    ResultUnsatisfactory,
    IntentUnclear,
    ParameterError,
    ContextInsufficient,
    ExecutionLogicError,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BacktrackType {
    PlanReplan,
    ToolReplace,
    IntentClarify,
    ParamAdjust,
    ContextEnrich,
    NoBacktrack,
}

impl BacktrackType {
    /// Escalation ladder used when a strategy has already been tried for
    /// the current step: PARAM_ADJUST → TOOL_REPLACE →
    /// PLAN_REPLAN/CONTEXT_ENRICH → INTENT_CLARIFY → NO_BACKTRACK.
    fn escalate(self) -> BacktrackType {
        match self {
            BacktrackType::ParamAdjust => BacktrackType::ToolReplace,
            BacktrackType::ToolReplace => BacktrackType::PlanReplan,
            BacktrackType::PlanReplan => BacktrackType::ContextEnrich,
            BacktrackType::ContextEnrich => BacktrackType::IntentClarify,
            BacktrackType::IntentClarify => BacktrackType::NoBacktrack,
            BacktrackType::NoBacktrack => BacktrackType::NoBacktrack,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClassifiedError {
    pub layer: ErrorLayer,
    pub category: ErrorCategory,
    pub backtrack_type: BacktrackType,
    pub retryable: bool,
}

impl ClassifiedError {
    pub fn is_infrastructure_error(&self) -> bool {
        self.layer == ErrorLayer::Infrastructure
    }

    pub fn is_business_logic_error(&self) -> bool {
        self.layer == ErrorLayer::BusinessLogic
    }

    pub fn needs_backtrack(&self) -> bool {
        self.backtrack_type != BacktrackType::NoBacktrack
    }
}

pub struct ErrorClassifier {
    infra_patterns: Vec<(RegexSet, ErrorCategory)>,
    business_patterns: Vec<(RegexSet, ErrorCategory)>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorClassifier {
    pub fn new() -> Self {
        let infra_patterns = vec![
            (RegexSet::new([r"timed? ?out", r"deadline exceeded"]).unwrap(), ErrorCategory::ApiTimeout),
            (RegexSet::new([r"rate limit", r"too many requests", r"429"]).unwrap(), ErrorCategory::RateLimit),
            (
                RegexSet::new([r"service unavailable", r"503", r"bad gateway", r"502"]).unwrap(),
                ErrorCategory::ServiceUnavailable,
            ),
            (
                RegexSet::new([r"connection (reset|refused)", r"network", r"dns"]).unwrap(),
                ErrorCategory::NetworkError,
            ),
            (
                RegexSet::new([r"unauthorized", r"401", r"invalid api key", r"forbidden", r"403"]).unwrap(),
                ErrorCategory::AuthenticationError,
            ),
            (RegexSet::new([r"quota exceeded", r"insufficient (credits|balance)"]).unwrap(), ErrorCategory::QuotaExceeded),
        ];

        let business_patterns = vec![
            (RegexSet::new([r"invalid plan", r"plan (step )?not found"]).unwrap(), ErrorCategory::PlanInvalid),
            (RegexSet::new([r"unknown tool", r"tool .* not (found|available)"]).unwrap(), ErrorCategory::ToolMismatch),
            (
                RegexSet::new([r"unsatisfactory result", r"result does not match", r"empty result"]).unwrap(),
                ErrorCategory::ResultUnsatisfactory,
            ),
            (RegexSet::new([r"unclear intent", r"ambiguous request"]).unwrap(), ErrorCategory::IntentUnclear),
            (RegexSet::new([r"invalid (parameter|argument)", r"missing required field"]).unwrap(), ErrorCategory::ParameterError),
            (RegexSet::new([r"insufficient context", r"not enough information"]).unwrap(), ErrorCategory::ContextInsufficient),
            (
                RegexSet::new([r"logic error", r"assertion failed", r"invariant violated"]).unwrap(),
                ErrorCategory::ExecutionLogicError,
            ),
        ];

        Self { infra_patterns, business_patterns }
    }

    pub fn classify(&self, message: &str, tool_name: Option<&str>, plan_id: Option<&str>, near_max_turns: bool) -> ClassifiedError {
        let lower = message.to_lowercase();

        if let Some((_, category)) = self.infra_patterns.iter().find(|(set, _)| set.is_match(&lower)) {
            return ClassifiedError {
                layer: ErrorLayer::Infrastructure,
                category: *category,
                backtrack_type: BacktrackType::NoBacktrack,
                retryable: matches!(
                    category,
                    ErrorCategory::ApiTimeout | ErrorCategory::RateLimit | ErrorCategory::ServiceUnavailable | ErrorCategory::NetworkError
                ),
            };
        }

        if let Some((_, category)) = self.business_patterns.iter().find(|(set, _)| set.is_match(&lower)) {
            return ClassifiedError {
                layer: ErrorLayer::BusinessLogic,
                category: *category,
                backtrack_type: Self::strategy_for(*category),
                retryable: false,
            };
        }

        // Context-based refinement when no pattern matched.
        let (category, layer) = if tool_name.is_some() {
            (ErrorCategory::ToolMismatch, ErrorLayer::BusinessLogic)
        } else if plan_id.is_some() {
            (ErrorCategory::PlanInvalid, ErrorLayer::BusinessLogic)
        } else if near_max_turns {
            (ErrorCategory::ContextInsufficient, ErrorLayer::BusinessLogic)
        } else {
            (ErrorCategory::Unknown, ErrorLayer::Unknown)
        };

        ClassifiedError {
            layer,
            category,
            backtrack_type: Self::strategy_for(category),
            retryable: false,
        }
    }

    pub fn classify_tool_error(&self, message: &str, tool_name: &str) -> ClassifiedError {
        self.classify(message, Some(tool_name), None, false)
    }

    pub fn classify_plan_error(&self, message: &str, plan_id: &str) -> ClassifiedError {
        self.classify(message, None, Some(plan_id), false)
    }

    pub fn classify_llm_error(&self, message: &str) -> ClassifiedError {
        self.classify(message, None, None, false)
    }

    fn strategy_for(category: ErrorCategory) -> BacktrackType {
        match category {
            ErrorCategory::PlanInvalid => BacktrackType::PlanReplan,
            ErrorCategory::ToolMismatch => BacktrackType::ToolReplace,
            ErrorCategory::ResultUnsatisfactory => BacktrackType::ParamAdjust,
            ErrorCategory::IntentUnclear => BacktrackType::IntentClarify,
            ErrorCategory::ParameterError => BacktrackType::ParamAdjust,
            ErrorCategory::ContextInsufficient => BacktrackType::ContextEnrich,
            ErrorCategory::ExecutionLogicError => BacktrackType::PlanReplan,
            _ => BacktrackType::NoBacktrack,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Decision
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BacktrackDecision {
    Continue,
    Backtrack,
    FailGracefully,
    Escalate,
}

#[derive(Debug, Clone)]
pub struct BacktrackResult {
    pub decision: BacktrackDecision,
    pub backtrack_type: BacktrackType,
    pub reason: String,
    pub confidence: f32,
}

const MAX_BACKTRACKS: u32 = 3;
const MAX_HISTORY: usize = 20;

struct SessionBacktrackState {
    count: u32,
    /// Strategies already tried for the current step, keyed by step index.
    tried: HashMap<u32, Vec<BacktrackType>>,
    history: Vec<BacktrackResult>,
}

impl SessionBacktrackState {
    fn new() -> Self {
        Self {
            count: 0,
            tried: HashMap::new(),
            history: Vec::new(),
        }
    }

    fn push_history(&mut self, result: BacktrackResult) {
        self.history.push(result);
        if self.history.len() > MAX_HISTORY {
            self.history.remove(0);
        }
    }
}

/// Per-session backtrack bookkeeping plus error classification. LLM-mode
/// decisions (an actual model call to pick a strategy) are out of scope
/// for this controller — the turn loop supplies an optional pre-computed
/// LLM suggestion via `decide_with_llm_hint`; when absent, rule-based
/// decisioning is used directly.
pub struct BacktrackController {
    classifier: ErrorClassifier,
    sessions: Mutex<HashMap<String, SessionBacktrackState>>,
}

impl Default for BacktrackController {
    fn default() -> Self {
        Self::new()
    }
}

impl BacktrackController {
    pub fn new() -> Self {
        Self {
            classifier: ErrorClassifier::new(),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn classifier(&self) -> &ErrorClassifier {
        &self.classifier
    }

    /// Evaluate an error and decide what the turn loop should do next.
    /// `llm_hint` is an optional (backtrack_type, confidence) pair already
    /// produced by an LLM-mode decision call upstream; when `None`, falls
    /// back to the rule-based escalation ladder.
    pub fn evaluate_and_decide(
        &self,
        session_id: &str,
        step_index: u32,
        error: &ClassifiedError,
        llm_hint: Option<(BacktrackType, f32)>,
    ) -> BacktrackResult {
        let mut sessions = self.sessions.lock();
        let state = sessions.entry(session_id.to_string()).or_insert_with(SessionBacktrackState::new);

        if state.count >= MAX_BACKTRACKS {
            let result = BacktrackResult {
                decision: BacktrackDecision::FailGracefully,
                backtrack_type: BacktrackType::NoBacktrack,
                reason: format!("backtrack budget exhausted ({}/{MAX_BACKTRACKS})", state.count),
                confidence: 1.0,
            };
            state.push_history(result.clone());
            return result;
        }

        if error.is_infrastructure_error() {
            let result = BacktrackResult {
                decision: BacktrackDecision::Continue,
                backtrack_type: BacktrackType::NoBacktrack,
                reason: format!("infrastructure error ({:?}), delegating to retry layer", error.category),
                confidence: 1.0,
            };
            state.push_history(result.clone());
            return result;
        }

        let (backtrack_type, confidence) = if let Some((hinted, conf)) = llm_hint {
            (hinted, conf)
        } else {
            (error.backtrack_type, 0.6)
        };

        let tried_for_step = state.tried.entry(step_index).or_default();
        let final_type = if tried_for_step.contains(&backtrack_type) {
            backtrack_type.escalate()
        } else {
            backtrack_type
        };
        tried_for_step.push(final_type);

        state.count += 1;
        let decision = match final_type {
            BacktrackType::NoBacktrack => BacktrackDecision::FailGracefully,
            BacktrackType::IntentClarify => BacktrackDecision::Escalate,
            _ => BacktrackDecision::Backtrack,
        };

        let result = BacktrackResult {
            decision,
            backtrack_type: final_type,
            reason: format!("business-logic error ({:?}) -> {:?}", error.category, final_type),
            confidence,
        };
        state.push_history(result.clone());
        result
    }

    pub fn history(&self, session_id: &str) -> Vec<BacktrackResult> {
        self.sessions
            .lock()
            .get(session_id)
            .map(|s| s.history.clone())
            .unwrap_or_default()
    }

    pub fn clear_history(&self, session_id: &str) {
        self.sessions.lock().remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infra_error_continues() {
        let controller = BacktrackController::new();
        let classified = controller.classifier().classify_llm_error("request timed out after 30s");
        assert!(classified.is_infrastructure_error());
        let result = controller.evaluate_and_decide("s1", 0, &classified, None);
        assert_eq!(result.decision, BacktrackDecision::Continue);
    }

    #[test]
    fn budget_exhaustion_fails_gracefully() {
        let controller = BacktrackController::new();
        let classified = controller.classifier().classify_tool_error("unknown tool requested", "foo");
        for _ in 0..MAX_BACKTRACKS {
            controller.evaluate_and_decide("s1", 0, &classified, None);
        }
        let result = controller.evaluate_and_decide("s1", 0, &classified, None);
        assert_eq!(result.decision, BacktrackDecision::FailGracefully);
    }

    #[test]
    fn repeated_strategy_escalates() {
        let controller = BacktrackController::new();
        let classified = controller.classifier().classify_tool_error("unknown tool requested", "foo");
        let first = controller.evaluate_and_decide("s1", 0, &classified, None);
        assert_eq!(first.backtrack_type, BacktrackType::ToolReplace);
        let second = controller.evaluate_and_decide("s1", 0, &classified, None);
        assert_eq!(second.backtrack_type, BacktrackType::PlanReplan);
    }
}
