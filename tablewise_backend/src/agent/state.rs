use serde::{Deserialize, Serialize};

use crate::memory::ConversationTurn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    SelectTables,
    GenerateSql,
    ExecuteSql,
    Validate,
    SynthesizeAnswer,
    Terminal,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::SelectTables => "select_tables",
            Stage::GenerateSql => "generate_sql",
            Stage::ExecuteSql => "execute_sql",
            Stage::Validate => "validate",
            Stage::SynthesizeAnswer => "synthesize_answer",
            Stage::Terminal => "terminal",
        }
    }
}

/// Outcome of the decision point after validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Success,
    Retry,
    LimitReached,
}

impl Route {
    pub fn next_stage(self) -> Stage {
        match self {
            Route::Success | Route::LimitReached => Stage::SynthesizeAnswer,
            Route::Retry => Stage::GenerateSql,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Answer phrased from a validated query result.
    Answered,
    /// Retry budget or step limit exhausted; the answer reports the failure.
    Degraded,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Answered => "answered",
            Outcome::Degraded => "degraded",
        }
    }
}

/// Mutable record threaded through one run.
#[derive(Debug, Clone, Default)]
pub struct RunState {
    pub question: String,
    pub selected_tables: Vec<String>,
    pub selected_schemas: Vec<String>,
    pub sql_query: Option<String>,
    pub query_result: Option<String>,
    pub last_error: Option<String>,
    pub retry_count: u32,
    pub final_answer: Option<String>,
    pub conversation_context: Vec<ConversationTurn>,
}

impl RunState {
    pub fn new(question: impl Into<String>, conversation_context: Vec<ConversationTurn>) -> Self {
        Self {
            question: question.into(),
            conversation_context,
            ..Default::default()
        }
    }

    pub fn schemas_text(&self) -> String {
        self.selected_schemas.join("\n\n")
    }

    /// Record a recoverable failure of the current cycle.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.last_error = Some(error.into());
        self.query_result = None;
        self.retry_count += 1;
    }
}

/// Pure routing after validation.
pub fn decide(state: &RunState, max_retries: u32) -> Route {
    match state.last_error {
        None => Route::Success,
        Some(_) if state.retry_count < max_retries => Route::Retry,
        Some(_) => Route::LimitReached,
    }
}

/// What a completed run hands back to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub answer: String,
    pub outcome: Outcome,
    pub sql_query: Option<String>,
    pub retry_count: u32,
    pub steps: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(error: Option<&str>, retries: u32) -> RunState {
        RunState {
            last_error: error.map(str::to_string),
            retry_count: retries,
            ..RunState::new("q", Vec::new())
        }
    }

    #[test]
    fn no_error_routes_to_success() {
        assert_eq!(decide(&state(None, 0), 3), Route::Success);
        assert_eq!(decide(&state(None, 2), 3), Route::Success);
    }

    #[test]
    fn error_under_budget_retries() {
        assert_eq!(decide(&state(Some("boom"), 1), 3), Route::Retry);
        assert_eq!(decide(&state(Some("boom"), 2), 3), Route::Retry);
    }

    #[test]
    fn error_at_budget_stops() {
        assert_eq!(decide(&state(Some("boom"), 3), 3), Route::LimitReached);
        assert_eq!(decide(&state(Some("boom"), 4), 3), Route::LimitReached);
    }

    #[test]
    fn routes_map_to_stages() {
        assert_eq!(Route::Success.next_stage(), Stage::SynthesizeAnswer);
        assert_eq!(Route::LimitReached.next_stage(), Stage::SynthesizeAnswer);
        assert_eq!(Route::Retry.next_stage(), Stage::GenerateSql);
    }

    #[test]
    fn fail_clears_result_and_counts() {
        let mut state = state(None, 0);
        state.query_result = Some("[]".to_string());
        state.fail("Database error: no such table: x");
        assert_eq!(state.retry_count, 1);
        assert!(state.query_result.is_none());
        assert_eq!(
            state.last_error.as_deref(),
            Some("Database error: no such table: x")
        );
    }
}
