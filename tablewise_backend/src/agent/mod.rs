pub mod prompts;
pub mod state;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use flume::Sender;

use crate::catalog::document_id;
use crate::embedding::Embedder;
use crate::executor::SqlExecutor;
use crate::llm_client::{complete_as, LanguageModel};
use crate::memory::ConversationTurn;
use crate::table_index::TableIndex;

pub use state::{decide, Outcome, Route, RunOutcome, RunState, Stage};

use prompts::{SqlQueryOutput, ValidationOutput};

/// Limits and table-selection rules for the control loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentPolicy {
    /// Failed generate/execute/validate cycles tolerated per run.
    pub max_retries: u32,
    /// Hard cap on stage transitions per run, independent of retries.
    pub step_limit: usize,
    pub table_top_k: usize,
    /// Rows rendered into prompts.
    pub max_result_rows: usize,
    /// Fact table -> dimension tables pulled in whenever the fact table is selected.
    pub forced_tables: BTreeMap<String, Vec<String>>,
}

impl Default for AgentPolicy {
    fn default() -> Self {
        let mut forced_tables = BTreeMap::new();
        forced_tables.insert(
            "vendas".to_string(),
            vec!["clientes".to_string(), "produtos".to_string()],
        );
        Self {
            max_retries: 3,
            step_limit: 15,
            table_top_k: 3,
            max_result_rows: 200,
            forced_tables,
        }
    }
}

#[derive(Debug, Clone)]
pub enum AgentEvent {
    StageEntered {
        session_id: String,
        stage: Stage,
    },
    SqlGenerated {
        session_id: String,
        sql: String,
    },
    SqlFailed {
        session_id: String,
        error: String,
    },
    Validated {
        session_id: String,
        relevant: bool,
    },
    RetryScheduled {
        session_id: String,
        retry_count: u32,
    },
    Answered {
        session_id: String,
        outcome: Outcome,
    },
    MemoryCompacted {
        session_id: String,
        before: usize,
        after: usize,
    },
    Error(String),
}

/// The retrieval, generation, execution and validation loop bound to one
/// database connection and dialect.
pub struct SqlAgent {
    session_id: String,
    dialect: String,
    llm: Arc<dyn LanguageModel>,
    embedder: Arc<dyn Embedder>,
    index: Arc<TableIndex>,
    executor: Arc<dyn SqlExecutor>,
    policy: AgentPolicy,
    event_tx: Option<Sender<AgentEvent>>,
}

impl SqlAgent {
    pub fn new(
        session_id: impl Into<String>,
        dialect: impl Into<String>,
        llm: Arc<dyn LanguageModel>,
        embedder: Arc<dyn Embedder>,
        index: Arc<TableIndex>,
        executor: Arc<dyn SqlExecutor>,
        policy: AgentPolicy,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            dialect: dialect.into(),
            llm,
            embedder,
            index,
            executor,
            policy,
            event_tx: None,
        }
    }

    pub fn with_events(mut self, event_tx: Sender<AgentEvent>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    pub fn dialect(&self) -> &str {
        &self.dialect
    }

    fn emit(&self, event: AgentEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }

    /// Run one question through the loop. Errors only escape when table
    /// selection itself cannot run; everything after that ends in an answer.
    pub async fn run(
        &self,
        question: &str,
        history: Vec<ConversationTurn>,
    ) -> Result<RunOutcome> {
        let mut state = RunState::new(question, history);
        let mut stage = Stage::SelectTables;
        let mut steps = 0usize;

        tracing::info!("[{}] Question: {}", self.session_id, question);

        while stage != Stage::Terminal {
            if steps >= self.policy.step_limit && stage != Stage::SynthesizeAnswer {
                tracing::warn!(
                    "[{}] Step limit of {} reached at {}; answering with what we have",
                    self.session_id,
                    self.policy.step_limit,
                    stage.as_str()
                );
                let marker = format!("Step limit of {} reached.", self.policy.step_limit);
                state.last_error = Some(match state.last_error.take() {
                    Some(previous) => format!("{} {}", marker, previous),
                    None => marker,
                });
                stage = Stage::SynthesizeAnswer;
            }

            steps += 1;
            tracing::debug!("[{}] Stage {} (step {})", self.session_id, stage.as_str(), steps);
            self.emit(AgentEvent::StageEntered {
                session_id: self.session_id.clone(),
                stage,
            });

            stage = match stage {
                Stage::SelectTables => {
                    self.select_tables(&mut state).await?;
                    Stage::GenerateSql
                }
                Stage::GenerateSql => {
                    if self.generate_sql(&mut state).await {
                        Stage::ExecuteSql
                    } else {
                        self.route(&state).next_stage()
                    }
                }
                Stage::ExecuteSql => {
                    self.execute_sql(&mut state).await;
                    Stage::Validate
                }
                Stage::Validate => {
                    self.validate(&mut state).await;
                    self.route(&state).next_stage()
                }
                Stage::SynthesizeAnswer => {
                    self.synthesize_answer(&mut state).await;
                    Stage::Terminal
                }
                Stage::Terminal => Stage::Terminal,
            };
        }

        let outcome = if state.last_error.is_some() {
            Outcome::Degraded
        } else {
            Outcome::Answered
        };
        self.emit(AgentEvent::Answered {
            session_id: self.session_id.clone(),
            outcome,
        });

        Ok(RunOutcome {
            answer: state.final_answer.unwrap_or_default(),
            outcome,
            sql_query: state.sql_query,
            retry_count: state.retry_count,
            steps,
        })
    }

    /// Decision point after a failed generation or a validation.
    fn route(&self, state: &RunState) -> Route {
        let route = decide(state, self.policy.max_retries);
        match route {
            Route::Success => {
                tracing::info!("[{}] Validation succeeded; writing answer", self.session_id);
            }
            Route::Retry => {
                tracing::warn!(
                    "[{}] Attempt {}/{} failed; regenerating SQL",
                    self.session_id,
                    state.retry_count,
                    self.policy.max_retries
                );
                self.emit(AgentEvent::RetryScheduled {
                    session_id: self.session_id.clone(),
                    retry_count: state.retry_count,
                });
            }
            Route::LimitReached => {
                tracing::warn!(
                    "[{}] Retry limit of {} reached; giving up",
                    self.session_id,
                    self.policy.max_retries
                );
            }
        }
        route
    }

    pub(crate) async fn select_tables(&self, state: &mut RunState) -> Result<()> {
        let query_embedding = self
            .embedder
            .embed_one(&state.question)
            .await
            .context("Failed to embed question for table selection")?;

        let matches = self
            .index
            .query(&query_embedding, self.policy.table_top_k)
            .await;

        state.selected_tables.clear();
        state.selected_schemas.clear();
        for found in matches {
            let table = found.table.metadata;
            if !state.selected_tables.contains(&table.table_name) {
                state.selected_schemas.push(table.schema_ddl);
                state.selected_tables.push(table.table_name);
            }
        }

        let retrieved = state.selected_tables.clone();
        for fact in &retrieved {
            let Some(dimensions) = self.policy.forced_tables.get(fact) else {
                continue;
            };
            for dimension in dimensions {
                if state.selected_tables.contains(dimension) {
                    continue;
                }
                match self.index.get(&document_id(dimension)).await {
                    Some(table) => {
                        state.selected_schemas.push(table.metadata.schema_ddl);
                        state.selected_tables.push(table.metadata.table_name);
                    }
                    None => tracing::debug!(
                        "[{}] Forced table '{}' for '{}' is not configured",
                        self.session_id,
                        dimension,
                        fact
                    ),
                }
            }
        }

        tracing::debug!(
            "[{}] Selected tables: {}",
            self.session_id,
            state.selected_tables.join(", ")
        );

        state.retry_count = 0;
        state.last_error = None;
        Ok(())
    }

    /// Returns false when no usable query came back; that counts as a failed cycle.
    async fn generate_sql(&self, state: &mut RunState) -> bool {
        let messages = prompts::generation_messages(
            &self.dialect,
            &state.question,
            &state.schemas_text(),
            &state.conversation_context,
            state.last_error.as_deref(),
        );

        let generated = complete_as::<SqlQueryOutput>(
            self.llm.as_ref(),
            messages,
            &prompts::sql_query_schema(),
        )
        .await
        .and_then(|output| {
            prompts::clean_sql(&output.query)
                .ok_or_else(|| anyhow::anyhow!("Model returned an empty SQL query"))
        });

        match generated {
            Ok(sql) => {
                tracing::debug!("[{}] Generated SQL: {}", self.session_id, sql);
                self.emit(AgentEvent::SqlGenerated {
                    session_id: self.session_id.clone(),
                    sql: sql.clone(),
                });
                state.sql_query = Some(sql);
                state.last_error = None;
                true
            }
            Err(e) => {
                tracing::warn!("[{}] SQL generation failed: {:#}", self.session_id, e);
                state.fail(format!("SQL generation failed: {:#}", e));
                false
            }
        }
    }

    async fn execute_sql(&self, state: &mut RunState) {
        if state.retry_count >= self.policy.max_retries {
            state.last_error = Some(match state.last_error.take() {
                Some(previous) => format!("{} {}", prompts::RETRY_LIMIT_ERROR, previous),
                None => prompts::RETRY_LIMIT_ERROR.to_string(),
            });
            return;
        }

        let Some(sql) = state.sql_query.clone() else {
            state.fail("No SQL query was generated.");
            return;
        };

        match self.executor.execute(&sql).await {
            Ok(rows) => {
                tracing::debug!(
                    "[{}] Query returned {} row(s)",
                    self.session_id,
                    rows.rows.len()
                );
                state.query_result = Some(rows.render(self.policy.max_result_rows));
                state.last_error = None;
            }
            Err(e) => {
                let error = format!("Database error: {}", e);
                tracing::warn!("[{}] {}", self.session_id, error);
                self.emit(AgentEvent::SqlFailed {
                    session_id: self.session_id.clone(),
                    error: error.clone(),
                });
                state.fail(error);
            }
        }
    }

    async fn validate(&self, state: &mut RunState) {
        if state.last_error.is_some() {
            return;
        }
        if state.sql_query.is_none() || state.query_result.is_none() {
            state.fail("Nothing to validate.");
            return;
        }
        let sql = state.sql_query.clone().unwrap_or_default();
        let result = state.query_result.clone().unwrap_or_default();

        let messages = prompts::validation_messages(&state.question, &sql, &result);
        let verdict = complete_as::<ValidationOutput>(
            self.llm.as_ref(),
            messages,
            &prompts::validation_schema(),
        )
        .await
        .and_then(|output| {
            prompts::parse_verdict(&output.decision).ok_or_else(|| {
                anyhow::anyhow!("Unrecognized validation decision '{}'", output.decision)
            })
        });

        match verdict {
            Ok(relevant) => {
                tracing::debug!("[{}] Relevance verdict: {}", self.session_id, relevant);
                self.emit(AgentEvent::Validated {
                    session_id: self.session_id.clone(),
                    relevant,
                });
                if relevant {
                    state.last_error = None;
                } else {
                    state.fail(prompts::NOT_RELEVANT_ERROR);
                }
            }
            Err(e) => {
                tracing::warn!("[{}] Validation failed: {:#}", self.session_id, e);
                state.fail(format!("Validation failed: {:#}", e));
            }
        }
    }

    async fn synthesize_answer(&self, state: &mut RunState) {
        let answer = if let Some(error) = state.last_error.clone() {
            prompts::degraded_answer(&state.question, state.retry_count, Some(&error))
        } else if let Some(result) = state.query_result.clone() {
            let messages =
                prompts::answer_messages(&state.question, &result, &state.conversation_context);
            match self.llm.complete(messages).await {
                Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
                Ok(_) => prompts::fallback_answer(&result),
                Err(e) => {
                    tracing::warn!(
                        "[{}] Answer synthesis failed, returning raw result: {:#}",
                        self.session_id,
                        e
                    );
                    prompts::fallback_answer(&result)
                }
            }
        } else {
            let error = "No query result was produced.";
            state.last_error = Some(error.to_string());
            prompts::degraded_answer(&state.question, state.retry_count, Some(error))
        };

        tracing::info!("[{}] Answer: {}", self.session_id, answer);
        state.final_answer = Some(answer);
    }
}
