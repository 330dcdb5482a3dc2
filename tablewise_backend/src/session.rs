use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use flume::Sender;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::agent::{AgentEvent, AgentPolicy, RunOutcome, SqlAgent};
use crate::catalog::{TableInfo, TableMetadata, TableSchema};
use crate::embedding::Embedder;
use crate::error::{AgentError, AgentResult};
use crate::executor::{SqlExecutor, SqliteExecutor};
use crate::llm_client::LanguageModel;
use crate::memory::{ConversationMemory, ConversationTurn, MemoryPolicy, Role};
use crate::table_index::{IndexedTable, TableIndex};

pub const DEFAULT_SESSION_ID: &str = "default";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbCredentials {
    pub dialect: String,
    pub connection_string: String,
}

/// Shared collaborators every session is built from.
#[derive(Clone)]
pub struct AgentServices {
    pub llm: Arc<dyn LanguageModel>,
    pub embedder: Arc<dyn Embedder>,
    pub policy: AgentPolicy,
    pub memory_policy: MemoryPolicy,
    pub event_tx: Option<Sender<AgentEvent>>,
}

/// One configured agent: its database, table index, loop and conversation.
pub struct AgentSession {
    id: String,
    tables: Vec<TableInfo>,
    configured_at: DateTime<Utc>,
    agent: SqlAgent,
    llm: Arc<dyn LanguageModel>,
    memory: Mutex<ConversationMemory>,
    event_tx: Option<Sender<AgentEvent>>,
}

impl AgentSession {
    /// Connect, introspect and index `tables`, then bind a fresh loop and an
    /// empty conversation to the connection.
    pub async fn configure(
        id: &str,
        credentials: &DbCredentials,
        tables: Vec<TableInfo>,
        services: &AgentServices,
    ) -> AgentResult<Self> {
        let executor =
            SqliteExecutor::connect(&credentials.dialect, &credentials.connection_string)
                .map_err(|e| AgentError::configuration(format!("{:#}", e)))?;
        Self::configure_with_executor(
            id,
            &credentials.dialect,
            Arc::new(executor),
            tables,
            services,
        )
        .await
    }

    pub async fn configure_with_executor(
        id: &str,
        dialect: &str,
        executor: Arc<dyn SqlExecutor>,
        tables: Vec<TableInfo>,
        services: &AgentServices,
    ) -> AgentResult<Self> {
        let tables = dedupe_tables(tables);
        if tables.is_empty() {
            return Err(AgentError::configuration(
                "at least one table must be configured",
            ));
        }

        let index = index_tables(executor.as_ref(), services.embedder.as_ref(), &tables).await?;

        let mut agent = SqlAgent::new(
            id,
            dialect.trim().to_ascii_lowercase(),
            services.llm.clone(),
            services.embedder.clone(),
            Arc::new(index),
            executor,
            services.policy.clone(),
        );
        if let Some(tx) = &services.event_tx {
            agent = agent.with_events(tx.clone());
        }

        tracing::info!(
            "Session '{}' configured with {} table(s): {}",
            id,
            tables.len(),
            tables
                .iter()
                .map(|t| t.table_name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );

        Ok(Self {
            id: id.to_string(),
            tables,
            configured_at: Utc::now(),
            agent,
            llm: services.llm.clone(),
            memory: Mutex::new(ConversationMemory::new(services.memory_policy)),
            event_tx: services.event_tx.clone(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tables(&self) -> &[TableInfo] {
        &self.tables
    }

    pub fn dialect(&self) -> &str {
        self.agent.dialect()
    }

    pub fn configured_at(&self) -> DateTime<Utc> {
        self.configured_at
    }

    pub async fn history(&self) -> Vec<ConversationTurn> {
        self.memory.lock().await.turns().to_vec()
    }

    /// Answer `question` with the conversation so far as context, then record
    /// the exchange.
    pub async fn query(&self, question: &str) -> AgentResult<RunOutcome> {
        let history = self.history().await;

        let outcome = self.agent.run(question, history).await.map_err(|e| {
            tracing::error!("[{}] Query failed: {:#}", self.id, e);
            self.emit(AgentEvent::Error(format!("{:#}", e)));
            AgentError::execution(&e)
        })?;

        // Append and compact under one lock so concurrent queries never lose turns.
        let mut memory = self.memory.lock().await;
        memory.append(ConversationTurn::new(Role::User, question));
        memory.append(ConversationTurn::new(Role::Assistant, outcome.answer.clone()));
        if let Some(compaction) = memory.maybe_compact(self.llm.as_ref()).await {
            self.emit(AgentEvent::MemoryCompacted {
                session_id: self.id.clone(),
                before: compaction.before,
                after: compaction.after,
            });
        }

        Ok(outcome)
    }

    fn emit(&self, event: AgentEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }
}

fn dedupe_tables(tables: Vec<TableInfo>) -> Vec<TableInfo> {
    let mut unique: Vec<TableInfo> = Vec::with_capacity(tables.len());
    for table in tables {
        let table = TableInfo {
            table_name: table.table_name.trim().to_string(),
            description: table.description,
        };
        if table.table_name.is_empty() {
            continue;
        }
        match unique
            .iter_mut()
            .find(|existing| existing.table_name == table.table_name)
        {
            Some(existing) => existing.description = table.description,
            None => unique.push(table),
        }
    }
    unique
}

/// Build a fresh table index for `tables`.
pub async fn index_tables(
    executor: &dyn SqlExecutor,
    embedder: &dyn Embedder,
    tables: &[TableInfo],
) -> AgentResult<TableIndex> {
    let index = TableIndex::new();
    index_tables_into(&index, executor, embedder, tables).await?;
    Ok(index)
}

/// Introspect and embed `tables`, replacing their entries in `index`.
pub async fn index_tables_into(
    index: &TableIndex,
    executor: &dyn SqlExecutor,
    embedder: &dyn Embedder,
    tables: &[TableInfo],
) -> AgentResult<()> {
    let mut metadata = Vec::with_capacity(tables.len());
    for table in tables {
        let columns = executor
            .describe_table(&table.table_name)
            .await
            .map_err(|e| {
                AgentError::configuration(format!(
                    "failed to inspect table '{}': {:#}",
                    table.table_name, e
                ))
            })?;
        if columns.is_empty() {
            return Err(AgentError::configuration(format!(
                "table '{}' has no columns or does not exist",
                table.table_name
            )));
        }

        let info = if table.description.trim().is_empty() {
            TableInfo {
                table_name: table.table_name.clone(),
                description: format!("Table {}", table.table_name),
            }
        } else {
            table.clone()
        };
        let schema = TableSchema::new(&table.table_name, columns);
        metadata.push(TableMetadata::from_schema(&info, &schema));
    }

    let documents = metadata
        .iter()
        .map(|meta| meta.description.clone())
        .collect::<Vec<_>>();
    let embeddings = embedder.embed(&documents).await.map_err(|e| {
        AgentError::configuration(format!("failed to index table descriptions: {:#}", e))
    })?;
    if embeddings.len() != metadata.len() {
        return Err(AgentError::configuration(format!(
            "embedder returned {} vectors for {} tables",
            embeddings.len(),
            metadata.len()
        )));
    }

    index
        .upsert(
            metadata
                .into_iter()
                .zip(embeddings)
                .map(|(meta, embedding)| IndexedTable::new(meta, embedding))
                .collect(),
        )
        .await;
    tracing::debug!("Table index holds {} document(s)", index.len().await);
    Ok(())
}

/// Configured sessions by id. Replaces a single process-wide agent.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<AgentSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `session`, replacing any previous session with the same id.
    /// Queries already running keep the session they started with.
    pub async fn insert(&self, session: AgentSession) -> Arc<AgentSession> {
        let session = Arc::new(session);
        let replaced = self
            .sessions
            .write()
            .await
            .insert(session.id().to_string(), session.clone());
        if replaced.is_some() {
            tracing::info!("Session '{}' reconfigured; previous memory discarded", session.id());
        }
        session
    }

    pub async fn get(&self, id: &str) -> AgentResult<Arc<AgentSession>> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or(AgentError::NotConfigured)
    }

    pub async fn remove(&self, id: &str) -> bool {
        self.sessions.write().await.remove(id).is_some()
    }
}
