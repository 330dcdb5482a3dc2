use thiserror::Error;

/// Failures that cross the agent boundary.
///
/// SQL errors and negative validations never show up here: they stay inside the
/// control loop and end in a retry or a degraded answer.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("configuration failed: {0}")]
    Configuration(String),

    #[error("agent is not configured; call configure_agent first")]
    NotConfigured,

    #[error("query execution failed: {0}")]
    Execution(String),
}

impl AgentError {
    pub fn configuration(error: impl std::fmt::Display) -> Self {
        AgentError::Configuration(error.to_string())
    }

    pub fn execution(error: &anyhow::Error) -> Self {
        AgentError::Execution(format!("{:#}", error))
    }
}

pub type AgentResult<T> = std::result::Result<T, AgentError>;
