// Request construction for each stage, plus shaping of the model's replies.

use serde::Deserialize;

use crate::llm_client::{Message, OutputSchema};
use crate::memory::ConversationTurn;

pub const SUMMARY_PREFIX: &str = "Summary of the earlier conversation: ";

pub const NOT_RELEVANT_ERROR: &str = "The result is not relevant to the question.";
pub const RETRY_LIMIT_ERROR: &str = "Retry limit reached.";

#[derive(Debug, Deserialize)]
pub struct SqlQueryOutput {
    pub query: String,
}

#[derive(Debug, Deserialize)]
pub struct ValidationOutput {
    pub decision: String,
}

pub fn sql_query_schema() -> OutputSchema {
    OutputSchema {
        name: "sql_query",
        description: "The SQL query that answers the question.",
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The complete SQL query to execute."
                }
            },
            "required": ["query"]
        }),
    }
}

pub fn validation_schema() -> OutputSchema {
    OutputSchema {
        name: "validation",
        description: "Whether the query result answers the question.",
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "decision": {
                    "type": "string",
                    "enum": ["yes", "no"],
                    "description": "'yes' if the result answers the question, 'no' otherwise."
                }
            },
            "required": ["decision"]
        }),
    }
}

fn history_messages(history: &[ConversationTurn]) -> impl Iterator<Item = Message> + '_ {
    history.iter().map(ConversationTurn::to_message)
}

pub fn generation_messages(
    dialect: &str,
    question: &str,
    schemas: &str,
    history: &[ConversationTurn],
    last_error: Option<&str>,
) -> Vec<Message> {
    let system = format!(
        "You translate questions into SQL for a {dialect} database.\n\
        Produce exactly one syntactically valid {dialect} query that answers the question \
        using only the tables and columns in the schemas you are given.\n\
        Use earlier conversation turns to resolve follow-up questions.\n\
        Return the query through the sql_query function, without explanations."
    );

    let mut user = format!(
        "Question: {}\n\nSchemas:\n{}\n",
        question,
        if schemas.trim().is_empty() {
            "(no tables matched)"
        } else {
            schemas
        }
    );
    if let Some(error) = last_error {
        user.push_str(&format!(
            "\nThe previous query failed. Previous error, fix it: {}\n\
            Write a corrected query that addresses this error.\n",
            error
        ));
    }

    let mut messages = vec![Message::system(system)];
    messages.extend(history_messages(history));
    messages.push(Message::user(user));
    messages
}

pub fn validation_messages(question: &str, sql: &str, result: &str) -> Vec<Message> {
    vec![
        Message::system(
            "You check whether a SQL query result answers a question. \
            Reply through the validation function with 'yes' or 'no'.",
        ),
        Message::user(format!(
            "The question was: \"{}\"\n\
            The executed query was: \"{}\"\n\
            The result was: {}\n\n\
            Does this result answer the question?",
            question, sql, result
        )),
    ]
}

pub fn answer_messages(question: &str, result: &str, history: &[ConversationTurn]) -> Vec<Message> {
    let mut messages = vec![Message::system(
        "You answer questions about a database in clear natural language, \
        using only the data you are given. Reply in the language of the question.",
    )];
    messages.extend(history_messages(history));
    messages.push(Message::user(format!(
        "Based on the question '{}' and the data {}, write a clear answer.",
        question, result
    )));
    messages
}

pub fn summary_messages(turns: &[ConversationTurn]) -> Vec<Message> {
    let transcript = turns
        .iter()
        .map(|turn| format!("{}: {}", turn.role.as_str(), turn.content))
        .collect::<Vec<_>>()
        .join("\n");

    vec![
        Message::system(
            "Summarize the conversation below in a few sentences. Keep table names, \
            filters, entities and figures the user may refer back to.",
        ),
        Message::user(transcript),
    ]
}

pub fn degraded_answer(question: &str, retry_count: u32, last_error: Option<&str>) -> String {
    format!(
        "Sorry, I could not answer \"{}\" after {} attempt(s). Last error: {}",
        question,
        retry_count,
        last_error.unwrap_or("unknown error")
    )
}

/// Plain answer used when the synthesis call itself fails.
pub fn fallback_answer(result: &str) -> String {
    format!("Here is what the database returned: {}", result)
}

/// Trim the model's query and strip markdown fences. `None` when nothing is left.
pub fn clean_sql(raw: &str) -> Option<String> {
    let mut sql = raw.trim();
    if let Some(rest) = sql.strip_prefix("```") {
        let rest = rest
            .strip_prefix("sql")
            .or_else(|| rest.strip_prefix("SQL"))
            .unwrap_or(rest);
        sql = rest.trim_end().strip_suffix("```").unwrap_or(rest).trim();
    }
    if sql.is_empty() {
        None
    } else {
        Some(sql.to_string())
    }
}

/// `Some(true)` for a positive verdict, `Some(false)` for negative, `None` otherwise.
pub fn parse_verdict(raw: &str) -> Option<bool> {
    let normalized = raw
        .trim()
        .trim_matches(|c: char| c == '.' || c == '!' || c == '"' || c == '\'')
        .to_lowercase();
    match normalized.as_str() {
        "yes" | "y" | "sim" | "true" | "relevant" => Some(true),
        "no" | "n" | "não" | "nao" | "false" | "not relevant" | "irrelevant" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Role;

    #[test]
    fn generation_prompt_carries_previous_error_verbatim() {
        let error = "Database error: near \"SELEC\": syntax error";
        let messages = generation_messages(
            "sqlite",
            "who spent most?",
            "CREATE TABLE t (\n  id INTEGER\n);",
            &[],
            Some(error),
        );
        let user = &messages.last().unwrap().content;
        assert!(user.contains(&format!("Previous error, fix it: {}", error)));
        assert!(messages[0].content.contains("sqlite"));
    }

    #[test]
    fn generation_prompt_without_error_has_no_fix_request() {
        let messages = generation_messages("sqlite", "q", "", &[], None);
        let user = &messages.last().unwrap().content;
        assert!(!user.contains("Previous error"));
        assert!(user.contains("(no tables matched)"));
    }

    #[test]
    fn generation_prompt_includes_history_in_order() {
        let history = vec![
            ConversationTurn::new(Role::User, "how many clients?"),
            ConversationTurn::new(Role::Assistant, "5"),
        ];
        let messages = generation_messages("sqlite", "and products?", "", &history, None);
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[1].role, "user");
        assert_eq!(messages[2].content, "5");
    }

    #[test]
    fn clean_sql_strips_fences() {
        assert_eq!(
            clean_sql("```sql\nSELECT 1;\n```").as_deref(),
            Some("SELECT 1;")
        );
        assert_eq!(clean_sql("  SELECT 2  ").as_deref(), Some("SELECT 2"));
        assert_eq!(clean_sql("```\n```"), None);
        assert_eq!(clean_sql("   "), None);
    }

    #[test]
    fn verdicts_accept_both_languages() {
        assert_eq!(parse_verdict("yes"), Some(true));
        assert_eq!(parse_verdict("SIM"), Some(true));
        assert_eq!(parse_verdict("NÃO"), Some(false));
        assert_eq!(parse_verdict("No."), Some(false));
        assert_eq!(parse_verdict("maybe"), None);
    }

    #[test]
    fn degraded_answer_mentions_error() {
        let answer = degraded_answer("q", 3, Some("Database error: no such table: x"));
        assert!(answer.contains("no such table: x"));
        assert!(answer.contains("3 attempt"));
    }
}
