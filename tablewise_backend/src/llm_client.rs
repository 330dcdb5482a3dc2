use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// A declared output shape, sent as a single forced function call.
#[derive(Debug, Clone)]
pub struct OutputSchema {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: serde_json::Value,
}

/// The structured language-model capability the control loop depends on.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Free-text completion.
    async fn complete(&self, messages: Vec<Message>) -> Result<String>;

    /// Completion constrained to `schema`; returns the JSON arguments object.
    async fn complete_structured(
        &self,
        messages: Vec<Message>,
        schema: &OutputSchema,
    ) -> Result<serde_json::Value>;
}

/// Structured call decoded into `T`.
pub async fn complete_as<T>(
    model: &dyn LanguageModel,
    messages: Vec<Message>,
    schema: &OutputSchema,
) -> Result<T>
where
    T: DeserializeOwned,
{
    let value = model.complete_structured(messages, schema).await?;
    serde_json::from_value::<T>(value.clone()).with_context(|| {
        format!(
            "Structured output for '{}' did not match its schema: {}",
            schema.name, value
        )
    })
}

#[derive(Clone)]
pub struct LlmClient {
    api_url: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ToolDef<'a>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct ToolDef<'a> {
    #[serde(rename = "type")]
    tool_type: &'static str,
    function: FunctionDef<'a>,
}

#[derive(Debug, Serialize)]
struct FunctionDef<'a> {
    name: &'a str,
    description: &'a str,
    parameters: &'a serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ResponseToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ResponseToolCall {
    function: ResponseFunctionCall,
}

#[derive(Debug, Deserialize)]
struct ResponseFunctionCall {
    name: String,
    arguments: String, // JSON string
}

impl LlmClient {
    pub fn new(
        client: reqwest::Client,
        api_url: String,
        api_key: Option<String>,
        model: String,
    ) -> Self {
        Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key: api_key.unwrap_or_default(),
            model,
            temperature: 0.0,
            max_tokens: 1024,
            client,
        }
    }

    pub fn with_sampling(mut self, temperature: f32, max_tokens: u32) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn send(&self, request: &ChatCompletionRequest<'_>) -> Result<ResponseMessage> {
        let url = format!("{}/chat/completions", self.api_url);

        let mut req = self.client.post(&url).json(request);

        // Add API key header if provided (not needed for local models)
        if !self.api_key.is_empty() {
            req = req.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let response = req.send().await.context("Failed to send LLM request")?;

        // Check for HTTP errors and include response body for debugging
        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("LLM API returned error {}: {}", status, body);
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .context("Failed to parse LLM response")?;

        completion
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or_else(|| anyhow::anyhow!("No response from LLM"))
    }
}

#[async_trait]
impl LanguageModel for LlmClient {
    async fn complete(&self, messages: Vec<Message>) -> Result<String> {
        let request = ChatCompletionRequest {
            model: &self.model,
            messages: &messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            tools: None,
            tool_choice: None,
        };

        let message = self.send(&request).await?;
        message
            .content
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("LLM returned an empty completion"))
    }

    async fn complete_structured(
        &self,
        messages: Vec<Message>,
        schema: &OutputSchema,
    ) -> Result<serde_json::Value> {
        let request = ChatCompletionRequest {
            model: &self.model,
            messages: &messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            tools: Some(vec![ToolDef {
                tool_type: "function",
                function: FunctionDef {
                    name: schema.name,
                    description: schema.description,
                    parameters: &schema.parameters,
                },
            }]),
            tool_choice: Some(serde_json::json!({
                "type": "function",
                "function": { "name": schema.name }
            })),
        };

        let message = self.send(&request).await?;
        structured_arguments(message, schema.name)
    }
}

fn structured_arguments(message: ResponseMessage, expected: &str) -> Result<serde_json::Value> {
    if let Some(call) = message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .find(|call| call.function.name == expected)
    {
        return parse_json(&call.function.arguments);
    }

    // Some OpenAI-compatible servers ignore tool_choice and answer in plain text.
    match message.content.as_deref() {
        Some(content) if !content.trim().is_empty() => parse_json(content),
        _ => anyhow::bail!("LLM returned neither a '{}' call nor content", expected),
    }
}

/// Parse a JSON value out of model output, tolerating `<think>` preambles and
/// markdown code fences.
pub fn parse_json<T>(response: &str) -> Result<T>
where
    T: DeserializeOwned,
{
    if let Ok(parsed) = serde_json::from_str::<T>(response) {
        return Ok(parsed);
    }

    let cleaned = if let Some(think_end) = response.rfind("</think>") {
        &response[think_end + 8..]
    } else {
        response
    };

    if let Ok(parsed) = serde_json::from_str::<T>(cleaned.trim()) {
        return Ok(parsed);
    }

    let json_content = if let Some(start) = cleaned.find("```json") {
        let after_start = &cleaned[start + 7..];
        if let Some(end) = after_start.find("```") {
            after_start[..end].trim()
        } else {
            cleaned
        }
    } else if let Some(start) = cleaned.find('{') {
        match cleaned.rfind('}') {
            Some(end) if end > start => &cleaned[start..=end],
            _ => cleaned,
        }
    } else {
        cleaned
    };

    serde_json::from_str::<T>(json_content.trim()).context(format!(
        "Failed to parse JSON. Extracted: {} | Original: {}",
        json_content,
        response.chars().take(500).collect::<String>()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> OutputSchema {
        OutputSchema {
            name: "sql_query",
            description: "The SQL query to run",
            parameters: serde_json::json!({
                "type": "object",
                "properties": { "query": { "type": "string" } },
                "required": ["query"]
            }),
        }
    }

    #[test]
    fn structured_request_forces_the_declared_function() {
        let messages = vec![Message::user("how many clients?")];
        let schema = schema();
        let request = ChatCompletionRequest {
            model: "gpt-4o",
            messages: &messages,
            temperature: 0.0,
            max_tokens: 256,
            tools: Some(vec![ToolDef {
                tool_type: "function",
                function: FunctionDef {
                    name: schema.name,
                    description: schema.description,
                    parameters: &schema.parameters,
                },
            }]),
            tool_choice: Some(serde_json::json!({
                "type": "function",
                "function": { "name": schema.name }
            })),
        };

        let body = serde_json::to_value(&request).unwrap();
        assert_eq!(body["tools"][0]["type"], "function");
        assert_eq!(body["tools"][0]["function"]["name"], "sql_query");
        assert_eq!(body["tool_choice"]["function"]["name"], "sql_query");
        assert_eq!(body["messages"][0]["role"], "user");
    }

    #[test]
    fn plain_request_omits_tools() {
        let messages = vec![Message::system("be brief")];
        let request = ChatCompletionRequest {
            model: "gpt-4o",
            messages: &messages,
            temperature: 0.0,
            max_tokens: 256,
            tools: None,
            tool_choice: None,
        };
        let body = serde_json::to_value(&request).unwrap();
        assert!(body.get("tools").is_none());
        assert!(body.get("tool_choice").is_none());
    }

    #[test]
    fn tool_call_arguments_are_decoded() {
        let response: ChatCompletionResponse = serde_json::from_value(serde_json::json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {
                            "name": "sql_query",
                            "arguments": "{\"query\": \"SELECT COUNT(*) FROM clientes\"}"
                        }
                    }]
                }
            }]
        }))
        .unwrap();

        let message = response.choices.into_iter().next().unwrap().message;
        let value = structured_arguments(message, "sql_query").unwrap();
        assert_eq!(value["query"], "SELECT COUNT(*) FROM clientes");
    }

    #[test]
    fn content_fallback_extracts_fenced_json() {
        let message = ResponseMessage {
            content: Some("Sure:\n```json\n{\"decision\": \"yes\"}\n```".to_string()),
            tool_calls: None,
        };
        let value = structured_arguments(message, "validation").unwrap();
        assert_eq!(value["decision"], "yes");
    }

    #[test]
    fn missing_call_and_content_is_an_error() {
        let message = ResponseMessage {
            content: None,
            tool_calls: Some(Vec::new()),
        };
        let err = structured_arguments(message, "validation").unwrap_err();
        assert!(err.to_string().contains("validation"));
    }

    #[test]
    fn parse_json_skips_think_block() {
        let parsed: serde_json::Value =
            parse_json("<think>hmm</think>\n{\"query\": \"SELECT 1\"}").unwrap();
        assert_eq!(parsed["query"], "SELECT 1");
    }

    #[test]
    fn closing_brace_before_opening_brace_is_a_parse_error() {
        let message = ResponseMessage {
            content: Some("Use } to close, then {".to_string()),
            tool_calls: None,
        };
        let err = structured_arguments(message, "sql_query").unwrap_err();
        assert!(err.to_string().contains("Failed to parse JSON"));
    }

    #[test]
    fn parse_json_reports_raw_response_on_failure() {
        let err = parse_json::<serde_json::Value>("no json here").unwrap_err();
        assert!(err.to_string().contains("no json here"));
    }
}
