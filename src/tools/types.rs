use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Wire framing a tool server speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Long-lived event stream announcing a POST endpoint.
    Sse,
    /// Streamable HTTP: one POST per JSON-RPC message.
    Http,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sse => f.write_str("sse"),
            Self::Http => f.write_str("http"),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolEndpoint {
    pub name: String,
    pub transport: TransportKind,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

// Headers carry bearer tokens; keep them out of logs and failure reports.
impl fmt::Debug for ToolEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolEndpoint")
            .field("name", &self.name)
            .field("transport", &self.transport)
            .field("url", &self.url)
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ToolEndpoint {
    pub fn new(name: impl Into<String>, transport: TransportKind, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport,
            url: url.into(),
            headers: BTreeMap::new(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Copy with header values masked, fit for diagnostics.
    pub fn redacted(&self) -> Self {
        Self {
            headers: self
                .headers
                .keys()
                .map(|key| (key.clone(), "***".to_string()))
                .collect(),
            ..self.clone()
        }
    }
}

/// Immutable, name-ordered set of tool servers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointSet {
    endpoints: BTreeMap<String, ToolEndpoint>,
}

impl EndpointSet {
    pub fn new(endpoints: impl IntoIterator<Item = ToolEndpoint>) -> Self {
        Self {
            endpoints: endpoints
                .into_iter()
                .map(|endpoint| (endpoint.name.clone(), endpoint))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ToolEndpoint> {
        self.endpoints.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ToolEndpoint> {
        self.endpoints.values()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Name under which a server's tool is exposed. With several servers
    /// tools are namespaced `{server}_{tool}`.
    pub fn exposed_name(&self, server: &str, tool: &str) -> String {
        if self.endpoints.len() > 1 {
            format!("{server}_{tool}")
        } else {
            tool.to_string()
        }
    }

    /// Maps an exposed tool name back to its server and the server-side
    /// tool name. The longest matching server prefix wins.
    pub fn route(&self, exposed: &str) -> Option<(&ToolEndpoint, String)> {
        if self.endpoints.len() == 1 {
            let endpoint = self.endpoints.values().next()?;
            return Some((endpoint, exposed.to_string()));
        }
        self.endpoints
            .values()
            .filter_map(|endpoint| {
                let tool = exposed.strip_prefix(&endpoint.name)?.strip_prefix('_')?;
                (!tool.is_empty()).then(|| (endpoint, tool.to_string()))
            })
            .max_by_key(|(endpoint, _)| endpoint.name.len())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, rename = "inputSchema")]
    pub input_schema: Value,
}

/// Outcome of a tool call. Transport problems are values, never errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolCallResult {
    Success {
        content: Vec<Value>,
    },
    Failure {
        error: String,
        endpoint: Option<ToolEndpoint>,
    },
}

impl ToolCallResult {
    pub fn failure(error: impl fmt::Display, endpoint: Option<&ToolEndpoint>) -> Self {
        Self::Failure {
            error: error.to_string(),
            endpoint: endpoint.map(ToolEndpoint::redacted),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { error, .. } => Some(error),
        }
    }

    /// Text of the first `text` content item.
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Success { content } => content.iter().find_map(|item| {
                if item.get("type").and_then(Value::as_str) == Some("text") {
                    item.get("text").and_then(Value::as_str)
                } else {
                    None
                }
            }),
            Self::Failure { .. } => None,
        }
    }

    /// Parses the first text item as JSON, falling back to a JSON string.
    pub fn json(&self) -> Option<Value> {
        let text = self.text()?;
        Some(serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string())))
    }
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("no tool servers configured")]
    NoEndpoints,
    #[error("no configured server exposes tool `{0}`")]
    UnknownTool(String),
    #[error("request to `{endpoint}` failed: {source}")]
    Http {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("`{endpoint}` answered with HTTP {status}: {body}")]
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },
    #[error("`{endpoint}` returned JSON-RPC error {code}: {message}")]
    Rpc {
        endpoint: String,
        code: i64,
        message: String,
    },
    #[error("`{endpoint}` sent a malformed response: {reason}")]
    Protocol { endpoint: String, reason: String },
    #[error("tool `{tool}` reported an error: {message}")]
    ToolReported { tool: String, message: String },
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("tool bridge worker failed: {0}")]
    Worker(String),
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn set(names: &[&str]) -> EndpointSet {
        EndpointSet::new(
            names
                .iter()
                .map(|name| ToolEndpoint::new(*name, TransportKind::Http, format!("http://{name}"))),
        )
    }

    #[test]
    fn single_server_tools_are_not_prefixed() {
        let endpoints = set(&["amap"]);
        assert_eq!(endpoints.exposed_name("amap", "maps_geo"), "maps_geo");
        let (endpoint, tool) = endpoints.route("maps_geo").unwrap();
        assert_eq!(endpoint.name, "amap");
        assert_eq!(tool, "maps_geo");
    }

    #[test]
    fn routes_by_longest_server_prefix() {
        let endpoints = set(&["amap", "amap_maps", "jina"]);
        let (endpoint, tool) = endpoints.route("amap_maps_direction_bicycling").unwrap();
        assert_eq!(endpoint.name, "amap_maps");
        assert_eq!(tool, "direction_bicycling");

        let (endpoint, tool) = endpoints.route("jina_read_url").unwrap();
        assert_eq!((endpoint.name.as_str(), tool.as_str()), ("jina", "read_url"));
        assert!(endpoints.route("github_search").is_none());
        assert!(endpoints.route("jina_").is_none());
    }

    #[test]
    fn failures_redact_headers() {
        let endpoint = ToolEndpoint::new("amap", TransportKind::Sse, "https://example.test/sse")
            .with_header("Authorization", "Bearer secret");
        let result = ToolCallResult::failure("connection refused", Some(&endpoint));

        let ToolCallResult::Failure { endpoint, .. } = &result else {
            panic!("expected failure");
        };
        assert_eq!(endpoint.as_ref().unwrap().headers["Authorization"], "***");
        assert!(!format!("{endpoint:?}").contains("secret"));
        assert_eq!(result.error(), Some("connection refused"));
    }

    #[test]
    fn text_and_json_read_the_first_text_item() {
        let result = ToolCallResult::Success {
            content: vec![
                json!({"type": "image", "data": "..."}),
                json!({"type": "text", "text": "{\"distance\": \"157254\"}"}),
            ],
        };
        assert_eq!(result.text(), Some("{\"distance\": \"157254\"}"));
        assert_eq!(result.json().unwrap()["distance"], "157254");
        assert!(result.is_success());
    }
}
