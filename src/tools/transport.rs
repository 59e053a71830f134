use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures_util::{StreamExt, stream::BoxStream};
use reqwest::{
    RequestBuilder, Response, Url,
    header::{ACCEPT, CONTENT_TYPE},
};
use serde_json::{Value, json};

use super::types::{EndpointSet, ToolEndpoint, ToolError, ToolInfo, TransportKind};

const PROTOCOL_VERSION: &str = "2024-11-05";
const SESSION_HEADER: &str = "mcp-session-id";

/// Asynchronous access to a set of tool servers.
#[async_trait]
pub trait ToolTransport: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<ToolInfo>, ToolError>;

    /// Calls `name` and returns the result's content items.
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Vec<Value>, ToolError>;

    /// Server that would receive a call to `name`, for diagnostics.
    fn endpoint_for(&self, name: &str) -> Option<ToolEndpoint>;
}

/// MCP client speaking JSON-RPC 2.0 over `http` or `sse` framing. Every
/// operation opens a fresh session.
pub struct McpTransport {
    client: reqwest::Client,
    endpoints: EndpointSet,
    next_id: AtomicU64,
}

impl McpTransport {
    pub fn new(endpoints: EndpointSet) -> Self {
        // no pooling: blocking callers drive requests on short-lived runtimes
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(0)
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            client,
            endpoints,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn endpoints(&self) -> &EndpointSet {
        &self.endpoints
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn with_headers(&self, mut request: RequestBuilder, endpoint: &ToolEndpoint) -> RequestBuilder {
        for (key, value) in &endpoint.headers {
            request = request.header(key, value);
        }
        request
    }

    async fn send(&self, endpoint: &ToolEndpoint, request: RequestBuilder) -> Result<Response, ToolError> {
        let response = self
            .with_headers(request, endpoint)
            .send()
            .await
            .map_err(|source| ToolError::Http {
                endpoint: endpoint.name.clone(),
                source,
            })?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ToolError::Status {
                endpoint: endpoint.name.clone(),
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn connect<'a>(&'a self, endpoint: &'a ToolEndpoint) -> Result<Session<'a>, ToolError> {
        let channel = match endpoint.transport {
            TransportKind::Http => Channel::Http { session_id: None },
            TransportKind::Sse => {
                let request = self
                    .client
                    .get(&endpoint.url)
                    .header(ACCEPT, "text/event-stream");
                let mut events = EventStream::new(self.send(endpoint, request).await?);
                let path = loop {
                    match events.next_event(endpoint).await? {
                        Some(event) if event.event == "endpoint" => break event.data,
                        Some(_) => continue,
                        None => return Err(protocol(endpoint, "stream closed before endpoint event")),
                    }
                };
                let post_url = Url::parse(&endpoint.url)
                    .and_then(|base| base.join(path.trim()))
                    .map_err(|e| protocol(endpoint, format!("bad endpoint `{path}`: {e}")))?;
                tracing::trace!(server = %endpoint.name, %post_url, "sse session opened");
                Channel::Sse { post_url, events }
            }
        };

        let mut session = Session {
            transport: self,
            endpoint,
            channel,
        };
        session
            .request(
                "initialize",
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {
                        "name": env!("CARGO_PKG_NAME"),
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                }),
            )
            .await?;
        session.notify("notifications/initialized").await?;
        Ok(session)
    }

    async fn list_server_tools(&self, endpoint: &ToolEndpoint) -> Result<Vec<ToolInfo>, ToolError> {
        let mut session = self.connect(endpoint).await?;
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let params = match &cursor {
                Some(cursor) => json!({ "cursor": cursor }),
                None => json!({}),
            };
            let result = session.request("tools/list", params).await?;
            let page = result
                .get("tools")
                .and_then(Value::as_array)
                .ok_or_else(|| protocol(endpoint, "tools/list result has no `tools` array"))?;
            for tool in page {
                let mut info: ToolInfo = serde_json::from_value(tool.clone())
                    .map_err(|e| protocol(endpoint, format!("bad tool entry: {e}")))?;
                info.name = self.endpoints.exposed_name(&endpoint.name, &info.name);
                tools.push(info);
            }
            cursor = result
                .get("nextCursor")
                .and_then(Value::as_str)
                .map(str::to_string);
            if cursor.is_none() {
                break;
            }
        }

        tracing::debug!(server = %endpoint.name, count = tools.len(), "listed tools");
        Ok(tools)
    }
}

#[async_trait]
impl ToolTransport for McpTransport {
    async fn list_tools(&self) -> Result<Vec<ToolInfo>, ToolError> {
        if self.endpoints.is_empty() {
            return Err(ToolError::NoEndpoints);
        }
        let mut tools = Vec::new();
        for endpoint in self.endpoints.iter() {
            tools.extend(self.list_server_tools(endpoint).await?);
        }
        Ok(tools)
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Vec<Value>, ToolError> {
        let (endpoint, tool) = self
            .endpoints
            .route(name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;

        let mut session = self.connect(endpoint).await?;
        let result = session
            .request("tools/call", json!({ "name": tool, "arguments": arguments }))
            .await?;

        let content = result
            .get("content")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        if result.get("isError").and_then(Value::as_bool) == Some(true) {
            let message = content
                .iter()
                .find_map(|item| item.get("text").and_then(Value::as_str))
                .unwrap_or("no details")
                .to_string();
            return Err(ToolError::ToolReported {
                tool: name.to_string(),
                message,
            });
        }
        Ok(content)
    }

    fn endpoint_for(&self, name: &str) -> Option<ToolEndpoint> {
        self.endpoints.route(name).map(|(endpoint, _)| endpoint.clone())
    }
}

fn protocol(endpoint: &ToolEndpoint, reason: impl Into<String>) -> ToolError {
    ToolError::Protocol {
        endpoint: endpoint.name.clone(),
        reason: reason.into(),
    }
}

enum Channel {
    Http { session_id: Option<String> },
    Sse { post_url: Url, events: EventStream },
}

struct Session<'a> {
    transport: &'a McpTransport,
    endpoint: &'a ToolEndpoint,
    channel: Channel,
}

impl Session<'_> {
    fn post(&self, url: &str, session_id: Option<&str>, message: &Value) -> RequestBuilder {
        let mut request = self
            .transport
            .client
            .post(url)
            .header(ACCEPT, "application/json, text/event-stream")
            .json(message);
        if let Some(session_id) = session_id {
            request = request.header(SESSION_HEADER, session_id);
        }
        request
    }

    /// Where the next message goes, and the session id to send with it.
    fn target(&self) -> (String, Option<String>) {
        match &self.channel {
            Channel::Http { session_id } => (self.endpoint.url.clone(), session_id.clone()),
            Channel::Sse { post_url, .. } => (post_url.to_string(), None),
        }
    }

    async fn request(&mut self, method: &str, params: Value) -> Result<Value, ToolError> {
        let id = self.transport.next_id();
        let message = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        let endpoint = self.endpoint;

        let (url, session_id) = self.target();
        let request = self.post(&url, session_id.as_deref(), &message);
        let response = self.transport.send(endpoint, request).await?;

        let reply = match &mut self.channel {
            Channel::Http { session_id } => {
                let issued = response
                    .headers()
                    .get(SESSION_HEADER)
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_string);
                if issued.is_some() {
                    *session_id = issued;
                }
                read_reply(endpoint, response, id).await?
            }
            // the reply arrives on the event stream, not the POST response
            Channel::Sse { events, .. } => events.reply_to(endpoint, id).await?,
        };

        rpc_result(endpoint, reply)
    }

    async fn notify(&mut self, method: &str) -> Result<(), ToolError> {
        let message = json!({ "jsonrpc": "2.0", "method": method });
        let (url, session_id) = self.target();
        let request = self.post(&url, session_id.as_deref(), &message);
        self.transport.send(self.endpoint, request).await?;
        Ok(())
    }
}

async fn read_reply(endpoint: &ToolEndpoint, response: Response, id: u64) -> Result<Value, ToolError> {
    let streamed = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("text/event-stream"));
    if streamed {
        return EventStream::new(response).reply_to(endpoint, id).await;
    }
    response.json::<Value>().await.map_err(|source| ToolError::Http {
        endpoint: endpoint.name.clone(),
        source,
    })
}

fn rpc_result(endpoint: &ToolEndpoint, mut reply: Value) -> Result<Value, ToolError> {
    if let Some(error) = reply.get("error") {
        return Err(ToolError::Rpc {
            endpoint: endpoint.name.clone(),
            code: error.get("code").and_then(Value::as_i64).unwrap_or_default(),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        });
    }
    match reply.get_mut("result") {
        Some(result) => Ok(result.take()),
        None => Err(protocol(endpoint, "response has neither result nor error")),
    }
}

#[derive(Debug, Default, PartialEq)]
struct SseEvent {
    event: String,
    data: String,
}

impl SseEvent {
    /// The JSON-RPC response to request `id`, if this event carries it.
    fn reply_to(&self, id: u64) -> Option<Value> {
        if !(self.event.is_empty() || self.event == "message") {
            return None;
        }
        let message: Value = serde_json::from_str(&self.data).ok()?;
        (message.get("id").and_then(Value::as_u64) == Some(id)).then_some(message)
    }
}

/// Pops the next complete event off the front of `buffer`.
fn take_event(buffer: &mut String) -> Option<SseEvent> {
    loop {
        let end = buffer.find("\n\n")?;
        let block: String = buffer.drain(..end + 2).collect();

        let mut event = SseEvent::default();
        let mut data = Vec::new();
        for line in block.lines() {
            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "event" => event.event = value.to_string(),
                "data" => data.push(value),
                _ => {}
            }
        }
        if data.is_empty() {
            continue;
        }
        event.data = data.join("\n");
        return Some(event);
    }
}

struct EventStream {
    body: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    buffer: String,
}

impl EventStream {
    fn new(response: Response) -> Self {
        Self {
            body: response
                .bytes_stream()
                .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
                .boxed(),
            buffer: String::new(),
        }
    }

    async fn next_event(&mut self, endpoint: &ToolEndpoint) -> Result<Option<SseEvent>, ToolError> {
        loop {
            if let Some(event) = take_event(&mut self.buffer) {
                return Ok(Some(event));
            }
            match self.body.next().await {
                Some(chunk) => {
                    let chunk = chunk.map_err(|source| ToolError::Http {
                        endpoint: endpoint.name.clone(),
                        source,
                    })?;
                    self.buffer.push_str(&String::from_utf8_lossy(&chunk));
                    if self.buffer.contains('\r') {
                        self.buffer = self.buffer.replace("\r\n", "\n");
                    }
                }
                None => {
                    if self.buffer.trim().is_empty() {
                        return Ok(None);
                    }
                    self.buffer.push_str("\n\n");
                    return Ok(take_event(&mut self.buffer));
                }
            }
        }
    }

    async fn reply_to(&mut self, endpoint: &ToolEndpoint, id: u64) -> Result<Value, ToolError> {
        loop {
            match self.next_event(endpoint).await? {
                Some(event) => {
                    if let Some(reply) = event.reply_to(id) {
                        return Ok(reply);
                    }
                }
                None => return Err(protocol(endpoint, format!("stream ended before reply to request {id}"))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::{
        Json, Router,
        http::{HeaderMap, StatusCode, header},
        response::{IntoResponse, Response as AxumResponse},
        routing::post,
    };

    use super::*;

    #[test]
    fn parses_events_split_across_chunks() {
        let mut buffer = String::from("event: endpoint\ndata: /messages?session=1\n\n: keep-alive\n\ndata: {\"a\":");
        let first = take_event(&mut buffer).unwrap();
        assert_eq!(first.event, "endpoint");
        assert_eq!(first.data, "/messages?session=1");
        assert!(take_event(&mut buffer).is_none());

        buffer.push_str("1}\n\n");
        let second = take_event(&mut buffer).unwrap();
        assert_eq!(second.event, "");
        assert_eq!(second.data, "{\"a\":1}");
        assert!(buffer.is_empty());
    }

    #[test]
    fn matches_replies_by_request_id() {
        let event = SseEvent {
            event: "message".to_string(),
            data: r#"{"jsonrpc":"2.0","id":7,"result":{}}"#.to_string(),
        };
        assert!(event.reply_to(7).is_some());
        assert!(event.reply_to(8).is_none());

        let endpoint_event = SseEvent {
            event: "endpoint".to_string(),
            data: "/messages".to_string(),
        };
        assert!(endpoint_event.reply_to(7).is_none());
    }

    #[test]
    fn rpc_errors_become_tool_errors() {
        let endpoint = ToolEndpoint::new("amap", TransportKind::Http, "http://localhost");
        let err = rpc_result(
            &endpoint,
            json!({"jsonrpc": "2.0", "id": 1, "error": {"code": -32601, "message": "Method not found"}}),
        )
        .unwrap_err();
        assert!(matches!(err, ToolError::Rpc { code: -32601, .. }));
    }

    /// Minimal streamable-HTTP MCP server: issues a session id on initialize,
    /// requires it afterwards and answers tools/call as an event stream.
    async fn mcp_handler(
        methods: Arc<Mutex<Vec<String>>>,
        headers: HeaderMap,
        Json(message): Json<Value>,
    ) -> AxumResponse {
        let method = message["method"].as_str().unwrap_or_default().to_string();
        methods.lock().unwrap().push(method.clone());
        let id = message["id"].clone();

        if method != "initialize"
            && headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()) != Some("session-1")
        {
            return StatusCode::BAD_REQUEST.into_response();
        }

        match method.as_str() {
            "initialize" => (
                [(SESSION_HEADER, "session-1")],
                Json(json!({"jsonrpc": "2.0", "id": id, "result": {
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "mock", "version": "1"}
                }})),
            )
                .into_response(),
            "notifications/initialized" => StatusCode::ACCEPTED.into_response(),
            "tools/list" => Json(json!({"jsonrpc": "2.0", "id": id, "result": {"tools": [
                {"name": "maps_direction_bicycling", "description": "route", "inputSchema": {"type": "object"}}
            ]}}))
            .into_response(),
            "tools/call" => {
                let reply = json!({"jsonrpc": "2.0", "id": id, "result": {"content": [
                    {"type": "text", "text": message["params"]["arguments"]["origin"]}
                ]}});
                (
                    [(header::CONTENT_TYPE, "text/event-stream")],
                    format!(": ping\n\nevent: message\ndata: {reply}\n\n"),
                )
                    .into_response()
            }
            _ => Json(json!({"jsonrpc": "2.0", "id": id, "error": {"code": -32601, "message": "Method not found"}}))
                .into_response(),
        }
    }

    async fn serve_mock() -> (String, Arc<Mutex<Vec<String>>>) {
        let methods = Arc::new(Mutex::new(Vec::new()));
        let recorded = methods.clone();
        let app = Router::new().route(
            "/mcp",
            post(move |headers: HeaderMap, body: Json<Value>| {
                let methods = recorded.clone();
                async move { mcp_handler(methods, headers, body).await }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/mcp"), methods)
    }

    #[tokio::test]
    async fn http_transport_lists_and_calls_tools() {
        let (url, methods) = serve_mock().await;
        let transport = McpTransport::new(EndpointSet::new([
            ToolEndpoint::new("amap", TransportKind::Http, url.clone()),
            ToolEndpoint::new("jina", TransportKind::Http, "http://127.0.0.1:9/unused"),
        ]));

        let tools = transport
            .list_server_tools(transport.endpoints().get("amap").unwrap())
            .await
            .unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "amap_maps_direction_bicycling");
        assert_eq!(tools[0].input_schema["type"], "object");

        let content = transport
            .call_tool("amap_maps_direction_bicycling", json!({"origin": "120.21,30.29"}))
            .await
            .unwrap();
        assert_eq!(content[0]["text"], "120.21,30.29");

        assert_eq!(
            methods.lock().unwrap().clone(),
            vec![
                "initialize",
                "notifications/initialized",
                "tools/list",
                "initialize",
                "notifications/initialized",
                "tools/call",
            ]
        );
        assert_eq!(
            transport.endpoint_for("amap_maps_direction_bicycling").unwrap().url,
            url
        );
    }

    #[tokio::test]
    async fn unknown_tools_are_rejected_before_connecting() {
        let transport = McpTransport::new(EndpointSet::new([
            ToolEndpoint::new("amap", TransportKind::Http, "http://127.0.0.1:9/a"),
            ToolEndpoint::new("jina", TransportKind::Http, "http://127.0.0.1:9/b"),
        ]));
        let err = transport.call_tool("github_search", json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::UnknownTool(name) if name == "github_search"));
    }
}
