use std::{future::Future, time::Duration};

use serde_json::Value;
use tokio::sync::Mutex;

use super::{
    transport::{McpTransport, ToolTransport},
    types::{EndpointSet, ToolCallResult, ToolError, ToolInfo},
};

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

struct BridgeState {
    transport: Box<dyn ToolTransport>,
    tools: Option<Vec<ToolInfo>>,
}

/// Shared handle onto the configured tool servers.
///
/// Every operation holds one exclusive lock for its whole request/response
/// cycle, so calls never interleave on the transport. Async code uses
/// [`list_tools`](Self::list_tools) and [`call_tool`](Self::call_tool);
/// synchronous code uses the `_blocking` variants, which drive the same
/// futures on a dedicated worker thread with its own runtime.
pub struct ToolBridgeClient {
    state: Mutex<BridgeState>,
    call_timeout: Duration,
}

impl ToolBridgeClient {
    pub fn new(transport: impl ToolTransport + 'static, call_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(BridgeState {
                transport: Box::new(transport),
                tools: None,
            }),
            call_timeout,
        }
    }

    pub fn from_endpoints(endpoints: EndpointSet, call_timeout: Duration) -> Self {
        Self::new(McpTransport::new(endpoints), call_timeout)
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Tool catalogue across all servers. Fetched once and memoized; a
    /// failed fetch returns an empty list and leaves the cache empty.
    pub async fn list_tools(&self) -> Vec<ToolInfo> {
        let mut state = self.state.lock().await;
        if let Some(tools) = &state.tools {
            return tools.clone();
        }

        let fetched = match tokio::time::timeout(self.call_timeout, state.transport.list_tools()).await {
            Ok(result) => result,
            Err(_) => Err(ToolError::Timeout(self.call_timeout)),
        };
        match fetched {
            Ok(tools) => {
                tracing::info!(count = tools.len(), "tool catalogue cached");
                state.tools = Some(tools.clone());
                tools
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to list tools");
                Vec::new()
            }
        }
    }

    /// Calls a tool. Transport errors, protocol errors and timeouts come
    /// back as [`ToolCallResult::Failure`].
    pub async fn call_tool(&self, name: &str, arguments: Value) -> ToolCallResult {
        let state = self.state.lock().await;
        let endpoint = state.transport.endpoint_for(name);
        tracing::debug!(tool = %name, "calling tool");

        let outcome = match tokio::time::timeout(
            self.call_timeout,
            state.transport.call_tool(name, arguments),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ToolError::Timeout(self.call_timeout)),
        };

        match outcome {
            Ok(content) => ToolCallResult::Success { content },
            Err(e) => {
                tracing::warn!(tool = %name, error = %e, endpoint = ?endpoint, "tool call failed");
                ToolCallResult::failure(
                    format!("Failed to call tool {name}: {e}"),
                    endpoint.as_ref(),
                )
            }
        }
    }

    pub async fn invalidate_cache(&self) {
        self.state.lock().await.tools = None;
    }

    pub async fn cached_tools(&self) -> Option<Vec<ToolInfo>> {
        self.state.lock().await.tools.clone()
    }

    pub fn list_tools_blocking(&self) -> Vec<ToolInfo> {
        match run_blocking(self.list_tools()) {
            Ok(tools) => tools,
            Err(e) => {
                tracing::warn!(error = %e, "failed to list tools");
                Vec::new()
            }
        }
    }

    pub fn call_tool_blocking(&self, name: &str, arguments: Value) -> ToolCallResult {
        match run_blocking(self.call_tool(name, arguments)) {
            Ok(result) => result,
            Err(e) => ToolCallResult::failure(format!("Failed to call tool {name}: {e}"), None),
        }
    }
}

/// Drives `future` to completion on a scoped worker thread with its own
/// single-threaded runtime. Safe to call from inside or outside a runtime.
fn run_blocking<F>(future: F) -> Result<F::Output, ToolError>
where
    F: Future + Send,
    F::Output: Send,
{
    std::thread::scope(|scope| {
        scope
            .spawn(move || -> Result<F::Output, ToolError> {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .map_err(|e| ToolError::Worker(e.to_string()))?;
                Ok(runtime.block_on(future))
            })
            .join()
            .map_err(|_| ToolError::Worker("worker thread panicked".to_string()))?
    })
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc, Mutex as StdMutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    };

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::tools::types::{ToolEndpoint, TransportKind};

    #[derive(Default)]
    struct MockTransport {
        list_calls: Arc<AtomicUsize>,
        fail_listing: Arc<AtomicBool>,
        events: Arc<StdMutex<Vec<String>>>,
        call_delay: Duration,
    }

    #[async_trait]
    impl ToolTransport for MockTransport {
        async fn list_tools(&self) -> Result<Vec<ToolInfo>, ToolError> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_listing.load(Ordering::SeqCst) {
                return Err(ToolError::NoEndpoints);
            }
            Ok(vec![ToolInfo {
                name: "amap_maps_direction_bicycling".to_string(),
                description: None,
                input_schema: json!({"type": "object"}),
            }])
        }

        async fn call_tool(&self, name: &str, _arguments: Value) -> Result<Vec<Value>, ToolError> {
            self.events.lock().unwrap().push(format!("start {name}"));
            tokio::time::sleep(self.call_delay).await;
            self.events.lock().unwrap().push(format!("end {name}"));
            if name == "broken" {
                return Err(ToolError::UnknownTool(name.to_string()));
            }
            Ok(vec![json!({"type": "text", "text": name})])
        }

        fn endpoint_for(&self, _name: &str) -> Option<ToolEndpoint> {
            Some(
                ToolEndpoint::new("amap", TransportKind::Sse, "https://example.test/sse")
                    .with_header("Authorization", "Bearer secret"),
            )
        }
    }

    #[tokio::test]
    async fn tool_list_is_fetched_once() {
        let transport = MockTransport::default();
        let calls = transport.list_calls.clone();
        let client = ToolBridgeClient::new(transport, DEFAULT_CALL_TIMEOUT);

        let first = client.list_tools().await;
        let second = client.list_tools().await;
        assert_eq!(first, second);
        assert_eq!(first.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        client.invalidate_cache().await;
        client.list_tools().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_listing_is_retried() {
        let transport = MockTransport::default();
        let calls = transport.list_calls.clone();
        let fail = transport.fail_listing.clone();
        fail.store(true, Ordering::SeqCst);
        let client = ToolBridgeClient::new(transport, DEFAULT_CALL_TIMEOUT);

        assert!(client.list_tools().await.is_empty());
        assert!(client.cached_tools().await.is_none());

        fail.store(false, Ordering::SeqCst);
        assert_eq!(client.list_tools().await.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn timeouts_become_failures() {
        let transport = MockTransport {
            call_delay: Duration::from_secs(5),
            ..MockTransport::default()
        };
        let client = ToolBridgeClient::new(transport, Duration::from_millis(50));

        let result = client.call_tool("slow", json!({})).await;
        assert!(!result.is_success());
        assert!(result.error().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn transport_errors_carry_the_redacted_endpoint() {
        let client = ToolBridgeClient::new(MockTransport::default(), DEFAULT_CALL_TIMEOUT);
        let result = client.call_tool("broken", json!({})).await;

        let ToolCallResult::Failure { error, endpoint } = result else {
            panic!("expected failure");
        };
        assert!(error.contains("Failed to call tool broken"));
        let endpoint = endpoint.unwrap();
        assert_eq!(endpoint.name, "amap");
        assert_eq!(endpoint.headers["Authorization"], "***");
    }

    #[test]
    fn blocking_calls_are_serialized() {
        let transport = MockTransport {
            call_delay: Duration::from_millis(20),
            ..MockTransport::default()
        };
        let events = transport.events.clone();
        let client = Arc::new(ToolBridgeClient::new(transport, DEFAULT_CALL_TIMEOUT));

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let client = client.clone();
                std::thread::spawn(move || client.call_tool_blocking(&format!("tool{i}"), json!({})))
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap().is_success());
        }

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 8);
        for pair in events.chunks(2) {
            let started = pair[0].strip_prefix("start ").unwrap();
            assert_eq!(pair[1], format!("end {started}"));
        }
    }

    #[tokio::test]
    async fn blocking_calls_work_inside_a_runtime() {
        let client = ToolBridgeClient::new(MockTransport::default(), DEFAULT_CALL_TIMEOUT);
        let result = client.call_tool_blocking("maps_geo", json!({}));
        assert_eq!(result.text(), Some("maps_geo"));
        assert_eq!(client.list_tools_blocking().len(), 1);
    }
}
