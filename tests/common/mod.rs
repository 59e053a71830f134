#![allow(dead_code)]

use std::{
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use droidbench::{
    config::TaskSettings,
    tasks::{ArtifactStore, CommandOutput, DeviceController, TaskRegistry, TaskRuntime},
    tools::{ToolBridgeClient, ToolEndpoint, ToolError, ToolInfo, ToolTransport, TransportKind},
};
use serde_json::{Value, json};

/// Device that records every primitive and answers `getprop` with a fixed model.
#[derive(Default)]
pub struct RecordingDevice {
    pub calls: Mutex<Vec<String>>,
    pub model: String,
}

impl RecordingDevice {
    pub fn with_model(model: &str) -> Self {
        Self {
            model: model.to_string(),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

impl DeviceController for RecordingDevice {
    fn serial(&self) -> &str {
        "localhost:5557"
    }

    fn load_snapshot(&self, tag: &str) -> CommandOutput {
        self.record(format!("load_snapshot {tag}"));
        CommandOutput::ok("OK")
    }

    fn home(&self) -> CommandOutput {
        self.record("home".to_string());
        CommandOutput::ok("")
    }

    fn app_switch(&self) -> CommandOutput {
        self.record("app_switch".to_string());
        CommandOutput::ok("")
    }

    fn push_file(&self, local: &Path, remote: &str) -> CommandOutput {
        self.record(format!("push {} {remote}", local.display()));
        CommandOutput::ok("")
    }

    fn refresh_media_scan(&self, remote: &str) -> CommandOutput {
        self.record(format!("scan {remote}"));
        CommandOutput::ok("")
    }

    fn simulate_sms(&self, sender: &str, message: &str) -> CommandOutput {
        self.record(format!("sms {sender}: {message}"));
        CommandOutput::ok("")
    }

    fn execute_shell(&self, command: &str, root: bool) -> CommandOutput {
        self.record(format!("shell root={root} {command}"));
        if command == "getprop ro.product.model" {
            CommandOutput::ok(format!("{}\n", self.model))
        } else {
            CommandOutput::ok("")
        }
    }
}

/// Tool server double answering every call with one fixed text item.
pub struct FixedReplyTools {
    pub reply: Option<String>,
    pub calls: Arc<Mutex<Vec<(String, Value)>>>,
}

impl FixedReplyTools {
    pub fn replying(text: &str) -> Self {
        Self {
            reply: Some(text.to_string()),
            calls: Arc::default(),
        }
    }

    pub fn unreachable() -> Self {
        Self {
            reply: None,
            calls: Arc::default(),
        }
    }
}

#[async_trait]
impl ToolTransport for FixedReplyTools {
    async fn list_tools(&self) -> Result<Vec<ToolInfo>, ToolError> {
        Ok(Vec::new())
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Vec<Value>, ToolError> {
        self.calls
            .lock()
            .unwrap()
            .push((name.to_string(), arguments));
        match &self.reply {
            Some(text) => Ok(vec![json!({"type": "text", "text": text})]),
            None => Err(ToolError::Protocol {
                endpoint: "amap".to_string(),
                reason: "connection refused".to_string(),
            }),
        }
    }

    fn endpoint_for(&self, _name: &str) -> Option<ToolEndpoint> {
        Some(ToolEndpoint::new(
            "amap",
            TransportKind::Sse,
            "http://127.0.0.1:9/sse",
        ))
    }
}

pub fn settings() -> TaskSettings {
    TaskSettings {
        snapshot_settle_ms: 0,
        agent_timeout_secs: 5,
    }
}

pub fn runtime(registry: TaskRegistry, tools: FixedReplyTools, artifacts: &Path) -> TaskRuntime {
    TaskRuntime::new(
        registry,
        Arc::new(ToolBridgeClient::new(tools, Duration::from_secs(5))),
        ArtifactStore::new(artifacts),
        settings(),
    )
}
