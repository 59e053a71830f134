use std::{
    path::{Path, PathBuf},
    process::Command,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::Serialize;

/// Result of one device primitive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandOutput {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
}

impl CommandOutput {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error.into()),
        }
    }
}

/// Blocking control over one live emulator. Task hooks call these from
/// blocking threads.
pub trait DeviceController: Send + Sync {
    /// Identifier the device is addressed by, e.g. `localhost:5557`.
    fn serial(&self) -> &str;

    fn load_snapshot(&self, tag: &str) -> CommandOutput;

    fn home(&self) -> CommandOutput;

    fn app_switch(&self) -> CommandOutput;

    fn push_file(&self, local: &Path, remote: &str) -> CommandOutput;

    fn refresh_media_scan(&self, remote: &str) -> CommandOutput;

    fn simulate_sms(&self, sender: &str, message: &str) -> CommandOutput;

    fn execute_shell(&self, command: &str, root: bool) -> CommandOutput;

    /// Sets the device clock to the host's current time.
    fn sync_time(&self) -> CommandOutput {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or_default();
        self.execute_shell(&format!("date @{now}"), true)
    }
}

/// [`DeviceController`] driving the `adb` command line tool.
#[derive(Debug, Clone)]
pub struct AdbController {
    serial: String,
    adb: PathBuf,
}

impl AdbController {
    pub fn new(serial: impl Into<String>) -> Self {
        Self::with_binary(serial, "adb")
    }

    pub fn with_binary(serial: impl Into<String>, adb: impl Into<PathBuf>) -> Self {
        Self {
            serial: serial.into(),
            adb: adb.into(),
        }
    }

    fn command_args<'a>(&'a self, args: &[&'a str]) -> Vec<&'a str> {
        let mut full = vec!["-s", self.serial.as_str()];
        full.extend_from_slice(args);
        full
    }

    fn run(&self, args: &[&str]) -> CommandOutput {
        let args = self.command_args(args);
        tracing::trace!(serial = %self.serial, ?args, "adb");

        let output = match Command::new(&self.adb).args(&args).output() {
            Ok(output) => output,
            Err(e) => {
                return CommandOutput::failed(format!(
                    "failed to run {}: {e}",
                    self.adb.display()
                ));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if output.status.success() {
            CommandOutput {
                success: true,
                output: stdout,
                error: (!stderr.is_empty()).then_some(stderr),
            }
        } else {
            tracing::debug!(serial = %self.serial, ?args, status = ?output.status.code(), %stderr, "adb command failed");
            CommandOutput {
                success: false,
                output: stdout,
                error: Some(if stderr.is_empty() {
                    format!("adb exited with {}", output.status)
                } else {
                    stderr
                }),
            }
        }
    }
}

impl DeviceController for AdbController {
    fn serial(&self) -> &str {
        &self.serial
    }

    fn load_snapshot(&self, tag: &str) -> CommandOutput {
        let result = self.run(&["emu", "avd", "snapshot", "load", tag]);
        // the emulator console reports failures on stdout with exit code 0
        if result.success && result.output.contains("KO") {
            return CommandOutput {
                success: false,
                error: Some(result.output.clone()),
                ..result
            };
        }
        result
    }

    fn home(&self) -> CommandOutput {
        self.run(&["shell", "input", "keyevent", "KEYCODE_HOME"])
    }

    fn app_switch(&self) -> CommandOutput {
        self.run(&["shell", "input", "keyevent", "KEYCODE_APP_SWITCH"])
    }

    fn push_file(&self, local: &Path, remote: &str) -> CommandOutput {
        let local = local.to_string_lossy();
        self.run(&["push", &local, remote])
    }

    fn refresh_media_scan(&self, remote: &str) -> CommandOutput {
        let uri = format!("file://{remote}");
        self.run(&[
            "shell",
            "am",
            "broadcast",
            "-a",
            "android.intent.action.MEDIA_SCANNER_SCAN_FILE",
            "-d",
            &uri,
        ])
    }

    fn simulate_sms(&self, sender: &str, message: &str) -> CommandOutput {
        self.run(&["emu", "sms", "send", sender, message])
    }

    fn execute_shell(&self, command: &str, root: bool) -> CommandOutput {
        if root {
            self.run(&["shell", "su", "root", "sh", "-c", command])
        } else {
            self.run(&["shell", command])
        }
    }
}
