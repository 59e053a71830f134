use std::{
    fs,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    time::SystemTime,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

const CALLBACK_DIR: &str = "task_callbacks";
const MALL_CONFIG_FILE: &str = "mall_config.json";

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact i/o on `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("artifact `{path}` is not valid JSON: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> ArtifactError + '_ {
    move |source| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Settings the mall app backend reads at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MallConfig {
    pub show_splash_ad: bool,
    pub require_login: bool,
    pub default_user_id: String,
    pub mock_orders: Vec<Value>,
}

impl Default for MallConfig {
    fn default() -> Self {
        Self {
            show_splash_ad: false,
            require_login: true,
            default_user_id: "mashu001".to_string(),
            mock_orders: Vec::new(),
        }
    }
}

/// Per-device artifact directories under an explicit root:
/// `<root>/<device>/task_callbacks/*.json` and `<root>/<device>/mall_config.json`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for `device`, created on first use.
    pub fn device_dir(&self, device: &str) -> Result<PathBuf, ArtifactError> {
        let dir = self.root.join(device);
        fs::create_dir_all(&dir).map_err(io_error(&dir))?;
        Ok(dir)
    }

    fn callback_dir(&self, device: &str) -> PathBuf {
        self.root.join(device).join(CALLBACK_DIR)
    }

    fn mall_config_path(&self, device: &str) -> PathBuf {
        self.root.join(device).join(MALL_CONFIG_FILE)
    }

    /// Writes `{task}_callback_{timestamp}.json` and returns its path.
    pub fn write_callback(&self, device: &str, task: &str, data: &Value) -> Result<PathBuf, ArtifactError> {
        let dir = self.callback_dir(device);
        fs::create_dir_all(&dir).map_err(io_error(&dir))?;

        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S%.3f");
        let path = dir.join(format!("{task}_callback_{stamp}.json"));
        let body = serde_json::to_vec_pretty(data).map_err(|source| ArtifactError::Json {
            path: path.clone(),
            source,
        })?;
        fs::write(&path, body).map_err(io_error(&path))?;
        Ok(path)
    }

    /// Up to `count` callbacks for `device`, newest first.
    pub fn recent_callbacks(&self, device: &str, count: usize) -> Result<Vec<Value>, ArtifactError> {
        let dir = self.callback_dir(device);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(&dir)(e)),
        };

        let mut files: Vec<(SystemTime, PathBuf)> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| is_callback_file(path))
            .map(|path| {
                let modified = fs::metadata(&path)
                    .and_then(|meta| meta.modified())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                (modified, path)
            })
            .collect();
        // names embed the write time, so they break ties within one mtime tick
        files.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));

        files
            .into_iter()
            .take(count)
            .map(|(_, path)| read_json(&path))
            .collect()
    }

    pub fn clear_callbacks(&self, device: &str) -> Result<usize, ArtifactError> {
        let dir = self.callback_dir(device);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(io_error(&dir)(e)),
        };

        let mut removed = 0;
        for path in entries.filter_map(Result::ok).map(|entry| entry.path()) {
            if path.extension().is_some_and(|ext| ext == "json") {
                fs::remove_file(&path).map_err(io_error(&path))?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// The device's mall config, or the defaults when none was written.
    pub fn read_mall_config(&self, device: &str) -> Result<MallConfig, ArtifactError> {
        let path = self.mall_config_path(device);
        if !path.exists() {
            return Ok(MallConfig::default());
        }
        let value = read_json(&path)?;
        serde_json::from_value(value).map_err(|source| ArtifactError::Json { path, source })
    }

    pub fn write_mall_config(&self, device: &str, config: &MallConfig) -> Result<(), ArtifactError> {
        self.device_dir(device)?;
        let path = self.mall_config_path(device);
        let body = serde_json::to_vec(config).map_err(|source| ArtifactError::Json {
            path: path.clone(),
            source,
        })?;
        fs::write(&path, body).map_err(io_error(&path))
    }

    pub fn clear_mall_config(&self, device: &str) -> Result<bool, ArtifactError> {
        let path = self.mall_config_path(device);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_error(&path)(e)),
        }
    }

    /// Removes everything a task may have injected for `device`. Safe to
    /// call when nothing is there.
    pub fn clear_device_state(&self, device: &str) -> Result<(), ArtifactError> {
        let callbacks = self.clear_callbacks(device)?;
        let config = self.clear_mall_config(device)?;
        if callbacks > 0 || config {
            tracing::debug!(%device, callbacks, mall_config = config, "cleared device artifacts");
        }
        Ok(())
    }
}

fn is_callback_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "json")
        && path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.contains("_callback_"))
}

fn read_json(path: &Path) -> Result<Value, ArtifactError> {
    let raw = fs::read(path).map_err(io_error(path))?;
    serde_json::from_slice(&raw).map_err(|source| ArtifactError::Json {
        path: path.to_path_buf(),
        source,
    })
}
