use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use futures_util::{StreamExt, future::join_all, stream};
use tokio::{sync::Mutex, time::Instant};

use super::{
    docker::DockerRuntime,
    health::{HealthProbe, HttpHealthProbe},
    prereq::{self, PrerequisiteReport},
    runtime::ContainerRuntime,
    store::RecordStore,
    types::{
        ContainerConfig, ContainerError, ContainerInfo, ContainerRecord, ContainerResult,
        ContainerStatus, LaunchOutcome, RemovalReport, RuntimeContainer,
    },
};
use crate::{
    config::ContainerSettings,
    ports::{PortAllocator, PortPair, VncPorts},
};

/// Exit code `pkill` reports when the shell wrapping it is itself signalled.
const SIGTERM_EXIT: i64 = 143;

/// Owns every container runtime call and the record store that backs port
/// and name allocation.
pub struct ContainerManager {
    runtime: Arc<dyn ContainerRuntime>,
    probe: Arc<dyn HealthProbe>,
    store: Mutex<RecordStore>,
    settings: ContainerSettings,
    ports: PortAllocator,
}

impl ContainerManager {
    pub fn new(
        settings: ContainerSettings,
        runtime: Arc<dyn ContainerRuntime>,
        probe: Arc<dyn HealthProbe>,
    ) -> Self {
        Self {
            runtime,
            probe,
            store: Mutex::new(RecordStore::new(settings.name_prefix.clone())),
            ports: PortAllocator::new(settings.port_scan_window),
            settings,
        }
    }

    /// Manager backed by the local Docker daemon and HTTP health checks.
    pub fn connect(settings: ContainerSettings) -> ContainerResult<Self> {
        let runtime = DockerRuntime::connect()?;
        Ok(Self::new(
            settings,
            Arc::new(runtime),
            Arc::new(HttpHealthProbe::new()),
        ))
    }

    pub fn with_port_allocator(mut self, ports: PortAllocator) -> Self {
        self.ports = ports;
        self
    }

    pub fn settings(&self) -> &ContainerSettings {
        &self.settings
    }

    pub fn prefix(&self) -> &str {
        &self.settings.name_prefix
    }

    pub async fn record(&self, name: &str) -> Option<ContainerRecord> {
        self.store.lock().await.get(name).cloned()
    }

    /// Pulls the runtime's view of prefixed containers into the record store.
    pub async fn refresh(&self) -> ContainerResult<Vec<RuntimeContainer>> {
        let containers = self.runtime.list(self.prefix()).await?;
        self.store
            .lock()
            .await
            .sync_from_runtime(&containers, &self.settings);
        Ok(containers)
    }

    fn config_for(
        &self,
        store: &RecordStore,
        index: u32,
        image: Option<&str>,
        ports: PortPair,
        vnc_ports: Option<VncPorts>,
    ) -> ContainerConfig {
        let mut env = Vec::new();
        if vnc_ports.is_some() {
            env.push("ENABLE_VNC=true".to_string());
        }
        let env_file = self
            .settings
            .env_file
            .as_deref()
            .map(|path| std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf()));
        ContainerConfig {
            index,
            name: store.container_name(index),
            image: image.unwrap_or(&self.settings.image).to_string(),
            ports,
            vnc_ports,
            adb_serial: format!("localhost:{}", ports.adb),
            container_control_port: self.settings.container_control_port,
            container_adb_port: self.settings.container_adb_port,
            container_viewer_port: self.settings.container_viewer_port,
            container_vnc_port: self.settings.container_vnc_port,
            privileged: self.settings.privileged,
            auto_remove: self.settings.auto_remove,
            env,
            env_file,
            labels: HashMap::from([("droidbench.index".to_string(), index.to_string())]),
        }
    }

    /// Allocates ports for `indices` and records each config as pending, all
    /// under one store lock so concurrent batches never share a port or name.
    fn reserve_configs(
        &self,
        store: &mut RecordStore,
        indices: &[u32],
        image: Option<&str>,
    ) -> ContainerResult<Vec<ContainerConfig>> {
        for index in indices {
            let name = store.container_name(*index);
            if store.get(&name).is_some_and(|record| record.status.is_live()) {
                return Err(ContainerError::NameTaken(name));
            }
        }

        let mut starts = vec![self.settings.control_port_start, self.settings.adb_port_start];
        if self.settings.enable_vnc {
            starts.extend([self.settings.viewer_port_start, self.settings.vnc_port_start]);
        }
        let sets = self
            .ports
            .find_port_sets(indices.len(), &starts, &store.claimed_ports())?;

        let configs: Vec<ContainerConfig> = indices
            .iter()
            .zip(sets)
            .filter_map(|(index, set)| {
                let (ports, vnc_ports) = match set[..] {
                    [control, adb] => (PortPair { control, adb }, None),
                    [control, adb, viewer, vnc] => {
                        (PortPair { control, adb }, Some(VncPorts { viewer, vnc }))
                    }
                    _ => return None,
                };
                Some(self.config_for(store, *index, image, ports, vnc_ports))
            })
            .collect();
        for config in &configs {
            store.reserve(config)?;
        }
        Ok(configs)
    }

    /// Builds and reserves the config for one container. The returned ports
    /// stay claimed until the container is removed or its launch fails.
    pub async fn build_container_config(
        &self,
        index: u32,
        image: Option<&str>,
    ) -> ContainerResult<ContainerConfig> {
        let mut store = self.store.lock().await;
        let mut configs = self.reserve_configs(&mut store, &[index], image)?;
        configs
            .pop()
            .ok_or_else(|| ContainerError::runtime("reserve", index.to_string(), "no config built"))
    }

    /// Creates and starts one container. Returns once the runtime reports it
    /// started; readiness is not awaited.
    pub async fn launch_container(&self, config: &ContainerConfig) -> ContainerResult<ContainerInfo> {
        {
            let mut store = self.store.lock().await;
            if store.get(&config.name).is_none_or(|record| !record.status.is_live()) {
                store.reserve(config)?;
            }
        }

        match self.runtime.create_and_start(config).await {
            Ok(id) => {
                let mut store = self.store.lock().await;
                store.set_container_id(&config.name, id);
                store.mark(&config.name, ContainerStatus::Starting);
                let record = store.get(&config.name).cloned();
                Ok(container_info(&config.name, None, record.as_ref()))
            }
            Err(e) => {
                tracing::error!(container = %config.name, error = %e, "launch failed");
                // a leftover container keeps the name taken until it is removed
                let status = match self.runtime.inspect(&config.name).await {
                    Ok(None) => ContainerStatus::Removed,
                    Ok(Some(_)) | Err(_) => ContainerStatus::Stopped,
                };
                self.store.lock().await.mark(&config.name, status);
                Err(e)
            }
        }
    }

    /// Launches `count` containers starting at `start_index`, or after the
    /// highest tracked index. Per-container failures are reported in the
    /// outcomes; only allocation failures abort the batch.
    pub async fn launch_containers(
        &self,
        count: usize,
        start_index: Option<u32>,
        image: Option<&str>,
    ) -> ContainerResult<Vec<LaunchOutcome>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        if let Err(e) = self.refresh().await {
            tracing::warn!(error = %e, "could not list existing containers before launch");
        }

        let configs = {
            let mut store = self.store.lock().await;
            let first = start_index.unwrap_or_else(|| store.next_index());
            let indices: Vec<u32> = (first..).take(count).collect();
            self.reserve_configs(&mut store, &indices, image)?
        };
        tracing::info!(
            count,
            first = configs.first().map(|config| config.index),
            "launching containers"
        );

        let mut outcomes: Vec<LaunchOutcome> = stream::iter(configs)
            .map(|config| async move {
                let result = self.launch_container(&config).await;
                LaunchOutcome {
                    index: config.index,
                    name: config.name.clone(),
                    control_port: config.ports.control,
                    adb_port: config.ports.adb,
                    viewer_port: config.vnc_ports.map(|vnc| vnc.viewer),
                    vnc_port: config.vnc_ports.map(|vnc| vnc.vnc),
                    launched: result.is_ok(),
                    ready: None,
                    error: result.err().map(|e| e.to_string()),
                }
            })
            .buffer_unordered(self.settings.max_concurrent_launches.max(1))
            .collect()
            .await;
        outcomes.sort_by_key(|outcome| outcome.index);

        let launched = outcomes.iter().filter(|outcome| outcome.launched).count();
        tracing::info!(launched, failed = outcomes.len() - launched, "launch batch finished");
        Ok(outcomes)
    }

    /// Launches a batch, then waits for every launched container to become
    /// ready using the configured timeout and poll interval.
    pub async fn launch_and_wait(
        &self,
        count: usize,
        start_index: Option<u32>,
        image: Option<&str>,
    ) -> ContainerResult<Vec<LaunchOutcome>> {
        let mut outcomes = self.launch_containers(count, start_index, image).await?;
        let names: Vec<String> = outcomes
            .iter()
            .filter(|outcome| outcome.launched)
            .map(|outcome| outcome.name.clone())
            .collect();

        let ready = self
            .wait_for_containers_ready(
                &names,
                self.settings.ready_timeout(),
                self.settings.poll_interval(),
            )
            .await;
        for outcome in outcomes.iter_mut().filter(|outcome| outcome.launched) {
            outcome.ready = ready.get(&outcome.name).copied();
        }
        Ok(outcomes)
    }

    async fn control_port(&self, name: &str) -> ContainerResult<u16> {
        if let Some(record) = self.store.lock().await.get(name) {
            if record.status.is_live() && record.control_port != 0 {
                return Ok(record.control_port);
            }
        }
        self.runtime
            .inspect(name)
            .await?
            .and_then(|container| container.host_port_for(self.settings.container_control_port))
            .ok_or_else(|| ContainerError::NotFound(name.to_string()))
    }

    /// Polls the container's health endpoint until it answers or `timeout`
    /// elapses. A timeout is reported as `false` and leaves the container
    /// `unhealthy`.
    pub async fn wait_for_container_ready(
        &self,
        name: &str,
        timeout: Duration,
        poll_interval: Duration,
    ) -> ContainerResult<bool> {
        let port = self.control_port(name).await?;
        let deadline = Instant::now() + timeout;
        tracing::debug!(container = %name, port, ?timeout, "waiting for container readiness");

        loop {
            if self.probe.is_healthy(port).await {
                self.store.lock().await.mark(name, ContainerStatus::Ready);
                tracing::info!(container = %name, "container ready");
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep(poll_interval.min(deadline - now)).await;
        }

        self.store.lock().await.mark(name, ContainerStatus::Unhealthy);
        tracing::warn!(container = %name, ?timeout, "container not ready before timeout");
        Ok(false)
    }

    /// Waits on every container concurrently; unknown containers report false.
    pub async fn wait_for_containers_ready(
        &self,
        names: &[String],
        timeout: Duration,
        poll_interval: Duration,
    ) -> HashMap<String, bool> {
        let waits = names.iter().map(|name| async move {
            let ready = match self.wait_for_container_ready(name, timeout, poll_interval).await {
                Ok(ready) => ready,
                Err(e) => {
                    tracing::warn!(container = %name, error = %e, "readiness wait failed");
                    false
                }
            };
            (name.clone(), ready)
        });
        join_all(waits).await.into_iter().collect()
    }

    pub async fn list_containers(&self) -> ContainerResult<Vec<ContainerInfo>> {
        let containers = self.refresh().await?;
        let store = self.store.lock().await;
        let mut infos: Vec<ContainerInfo> = containers
            .iter()
            .map(|container| {
                let mut info = container_info(&container.name, Some(container), store.get(&container.name));
                info.index = info.index.or_else(|| store.index_of(&container.name));
                info
            })
            .collect();
        infos.sort_by(|a, b| a.index.cmp(&b.index).then_with(|| a.name.cmp(&b.name)));
        Ok(infos)
    }

    pub async fn get_container_info(&self, name: &str) -> ContainerResult<Option<ContainerInfo>> {
        let inspected = self.runtime.inspect(name).await?;
        let mut store = self.store.lock().await;
        match inspected {
            Some(container) => {
                let mut info = container_info(name, Some(&container), store.get(name));
                info.index = info.index.or_else(|| store.index_of(name));
                Ok(Some(info))
            }
            None => {
                store.mark(name, ContainerStatus::Removed);
                Ok(None)
            }
        }
    }

    /// Normalizes a bare index or full name to a tracked container name.
    pub async fn resolve_container_name(&self, identifier: &str) -> ContainerResult<String> {
        let identifier = identifier.trim();
        let name = if !identifier.is_empty() && identifier.chars().all(|c| c.is_ascii_digit()) {
            format!("{}_{}", self.prefix(), identifier)
        } else {
            identifier.to_string()
        };

        if self
            .store
            .lock()
            .await
            .get(&name)
            .is_some_and(|record| record.status.is_live())
        {
            return Ok(name);
        }
        match self.runtime.inspect(&name).await? {
            Some(_) => Ok(name),
            None => Err(ContainerError::NotFound(identifier.to_string())),
        }
    }

    /// Host-side ADB serial for a container, e.g. `localhost:5557`.
    pub async fn adb_serial(&self, name: &str) -> ContainerResult<String> {
        if let Some(record) = self.store.lock().await.get(name) {
            if record.status.is_live() && record.adb_port != 0 {
                return Ok(record.adb_serial.clone());
            }
        }
        self.runtime
            .inspect(name)
            .await?
            .and_then(|container| container.host_port_for(self.settings.container_adb_port))
            .map(|port| format!("localhost:{port}"))
            .ok_or_else(|| ContainerError::NotFound(name.to_string()))
    }

    /// Stops and removes a container. Removing one that does not exist is a
    /// successful no-op; the result says whether anything was removed.
    pub async fn remove_container(&self, name: &str) -> ContainerResult<bool> {
        let existed = self.runtime.stop_and_remove(name).await?;
        self.store.lock().await.mark(name, ContainerStatus::Removed);
        if existed {
            tracing::info!(container = %name, "container removed");
        } else {
            tracing::debug!(container = %name, "container already gone");
        }
        Ok(existed)
    }

    /// Best-effort removal of `names`, or of every prefixed container when
    /// `names` is `None`.
    pub async fn remove_containers(&self, names: Option<Vec<String>>) -> RemovalReport {
        let names = match names {
            Some(names) => {
                let prefix = self.prefix();
                names
                    .into_iter()
                    .map(|name| {
                        if !name.is_empty() && name.chars().all(|c| c.is_ascii_digit()) {
                            format!("{prefix}_{name}")
                        } else {
                            name
                        }
                    })
                    .collect::<Vec<_>>()
            }
            None => match self.runtime.list(self.prefix()).await {
                Ok(containers) => containers.into_iter().map(|c| c.name).collect(),
                Err(e) => {
                    tracing::warn!(error = %e, "listing failed, removing tracked containers only");
                    self.store
                        .lock()
                        .await
                        .live()
                        .map(|record| record.name.clone())
                        .collect()
                }
            },
        };

        let mut unique = HashSet::new();
        let removals = names
            .into_iter()
            .filter(|name| unique.insert(name.clone()))
            .map(|name| async move {
                let result = self.remove_container(&name).await;
                (name, result)
            });

        let mut report = RemovalReport::default();
        for (name, result) in join_all(removals).await {
            match result {
                Ok(_) => report.removed.push(name),
                Err(e) => {
                    tracing::warn!(container = %name, error = %e, "failed to remove container");
                    report.failed.push(name);
                }
            }
        }
        report
    }

    /// Kills the in-container server process. An already stopped process
    /// counts as success.
    pub async fn kill_server_in_container(&self, name: &str) -> ContainerResult<bool> {
        let command = format!("pkill -f '{}' || true", self.settings.server_process_pattern);
        let exit = self.runtime.exec(name, &command, false).await?;
        if exit == 0 || exit == SIGTERM_EXIT {
            tracing::debug!(container = %name, exit, "server process stopped");
            Ok(true)
        } else {
            tracing::warn!(container = %name, exit, "unexpected exit code stopping server");
            Ok(false)
        }
    }

    /// Restarts only the application server inside the container, keeping
    /// the container and its emulator state.
    pub async fn restart_server_in_container(&self, name: &str) -> bool {
        match self.kill_server_in_container(name).await {
            Ok(_) => {}
            Err(ContainerError::NotFound(_)) => {
                tracing::warn!(container = %name, "cannot restart server, container not found");
                return false;
            }
            Err(e) => tracing::warn!(container = %name, error = %e, "stopping server failed, starting anyway"),
        }

        tokio::time::sleep(self.settings.restart_settle()).await;

        match self
            .runtime
            .exec(name, &self.settings.server_command, true)
            .await
        {
            Ok(_) => {
                self.store.lock().await.mark(name, ContainerStatus::Starting);
                tracing::info!(container = %name, "server restarted");
                true
            }
            Err(e) => {
                tracing::error!(container = %name, error = %e, "failed to start server");
                false
            }
        }
    }

    pub async fn check_prerequisites(&self) -> PrerequisiteReport {
        prereq::check_prerequisites(self.runtime.as_ref()).await
    }
}

fn container_info(
    name: &str,
    runtime: Option<&RuntimeContainer>,
    record: Option<&ContainerRecord>,
) -> ContainerInfo {
    let status = match (runtime, record) {
        (_, Some(record)) => record.status,
        (Some(container), None) if container.running => ContainerStatus::Starting,
        (Some(_), None) => ContainerStatus::Stopped,
        (None, None) => ContainerStatus::Removed,
    };
    ContainerInfo {
        name: name.to_string(),
        index: record.map(|record| record.index),
        status,
        running: runtime.is_some_and(|container| container.running),
        runtime_status: runtime.and_then(|container| container.status.clone()),
        image: runtime
            .and_then(|container| container.image.clone())
            .or_else(|| record.map(|record| record.image.clone())),
        control_port: record.map(|record| record.control_port),
        adb_port: record.map(|record| record.adb_port),
        viewer_port: record.and_then(|record| record.viewer_port),
        vnc_port: record.and_then(|record| record.vnc_port),
        adb_serial: record.map(|record| record.adb_serial.clone()),
        started_at: runtime.and_then(|container| container.started_at.clone()),
        created_at: record.map(|record| record.created_at),
    }
}
