use std::{
    collections::{BTreeMap, HashSet},
    time::SystemTime,
};

use super::types::{
    ContainerConfig, ContainerError, ContainerRecord, ContainerResult, ContainerStatus,
    RuntimeContainer,
};
use crate::config::ContainerSettings;

/// In-memory catalogue of containers, keyed by name. The single source of
/// truth for which names and host ports are spoken for.
#[derive(Debug, Clone, Default)]
pub struct RecordStore {
    prefix: String,
    records: BTreeMap<String, ContainerRecord>,
}

impl RecordStore {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            records: BTreeMap::new(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn container_name(&self, index: u32) -> String {
        format!("{}_{}", self.prefix, index)
    }

    /// Parses the index out of `{prefix}_{index}`.
    pub fn index_of(&self, name: &str) -> Option<u32> {
        name.strip_prefix(&self.prefix)?
            .strip_prefix('_')?
            .parse()
            .ok()
    }

    pub fn get(&self, name: &str) -> Option<&ContainerRecord> {
        self.records.get(name)
    }

    pub fn live(&self) -> impl Iterator<Item = &ContainerRecord> {
        self.records.values().filter(|record| record.status.is_live())
    }

    pub fn all(&self) -> impl Iterator<Item = &ContainerRecord> {
        self.records.values()
    }

    /// Highest index among records whose container still exists, stopped
    /// ones included, since the runtime keeps their names taken.
    pub fn max_index(&self) -> Option<u32> {
        self.live().map(|record| record.index).max()
    }

    pub fn next_index(&self) -> u32 {
        self.max_index().map_or(0, |index| index + 1)
    }

    pub fn claimed_ports(&self) -> HashSet<u16> {
        self.live().flat_map(ContainerRecord::host_ports).collect()
    }

    /// Records `config` as pending, claiming its name and ports.
    pub fn reserve(&mut self, config: &ContainerConfig) -> ContainerResult<()> {
        if self
            .records
            .get(&config.name)
            .is_some_and(|record| record.status.is_live())
        {
            return Err(ContainerError::NameTaken(config.name.clone()));
        }
        self.records
            .insert(config.name.clone(), ContainerRecord::from_config(config));
        Ok(())
    }

    pub fn mark(&mut self, name: &str, status: ContainerStatus) -> bool {
        match self.records.get_mut(name) {
            Some(record) => {
                if record.status != status {
                    tracing::debug!(container = %name, from = %record.status, to = %status, "container status changed");
                }
                record.status = status;
                true
            }
            None => false,
        }
    }

    pub fn set_container_id(&mut self, name: &str, id: String) {
        if let Some(record) = self.records.get_mut(name) {
            record.container_id = Some(id);
        }
    }

    pub fn forget(&mut self, name: &str) -> Option<ContainerRecord> {
        self.records.remove(name)
    }

    /// Adopts prefixed containers the runtime knows about but the store does
    /// not, so their indices and ports are never handed out again. Stopped
    /// containers are adopted too. Tracked records whose container
    /// disappeared are marked removed.
    pub fn sync_from_runtime(&mut self, containers: &[RuntimeContainer], settings: &ContainerSettings) {
        let seen: HashSet<&str> = containers.iter().map(|c| c.name.as_str()).collect();

        for container in containers {
            let Some(index) = self.index_of(&container.name) else {
                continue;
            };
            if let Some(record) = self
                .records
                .get_mut(&container.name)
                .filter(|record| record.status.is_live())
            {
                let status = match (record.status, container.running) {
                    (ContainerStatus::Pending, _) => continue,
                    (ContainerStatus::Stopped, true) => ContainerStatus::Starting,
                    (_, false) => ContainerStatus::Stopped,
                    (status, true) => status,
                };
                if record.status != status {
                    tracing::debug!(container = %record.name, from = %record.status, to = %status, "container status changed");
                    record.status = status;
                }
                continue;
            }

            let control_port = container
                .host_port_for(settings.container_control_port)
                .unwrap_or(0);
            let adb_port = container.host_port_for(settings.container_adb_port).unwrap_or(0);
            let status = if container.running {
                ContainerStatus::Starting
            } else {
                ContainerStatus::Stopped
            };
            tracing::debug!(container = %container.name, %status, "adopting container from runtime");
            self.records.insert(
                container.name.clone(),
                ContainerRecord {
                    index,
                    name: container.name.clone(),
                    control_port,
                    adb_port,
                    viewer_port: container.host_port_for(settings.container_viewer_port),
                    vnc_port: container.host_port_for(settings.container_vnc_port),
                    adb_serial: format!("localhost:{adb_port}"),
                    image: container.image.clone().unwrap_or_default(),
                    created_at: SystemTime::now(),
                    status,
                    container_id: container.id.clone(),
                },
            );
        }

        for record in self.records.values_mut() {
            // pending records belong to launches still in flight
            if record.status != ContainerStatus::Pending
                && record.status.is_live()
                && !seen.contains(record.name.as_str())
            {
                record.status = ContainerStatus::Removed;
            }
        }
    }
}
