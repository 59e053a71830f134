use std::{fs::OpenOptions, path::Path};

use serde::{Serialize, ser::SerializeStruct};
use sysinfo::{Disks, System};

use super::runtime::ContainerRuntime;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrerequisiteCheck {
    pub name: String,
    pub passed: bool,
    pub message: String,
    pub details: Option<String>,
}

impl PrerequisiteCheck {
    fn pass(name: &str, message: impl Into<String>, details: Option<String>) -> Self {
        Self {
            name: name.to_string(),
            passed: true,
            message: message.into(),
            details,
        }
    }

    fn fail(name: &str, message: impl Into<String>, details: Option<String>) -> Self {
        Self {
            name: name.to_string(),
            passed: false,
            message: message.into(),
            details,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HostResources {
    pub cpu_usage: f32,
    pub total_memory: u64,
    pub used_memory: u64,
    pub total_swap: u64,
    pub used_swap: u64,
    pub system_name: String,
    pub hostname: String,
    pub total_cpus: u64,
    pub disk_usage: f32,
}

impl Serialize for HostResources {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut state = serializer.serialize_struct("HostResources", 9)?;
        state.serialize_field("cpu_usage", &format!("{:.2}%", self.cpu_usage))?;
        state.serialize_field("total_memory", &format!("{} MB", self.total_memory))?;
        state.serialize_field("used_memory", &format!("{} MB", self.used_memory))?;
        state.serialize_field("total_swap", &format!("{} MB", self.total_swap))?;
        state.serialize_field("used_swap", &format!("{} MB", self.used_swap))?;
        state.serialize_field("system_name", &self.system_name)?;
        state.serialize_field("hostname", &self.hostname)?;
        state.serialize_field("total_cpus", &self.total_cpus)?;
        state.serialize_field("disk_usage", &format!("{:.2}%", self.disk_usage))?;
        state.end()
    }
}

pub fn host_resources() -> HostResources {
    let mut sysinfo = System::new_all();
    sysinfo.refresh_all();

    HostResources {
        cpu_usage: (sysinfo.global_cpu_usage() * 100.0).round() / 100.0,
        total_memory: sysinfo.total_memory() / 1024 / 1024,
        used_memory: sysinfo.used_memory() / 1024 / 1024,
        total_swap: sysinfo.total_swap() / 1024 / 1024,
        used_swap: sysinfo.used_swap() / 1024 / 1024,
        system_name: System::name().unwrap_or_else(|| "Unknown".to_string()),
        hostname: System::host_name().unwrap_or_else(|| "Unknown".to_string()),
        total_cpus: sysinfo.cpus().len() as u64,
        disk_usage: {
            let disks = Disks::new_with_refreshed_list();
            let used_space: f32 = disks
                .iter()
                .map(|disk| disk.total_space() as f32 - disk.available_space() as f32)
                .sum();
            let total_space: f32 = disks.iter().map(|disk| disk.total_space() as f32).sum();
            if total_space > 0.0 {
                (used_space / total_space) * 100.0
            } else {
                0.0
            }
        },
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PrerequisiteReport {
    pub checks: Vec<PrerequisiteCheck>,
    pub all_passed: bool,
    pub host: HostResources,
}

impl PrerequisiteReport {
    pub fn new(checks: Vec<PrerequisiteCheck>, host: HostResources) -> Self {
        let all_passed = checks.iter().all(|check| check.passed);
        Self {
            checks,
            all_passed,
            host,
        }
    }

    pub fn failed(&self) -> impl Iterator<Item = &PrerequisiteCheck> {
        self.checks.iter().filter(|check| !check.passed)
    }
}

pub async fn check_container_runtime(runtime: &dyn ContainerRuntime) -> PrerequisiteCheck {
    match runtime.ping().await {
        Ok(()) => PrerequisiteCheck::pass("Docker Running", "Docker daemon is reachable", None),
        Err(e) => PrerequisiteCheck::fail(
            "Docker Running",
            "Cannot reach the Docker daemon",
            Some(format!(
                "{e}\nStart Docker (sudo systemctl start docker) or add your user to the docker group"
            )),
        ),
    }
}

pub fn check_kvm(device: &Path) -> PrerequisiteCheck {
    if !device.exists() {
        return PrerequisiteCheck::fail(
            "KVM Available",
            format!("{} device not found", device.display()),
            Some(
                "KVM is required for the Android emulator. Enable virtualization in BIOS and load \
                 the kvm module (sudo modprobe kvm_intel or kvm_amd)"
                    .to_string(),
            ),
        );
    }

    match OpenOptions::new().read(true).write(true).open(device) {
        Ok(_) => PrerequisiteCheck::pass(
            "KVM Available",
            "KVM is available and accessible",
            Some(device.display().to_string()),
        ),
        Err(e) => PrerequisiteCheck::fail(
            "KVM Available",
            format!("{} exists but is not accessible", device.display()),
            Some(format!("{e}\nAdd your user to the kvm group: sudo usermod -aG kvm $USER")),
        ),
    }
}

pub async fn check_prerequisites(runtime: &dyn ContainerRuntime) -> PrerequisiteReport {
    let checks = vec![
        check_container_runtime(runtime).await,
        check_kvm(Path::new("/dev/kvm")),
    ];
    for check in checks.iter().filter(|check| !check.passed) {
        tracing::warn!(check = %check.name, message = %check.message, "prerequisite failed");
    }
    PrerequisiteReport::new(checks, host_resources())
}
