//! VM lifecycle: spawn, start, stop, delete, inspect and archive VMs.
//!
//! A VM is its disk (`vms/<name>.qcow2`), an optional state record and, while
//! it runs, a pidfile and control socket. Running/stopped is never stored; it
//! is recomputed by probing the recorded pid on every query.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::config::{EngineConfig, validate_vm_name};
use crate::error::NidoError;
use crate::hypervisor::{Hypervisor, LaunchSpec};
use crate::keys;
use crate::paths::{Layout, TEMPLATE_SUFFIX};
use crate::ports;
use crate::process::{self, OsProcesses, ProcessTable, Signal};
use crate::qmp;
use crate::state::{StateStore, VmState, VmStateRecord};
use crate::util;

/// How long `create_template` waits for a clean shutdown before killing.
const SHUTDOWN_WAIT: Duration = Duration::from_secs(10);
const SHUTDOWN_POLL: Duration = Duration::from_millis(200);

/// Resolves catalog references to verified local image files.
#[allow(async_fn_in_trait)] // trait is internal-only
pub trait ImageProvider {
    async fn provide(&self, name: &str, version: &str) -> Result<PathBuf, NidoError>;
}

/// Where a new VM's disk comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnSource {
    /// Existing disk file used as the backing image.
    Disk(PathBuf),
    /// Archived template from the template store.
    Template(String),
    /// Catalog reference; empty version means `latest`.
    Image { name: String, version: String },
    /// A template if one exists by this name, else a catalog image.
    Named(String),
}

impl SpawnSource {
    /// `name:version` is a catalog reference; anything path-like is a disk.
    pub fn parse(source: &str) -> Self {
        let path_like = source.contains('/')
            || source.contains('\\')
            || source.ends_with(".qcow2")
            || source.ends_with(".img")
            || source.ends_with(".raw");
        if path_like {
            return SpawnSource::Disk(PathBuf::from(source));
        }
        match source.split_once(':') {
            Some((name, version)) => SpawnSource::Image {
                name: name.to_string(),
                version: version.to_string(),
            },
            None => SpawnSource::Named(source.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    pub gui: bool,
    /// Falls back to the configured default.
    pub memory_mb: Option<u64>,
    pub cpus: Option<u32>,
    pub ssh_user: Option<String>,
    /// Prebuilt seed image attached as a CD-ROM on every boot.
    pub seed: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StartOptions {
    /// Overrides the recorded GUI flag when set.
    pub gui: Option<bool>,
}

#[derive(Debug)]
pub enum StartOutcome {
    AlreadyRunning { pid: u32 },
    Launched {
        pid: u32,
        /// Detached boot key injection; always terminates.
        key_injection: JoinHandle<()>,
    },
}

impl StartOutcome {
    pub fn pid(&self) -> u32 {
        match self {
            StartOutcome::AlreadyRunning { pid } | StartOutcome::Launched { pid, .. } => *pid,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmInfo {
    pub name: String,
    pub state: VmState,
    /// Set only while running.
    pub pid: Option<u32>,
    pub ssh_port: Option<u16>,
    pub vnc_port: Option<u16>,
    pub ssh_user: String,
    pub gui: bool,
    pub memory_mb: u64,
    pub cpus: u32,
    pub disk_path: PathBuf,
    pub disk_exists: bool,
    pub base_image: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateInfo {
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DoctorCheck {
    pub name: String,
    pub ok: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DoctorReport {
    pub checks: Vec<DoctorCheck>,
}

impl DoctorReport {
    pub fn all_ok(&self) -> bool {
        self.checks.iter().all(|c| c.ok)
    }

    fn push(&mut self, name: impl Into<String>, ok: bool, detail: impl Into<String>) {
        self.checks.push(DoctorCheck {
            name: name.into(),
            ok,
            detail: detail.into(),
        });
    }
}

pub struct VmManager<H, P = OsProcesses> {
    config: EngineConfig,
    hypervisor: H,
    processes: P,
    store: StateStore,
}

impl<H: Hypervisor, P: ProcessTable> VmManager<H, P> {
    pub fn new(config: EngineConfig, hypervisor: H, processes: P) -> Self {
        let store = StateStore::new(config.layout.run_dir());
        Self {
            config,
            hypervisor,
            processes,
            store,
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.config.layout
    }

    pub fn hypervisor(&self) -> &H {
        &self.hypervisor
    }

    /// Create the data root directories.
    pub async fn prepare(&self) -> Result<(), NidoError> {
        let layout = self.layout();
        for dir in [
            layout.vms_dir(),
            layout.run_dir(),
            layout.images_dir(),
            layout.logs_dir(),
            layout.templates_dir().to_path_buf(),
        ] {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| NidoError::Io {
                    context: format!("creating directory {}", dir.display()),
                    source: e,
                })?;
        }
        Ok(())
    }

    // ── spawn / start ────────────────────────────────────

    /// Create a VM with a copy-on-write disk over `source`, then boot it.
    ///
    /// Nothing is written for the VM until its backing image is resolved and
    /// verified.
    pub async fn spawn(
        &self,
        name: &str,
        source: SpawnSource,
        options: SpawnOptions,
        images: &impl ImageProvider,
    ) -> Result<StartOutcome, NidoError> {
        validate_vm_name(name)?;
        let layout = self.layout();
        let disk = layout.disk_path(name);
        if exists(&disk).await || exists(&layout.state_path(name)).await {
            return Err(NidoError::Validation {
                message: format!("VM '{name}' already exists"),
            });
        }

        let base = self.resolve_source(&source, images).await?;

        if let Some(seed) = &options.seed
            && !exists(seed).await
        {
            return Err(NidoError::not_found("seed image", seed.display().to_string()));
        }

        if let Err(e) = self.hypervisor.create_overlay(&base, &disk).await {
            let _ = tokio::fs::remove_file(&disk).await;
            return Err(e);
        }

        if let Some(seed) = &options.seed {
            let dest = layout.seed_path(name);
            if let Err(e) = tokio::fs::copy(seed, &dest).await {
                let _ = tokio::fs::remove_file(&disk).await;
                return Err(NidoError::Io {
                    context: format!("copying seed {} to {}", seed.display(), dest.display()),
                    source: e,
                });
            }
        }

        let ssh_user = options
            .ssh_user
            .unwrap_or_else(|| self.config.ssh_user.clone());
        let mut record = VmStateRecord::new(name, &ssh_user);
        record.gui = options.gui;
        record.memory_mb = options.memory_mb.unwrap_or(self.config.memory_mb);
        record.cpus = options.cpus.unwrap_or(self.config.cpus);
        record.base_image = Some(base.display().to_string());
        self.store.save(&record).await?;

        tracing::info!(vm = name, base = %base.display(), "VM created");
        self.start(name, StartOptions::default()).await
    }

    async fn resolve_source(
        &self,
        source: &SpawnSource,
        images: &impl ImageProvider,
    ) -> Result<PathBuf, NidoError> {
        match source {
            SpawnSource::Disk(path) => {
                if !exists(path).await {
                    return Err(NidoError::not_found("disk", path.display().to_string()));
                }
                Ok(path.clone())
            }
            SpawnSource::Template(template) => {
                let path = self.layout().template_path(template);
                if !exists(&path).await {
                    return Err(NidoError::not_found("template", template.clone()));
                }
                Ok(path)
            }
            SpawnSource::Image { name, version } => images.provide(name, version).await,
            SpawnSource::Named(name) => {
                let template = self.layout().template_path(name);
                if exists(&template).await {
                    tracing::debug!(template = %name, "spawning from template");
                    Ok(template)
                } else {
                    images.provide(name, "").await
                }
            }
        }
    }

    /// Boot a VM. Succeeds without relaunching if it is already running.
    pub async fn start(&self, name: &str, options: StartOptions) -> Result<StartOutcome, NidoError> {
        validate_vm_name(name)?;
        let layout = self.layout();
        let disk = layout.disk_path(name);
        let disk_exists = exists(&disk).await;

        let mut record = match self.store.load(name).await {
            Ok(record) => record,
            // Disks made by `create_disk` have no record until first boot.
            Err(NidoError::NotFound { .. }) if disk_exists => {
                let mut record = VmStateRecord::new(name, &self.config.ssh_user);
                record.memory_mb = self.config.memory_mb;
                record.cpus = self.config.cpus;
                record
            }
            Err(e) => return Err(e),
        };

        if let Some(pid) = self.live_pid(name, &record).await {
            tracing::debug!(vm = name, pid, "already running");
            return Ok(StartOutcome::AlreadyRunning { pid });
        }

        if !disk_exists {
            return Err(NidoError::not_found("disk", disk.display().to_string()));
        }

        if let Some(gui) = options.gui {
            record.gui = gui;
        }
        if record.memory_mb == 0 {
            record.memory_mb = self.config.memory_mb;
        }
        if record.cpus == 0 {
            record.cpus = self.config.cpus;
        }
        self.assign_ports(&mut record).await?;
        record.pid = 0;
        self.store.save(&record).await?;

        let platform = self.hypervisor.platform();
        let control = platform.control_endpoint(&layout.qmp_path(name), record.qmp_port);
        let seed = layout.seed_path(name);
        let spec = LaunchSpec {
            name: name.to_string(),
            disk,
            seed: exists(&seed).await.then_some(seed),
            memory_mb: record.memory_mb,
            cpus: record.cpus,
            ssh_port: record.ssh_port,
            vnc_port: if record.gui { record.vnc_port } else { None },
            control: control.clone(),
            pidfile: layout.pid_path(name),
            serial_log: layout.serial_log_path(name),
        };

        let pid = self.hypervisor.launch(&spec).await?;
        record.pid = pid;
        self.store.save(&record).await?;
        tracing::info!(vm = name, pid, ssh_port = record.ssh_port, vnc_port = ?spec.vnc_port, "VM started");

        let key_injection =
            keys::spawn_boot_keys(name.to_string(), control, self.config.key_injection.clone());
        Ok(StartOutcome::Launched { pid, key_injection })
    }

    /// Allocate whatever ports the record lacks. Assigned ports are kept
    /// across restarts.
    async fn assign_ports(&self, record: &mut VmStateRecord) -> Result<(), NidoError> {
        let others = self.store.load_all().await?;
        let mut reserved = ports::reserved_ports(&others, &record.name);

        if record.ssh_port == 0 {
            let (start, end) = self.config.ssh_ports;
            record.ssh_port = ports::find_available_port(start, end, &reserved)?;
            tracing::info!(vm = %record.name, port = record.ssh_port, "assigned SSH port");
        }
        reserved.insert(record.ssh_port);

        if record.gui && record.vnc_port.is_none() {
            let (start, end) = self.config.vnc_ports;
            let port = ports::find_available_port(start, end, &reserved)?;
            tracing::info!(vm = %record.name, port, "assigned VNC port");
            record.vnc_port = Some(port);
        }
        reserved.extend(record.vnc_port);

        if self.hypervisor.platform().uses_tcp_control() && record.qmp_port.is_none() {
            let (start, end) = self.config.ssh_ports;
            let port = ports::find_available_port(start, end, &reserved)?;
            tracing::info!(vm = %record.name, port, "assigned control port");
            record.qmp_port = Some(port);
        }
        Ok(())
    }

    // ── stop / delete ────────────────────────────────────

    /// Signal the VM's process and forget it. `graceful` sends an interrupt,
    /// otherwise the process is killed. Does not wait for the exit.
    pub async fn stop(&self, name: &str, graceful: bool) -> Result<(), NidoError> {
        validate_vm_name(name)?;
        let layout = self.layout();
        let record = self.store.load(name).await.ok();
        let pidfile = layout.pid_path(name);
        if record.is_none() && !exists(&pidfile).await && !exists(&layout.disk_path(name)).await {
            return Err(NidoError::not_found("VM", name));
        }

        let pid = match process::read_pidfile(&pidfile).await {
            Some(pid) => pid,
            None => record.as_ref().map(|r| r.pid).unwrap_or(0),
        };
        if pid != 0 && self.processes.is_alive(pid) {
            let signal = if graceful { Signal::Interrupt } else { Signal::Kill };
            match self.processes.signal(pid, signal) {
                Ok(()) => tracing::info!(vm = name, pid, ?signal, "stop signal sent"),
                Err(e) => tracing::warn!(vm = name, pid, error = %e, "failed to signal VM process"),
            }
        } else {
            tracing::debug!(vm = name, "not running");
        }

        let _ = tokio::fs::remove_file(&pidfile).await;
        let _ = tokio::fs::remove_file(layout.qmp_path(name)).await;

        if let Some(mut record) = record
            && record.pid != 0
        {
            record.pid = 0;
            self.store.save(&record).await?;
        }
        Ok(())
    }

    /// Kill the VM if running and remove every file it owns. A disk that
    /// cannot be removed is reported after the rest is cleaned up.
    pub async fn delete(&self, name: &str) -> Result<(), NidoError> {
        validate_vm_name(name)?;
        let layout = self.layout();
        let disk = layout.disk_path(name);
        let known = exists(&disk).await
            || exists(&layout.state_path(name)).await
            || exists(&layout.pid_path(name)).await;
        if !known {
            return Err(NidoError::not_found("VM", name));
        }

        self.stop(name, false).await?;

        let disk_result = match tokio::fs::remove_file(&disk).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(NidoError::Io {
                context: format!("removing {}", disk.display()),
                source: e,
            }),
        };

        if let Err(e) = self.store.remove(name).await {
            tracing::warn!(vm = name, error = %e, "failed to remove state record");
        }
        for leftover in [
            layout.seed_path(name),
            layout.pid_path(name),
            layout.qmp_path(name),
            layout.serial_log_path(name),
        ] {
            let _ = tokio::fs::remove_file(&leftover).await;
        }

        disk_result?;
        tracing::info!(vm = name, "VM deleted");
        Ok(())
    }

    /// Delete every stopped VM. Returns how many were removed.
    pub async fn prune(&self) -> Result<usize, NidoError> {
        let mut removed = 0;
        for vm in self.list().await? {
            if vm.state.is_running() {
                continue;
            }
            match self.delete(&vm.name).await {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!(vm = %vm.name, error = %e, "prune: delete failed"),
            }
        }
        Ok(removed)
    }

    // ── inspection ───────────────────────────────────────

    /// Every VM with a disk, a state record or a pidfile.
    pub async fn list(&self) -> Result<Vec<VmInfo>, NidoError> {
        let layout = self.layout();
        let mut names: BTreeSet<String> = self.store.names().await?.into_iter().collect();
        names.extend(file_stems(&layout.vms_dir(), ".qcow2").await?);
        names.extend(file_stems(&layout.run_dir(), ".pid").await?);

        let mut vms = Vec::with_capacity(names.len());
        for name in names {
            vms.push(self.describe(&name).await);
        }
        Ok(vms)
    }

    pub async fn info(&self, name: &str) -> Result<VmInfo, NidoError> {
        validate_vm_name(name)?;
        let layout = self.layout();
        let known = exists(&layout.disk_path(name)).await
            || exists(&layout.state_path(name)).await
            || exists(&layout.pid_path(name)).await;
        if !known {
            return Err(NidoError::not_found("VM", name));
        }
        Ok(self.describe(name).await)
    }

    async fn describe(&self, name: &str) -> VmInfo {
        let layout = self.layout();
        let record = self
            .store
            .load(name)
            .await
            .unwrap_or_else(|_| VmStateRecord::new(name, &self.config.ssh_user));
        let pid = self.live_pid(name, &record).await;
        let disk_path = layout.disk_path(name);
        let disk_exists = tokio::fs::metadata(&disk_path)
            .await
            .is_ok_and(|m| m.is_file());

        VmInfo {
            name: name.to_string(),
            state: VmState::from_liveness(pid.is_some()),
            pid,
            ssh_port: (record.ssh_port != 0).then_some(record.ssh_port),
            vnc_port: record.vnc_port,
            ssh_user: record.ssh_user,
            gui: record.gui,
            memory_mb: record.memory_mb,
            cpus: record.cpus,
            disk_path,
            disk_exists,
            base_image: record.base_image,
        }
    }

    /// The pid from the pidfile, else from the record, if that process is
    /// alive.
    async fn live_pid(&self, name: &str, record: &VmStateRecord) -> Option<u32> {
        let pid = process::read_pidfile(&self.layout().pid_path(name))
            .await
            .unwrap_or(record.pid);
        (pid != 0 && self.processes.is_alive(pid)).then_some(pid)
    }

    /// Base images backing running VMs.
    pub async fn backing_images_in_use(&self) -> Result<HashSet<PathBuf>, NidoError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|vm| vm.state.is_running())
            .filter_map(|vm| vm.base_image.map(PathBuf::from))
            .collect())
    }

    /// `ssh` argv for the VM's forwarded port.
    pub async fn ssh_command(&self, name: &str) -> Result<Vec<String>, NidoError> {
        validate_vm_name(name)?;
        let record = self.store.load(name).await?;
        if record.ssh_port == 0 {
            return Err(NidoError::Validation {
                message: format!("VM '{name}' has not been started yet; no SSH port assigned"),
            });
        }
        let user = if record.ssh_user.is_empty() {
            &self.config.ssh_user
        } else {
            &record.ssh_user
        };
        Ok(vec![
            "ssh".into(),
            "-p".into(),
            record.ssh_port.to_string(),
            "-o".into(),
            "StrictHostKeyChecking=no".into(),
            "-o".into(),
            "UserKnownHostsFile=/dev/null".into(),
            format!("{user}@127.0.0.1"),
        ])
    }

    // ── disks and templates ──────────────────────────────

    /// Blank disk for a VM to be installed from scratch. `size` is e.g. `20G`.
    pub async fn create_disk(&self, name: &str, size: &str) -> Result<PathBuf, NidoError> {
        validate_vm_name(name)?;
        let bytes = util::parse_size(size)?;
        let disk = self.layout().disk_path(name);
        if exists(&disk).await {
            return Err(NidoError::Validation {
                message: format!("disk for '{name}' already exists"),
            });
        }
        self.hypervisor.create_blank(&disk, bytes).await?;
        Ok(disk)
    }

    /// Stop `vm` and archive its disk, flattened and compressed, as
    /// `template`.
    pub async fn create_template(&self, vm: &str, template: &str) -> Result<PathBuf, NidoError> {
        validate_vm_name(vm)?;
        validate_vm_name(template)?;
        let layout = self.layout();
        let disk = layout.disk_path(vm);
        if !exists(&disk).await {
            return Err(NidoError::not_found("disk", disk.display().to_string()));
        }
        let dest = layout.template_path(template);
        if exists(&dest).await {
            return Err(NidoError::Validation {
                message: format!("template '{template}' already exists"),
            });
        }

        self.shut_down(vm).await?;
        self.hypervisor.compact(&disk, &dest).await?;
        tracing::info!(vm, template, path = %dest.display(), "template created");
        Ok(dest)
    }

    /// ACPI powerdown over the control socket (interrupt signal if the
    /// socket does not answer), bounded wait, then kill.
    async fn shut_down(&self, name: &str) -> Result<(), NidoError> {
        let record = self
            .store
            .load(name)
            .await
            .unwrap_or_else(|_| VmStateRecord::new(name, ""));
        let Some(pid) = self.live_pid(name, &record).await else {
            return Ok(());
        };

        let endpoint = self
            .hypervisor
            .platform()
            .control_endpoint(&self.layout().qmp_path(name), record.qmp_port);
        let powerdown = match qmp::connect(&endpoint, qmp::DEFAULT_TIMEOUT).await {
            Ok(mut client) => client.system_powerdown().await,
            Err(e) => Err(e),
        };
        match powerdown {
            Ok(()) => tracing::info!(vm = name, pid, "ACPI powerdown requested"),
            Err(e) => {
                tracing::debug!(vm = name, error = %e, "control socket unavailable, interrupting");
                if let Err(e) = self.processes.signal(pid, Signal::Interrupt) {
                    tracing::warn!(vm = name, pid, error = %e, "failed to signal VM process");
                }
            }
        }

        let deadline = tokio::time::Instant::now() + SHUTDOWN_WAIT;
        while self.processes.is_alive(pid) {
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(vm = name, pid, "VM did not exit in time, killing");
                break;
            }
            tokio::time::sleep(SHUTDOWN_POLL).await;
        }

        // Kills a straggler and clears the pidfile, socket and recorded pid.
        self.stop(name, false).await
    }

    pub async fn list_templates(&self) -> Result<Vec<TemplateInfo>, NidoError> {
        let dir = self.layout().templates_dir();
        let mut templates = Vec::new();
        for name in file_stems(dir, TEMPLATE_SUFFIX).await? {
            let path = self.layout().template_path(&name);
            let size_bytes = tokio::fs::metadata(&path)
                .await
                .map(|m| m.len())
                .unwrap_or(0);
            templates.push(TemplateInfo {
                name,
                path,
                size_bytes,
            });
        }
        Ok(templates)
    }

    pub async fn delete_template(&self, template: &str) -> Result<(), NidoError> {
        validate_vm_name(template)?;
        let path = self.layout().template_path(template);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                tracing::info!(template, "template deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(NidoError::not_found("template", template))
            }
            Err(e) => Err(NidoError::Io {
                context: format!("removing {}", path.display()),
                source: e,
            }),
        }
    }

    // ── environment ──────────────────────────────────────

    /// Check binaries, data directories and hardware acceleration.
    pub async fn doctor(&self) -> DoctorReport {
        let mut report = DoctorReport::default();

        for binary in self.hypervisor.required_binaries() {
            match which::which(&binary) {
                Ok(path) => report.push(binary, true, path.display().to_string()),
                Err(_) => report.push(binary, false, "not found on PATH"),
            }
        }

        let layout = self.layout();
        for (label, dir) in [
            ("vms directory", layout.vms_dir()),
            ("run directory", layout.run_dir()),
            ("image cache", layout.images_dir()),
            ("logs directory", layout.logs_dir()),
            ("template store", layout.templates_dir().to_path_buf()),
        ] {
            let ok = tokio::fs::metadata(&dir).await.is_ok_and(|m| m.is_dir());
            report.push(label, ok, dir.display().to_string());
        }

        let platform = self.hypervisor.platform();
        let accel = platform.hardware_accel();
        let detail = if accel {
            format!("{} ({})", platform.name(), platform.accel_args().join(" "))
        } else {
            format!("{}: software emulation only, VMs will be slow", platform.name())
        };
        report.push("hardware acceleration", accel, detail);

        report
    }
}

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// Names of files in `dir` ending with `suffix`, with the suffix stripped.
async fn file_stems(dir: &Path, suffix: &str) -> Result<Vec<String>, NidoError> {
    let mut stems = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(stems),
        Err(e) => {
            return Err(NidoError::Io {
                context: format!("reading {}", dir.display()),
                source: e,
            });
        }
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let file_name = entry.file_name();
        if let Some(stem) = file_name.to_str().and_then(|f| f.strip_suffix(suffix))
            && !stem.is_empty()
        {
            stems.push(stem.to_string());
        }
    }
    stems.sort();
    Ok(stems)
}
