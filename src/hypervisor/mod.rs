pub mod qemu;

use std::path::{Path, PathBuf};

use crate::error::NidoError;
use crate::platform::{ControlEndpoint, HostPlatform};

pub use qemu::Qemu;

/// Everything needed to boot one VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub name: String,
    pub disk: PathBuf,
    pub seed: Option<PathBuf>,
    pub memory_mb: u64,
    pub cpus: u32,
    pub ssh_port: u16,
    pub vnc_port: Option<u16>,
    pub control: ControlEndpoint,
    pub pidfile: PathBuf,
    pub serial_log: PathBuf,
}

#[allow(async_fn_in_trait)] // trait is internal-only
pub trait Hypervisor {
    fn platform(&self) -> &dyn HostPlatform;

    /// Create a copy-on-write disk at `dest` backed by `base`.
    async fn create_overlay(&self, base: &Path, dest: &Path) -> Result<(), NidoError>;

    /// Create an empty disk of `size_bytes`.
    async fn create_blank(&self, dest: &Path, size_bytes: u64) -> Result<(), NidoError>;

    /// Write a compressed, backing-independent copy of `src` to `dest`.
    async fn compact(&self, src: &Path, dest: &Path) -> Result<(), NidoError>;

    /// Start the hypervisor detached from us. Returns its pid.
    async fn launch(&self, spec: &LaunchSpec) -> Result<u32, NidoError>;

    /// Binaries that must be on PATH.
    fn required_binaries(&self) -> Vec<String>;
}

/// Hypervisor arguments for `spec`, excluding daemonization flags.
pub fn build_args(spec: &LaunchSpec, platform: &dyn HostPlatform, machine: &str) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-name".into(),
        spec.name.clone(),
        "-machine".into(),
        machine.into(),
    ];
    args.extend(platform.accel_args());
    args.extend([
        "-cpu".into(),
        platform.cpu_model().into(),
        "-smp".into(),
        spec.cpus.to_string(),
        "-m".into(),
        format!("{}M", spec.memory_mb),
        "-drive".into(),
        format!("file={},if=virtio,format=qcow2", spec.disk.display()),
    ]);

    if let Some(seed) = &spec.seed {
        args.extend([
            "-drive".into(),
            format!("file={},media=cdrom,readonly=on", seed.display()),
        ]);
    }

    args.extend([
        "-netdev".into(),
        format!("user,id=net0,hostfwd=tcp:127.0.0.1:{}-:22", spec.ssh_port),
        "-device".into(),
        "virtio-net-pci,netdev=net0".into(),
        "-qmp".into(),
        spec.control.qemu_arg(),
        "-serial".into(),
        format!("file:{}", spec.serial_log.display()),
    ]);

    match spec.vnc_port {
        // VNC displays are numbered from port 5900.
        Some(port) => args.extend([
            "-vnc".into(),
            format!("127.0.0.1:{}", port.saturating_sub(5900)),
        ]),
        None => args.extend(["-display".into(), "none".into()]),
    }

    args
}
