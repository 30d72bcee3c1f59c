//! Host-specific hypervisor knobs: acceleration, CPU model, control endpoint
//! transport. One strategy is picked at startup by [`detect`].

use std::fmt;
use std::path::{Path, PathBuf};

/// Where the hypervisor exposes its control socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEndpoint {
    Unix(PathBuf),
    Tcp(u16),
}

impl ControlEndpoint {
    /// Value for QEMU's `-qmp` option.
    pub fn qemu_arg(&self) -> String {
        match self {
            ControlEndpoint::Unix(path) => format!("unix:{},server=on,wait=off", path.display()),
            ControlEndpoint::Tcp(port) => format!("tcp:127.0.0.1:{port},server=on,wait=off"),
        }
    }
}

impl fmt::Display for ControlEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlEndpoint::Unix(path) => write!(f, "{}", path.display()),
            ControlEndpoint::Tcp(port) => write!(f, "127.0.0.1:{port}"),
        }
    }
}

pub trait HostPlatform: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Arguments selecting the accelerator.
    fn accel_args(&self) -> Vec<String>;

    /// True when a hardware accelerator will be used.
    fn hardware_accel(&self) -> bool;

    fn cpu_model(&self) -> &'static str {
        if self.hardware_accel() { "host" } else { "max" }
    }

    /// Control sockets are Unix sockets unless the host lacks them.
    fn uses_tcp_control(&self) -> bool {
        false
    }

    fn control_endpoint(&self, socket: &Path, tcp_port: Option<u16>) -> ControlEndpoint {
        match tcp_port {
            Some(port) if self.uses_tcp_control() => ControlEndpoint::Tcp(port),
            _ => ControlEndpoint::Unix(socket.to_path_buf()),
        }
    }

    /// Whether the hypervisor can fork itself into the background and write
    /// its own pidfile.
    fn can_daemonize(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Linux {
    pub kvm: bool,
}

impl HostPlatform for Linux {
    fn name(&self) -> &'static str {
        "linux"
    }

    fn accel_args(&self) -> Vec<String> {
        let accel = if self.kvm { "kvm" } else { "tcg" };
        vec!["-accel".into(), accel.into()]
    }

    fn hardware_accel(&self) -> bool {
        self.kvm
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MacOs;

impl HostPlatform for MacOs {
    fn name(&self) -> &'static str {
        "macos"
    }

    fn accel_args(&self) -> Vec<String> {
        vec!["-accel".into(), "hvf".into()]
    }

    fn hardware_accel(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Windows;

impl HostPlatform for Windows {
    fn name(&self) -> &'static str {
        "windows"
    }

    fn accel_args(&self) -> Vec<String> {
        vec!["-accel".into(), "whpx,kernel-irqchip=off".into()]
    }

    fn hardware_accel(&self) -> bool {
        true
    }

    fn uses_tcp_control(&self) -> bool {
        true
    }

    fn can_daemonize(&self) -> bool {
        false
    }
}

/// Pure emulation for hosts without a supported accelerator.
#[derive(Debug, Clone, Copy)]
pub struct Software;

impl HostPlatform for Software {
    fn name(&self) -> &'static str {
        "software"
    }

    fn accel_args(&self) -> Vec<String> {
        vec!["-accel".into(), "tcg".into()]
    }

    fn hardware_accel(&self) -> bool {
        false
    }
}

/// Select the strategy for the running host.
pub fn detect() -> Box<dyn HostPlatform> {
    if cfg!(target_os = "linux") {
        Box::new(Linux {
            kvm: Path::new("/dev/kvm").exists(),
        })
    } else if cfg!(target_os = "macos") {
        Box::new(MacOs)
    } else if cfg!(windows) {
        Box::new(Windows)
    } else {
        Box::new(Software)
    }
}

/// Default `qemu-system-*` binary and machine type for the host architecture.
pub fn default_qemu_system() -> (&'static str, &'static str) {
    match std::env::consts::ARCH {
        "aarch64" => ("qemu-system-aarch64", "virt"),
        _ => ("qemu-system-x86_64", "q35"),
    }
}
