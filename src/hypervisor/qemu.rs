use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use crate::config::EngineConfig;
use crate::error::NidoError;
use crate::platform::{self, HostPlatform};
use crate::process;

use super::{Hypervisor, LaunchSpec, build_args};

/// QEMU magic: `QFI\xfb`.
const QCOW2_MAGIC: [u8; 4] = [0x51, 0x46, 0x49, 0xFB];

#[derive(Debug)]
pub struct Qemu {
    system: String,
    machine: &'static str,
    img: String,
    platform: Box<dyn HostPlatform>,
}

impl Qemu {
    /// QEMU for the running host, honoring binary overrides from config.
    pub fn new(config: &EngineConfig) -> Self {
        Self::with_platform(config, platform::detect())
    }

    pub fn with_platform(config: &EngineConfig, platform: Box<dyn HostPlatform>) -> Self {
        let (default_system, machine) = platform::default_qemu_system();
        Self {
            system: config
                .qemu_system
                .clone()
                .unwrap_or_else(|| default_system.to_string()),
            machine,
            img: config.qemu_img.clone(),
            platform,
        }
    }

    async fn qemu_img(&self, args: &[&OsStr], dest: &Path) -> Result<(), NidoError> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| NidoError::Io {
                    context: format!("creating directory {}", parent.display()),
                    source: e,
                })?;
        }

        let output = tokio::process::Command::new(&self.img)
            .args(args)
            .output()
            .await
            .map_err(|e| NidoError::DiskCreation {
                path: dest.display().to_string(),
                message: format!("running {}: {e}", self.img),
            })?;

        if !output.status.success() {
            return Err(NidoError::DiskCreation {
                path: dest.display().to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    async fn launch_daemonized(&self, spec: &LaunchSpec, args: Vec<String>) -> Result<u32, NidoError> {
        let output = tokio::process::Command::new(&self.system)
            .args(&args)
            .args(["-daemonize", "-pidfile"])
            .arg(&spec.pidfile)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| NidoError::Launch {
                vm: spec.name.clone(),
                message: format!("failed to spawn {}: {e}", self.system),
            })?;

        if !output.status.success() {
            return Err(NidoError::Launch {
                vm: spec.name.clone(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        process::read_pidfile(&spec.pidfile)
            .await
            .ok_or_else(|| NidoError::Launch {
                vm: spec.name.clone(),
                message: format!("{} did not write {}", self.system, spec.pidfile.display()),
            })
    }

    /// Hosts without `-daemonize`: spawn detached and write the pidfile
    /// ourselves. Early exits are caught by a short grace period.
    async fn launch_detached(&self, spec: &LaunchSpec, args: Vec<String>) -> Result<u32, NidoError> {
        let stderr_path = spec.serial_log.with_file_name(format!("{}-qemu.log", spec.name));
        let stderr = std::fs::File::create(&stderr_path).map_err(|e| NidoError::Io {
            context: format!("creating {}", stderr_path.display()),
            source: e,
        })?;

        let mut child = tokio::process::Command::new(&self.system)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(stderr))
            .spawn()
            .map_err(|e| NidoError::Launch {
                vm: spec.name.clone(),
                message: format!("failed to spawn {}: {e}", self.system),
            })?;

        tokio::time::sleep(Duration::from_millis(500)).await;
        if let Ok(Some(status)) = child.try_wait() {
            let diagnostics = tokio::fs::read_to_string(&stderr_path)
                .await
                .unwrap_or_default();
            return Err(NidoError::Launch {
                vm: spec.name.clone(),
                message: format!("exited with {status}: {}", diagnostics.trim()),
            });
        }

        let pid = child.id().ok_or_else(|| NidoError::Launch {
            vm: spec.name.clone(),
            message: "process exited during startup".into(),
        })?;
        tokio::fs::write(&spec.pidfile, pid.to_string())
            .await
            .map_err(|e| NidoError::Io {
                context: format!("writing {}", spec.pidfile.display()),
                source: e,
            })?;
        Ok(pid)
    }
}

impl Hypervisor for Qemu {
    fn platform(&self) -> &dyn HostPlatform {
        self.platform.as_ref()
    }

    async fn create_overlay(&self, base: &Path, dest: &Path) -> Result<(), NidoError> {
        let base = std::path::absolute(base).map_err(|e| NidoError::Io {
            context: format!("resolving {}", base.display()),
            source: e,
        })?;
        let format = disk_format(&base).await?;
        self.qemu_img(
            &[
                OsStr::new("create"),
                OsStr::new("-f"),
                OsStr::new("qcow2"),
                OsStr::new("-b"),
                base.as_os_str(),
                OsStr::new("-F"),
                OsStr::new(format),
                dest.as_os_str(),
            ],
            dest,
        )
        .await?;
        tracing::info!(path = %dest.display(), base = %base.display(), "created qcow2 overlay");
        Ok(())
    }

    async fn create_blank(&self, dest: &Path, size_bytes: u64) -> Result<(), NidoError> {
        let size = size_bytes.to_string();
        self.qemu_img(
            &[
                OsStr::new("create"),
                OsStr::new("-f"),
                OsStr::new("qcow2"),
                dest.as_os_str(),
                OsStr::new(&size),
            ],
            dest,
        )
        .await?;
        tracing::info!(path = %dest.display(), size_bytes, "created blank disk");
        Ok(())
    }

    async fn compact(&self, src: &Path, dest: &Path) -> Result<(), NidoError> {
        self.qemu_img(
            &[
                OsStr::new("convert"),
                OsStr::new("-O"),
                OsStr::new("qcow2"),
                OsStr::new("-c"),
                src.as_os_str(),
                dest.as_os_str(),
            ],
            dest,
        )
        .await?;
        tracing::info!(src = %src.display(), dest = %dest.display(), "compacted disk");
        Ok(())
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<u32, NidoError> {
        for dir in [spec.pidfile.parent(), spec.serial_log.parent()].into_iter().flatten() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| NidoError::Io {
                    context: format!("creating directory {}", dir.display()),
                    source: e,
                })?;
        }
        let _ = tokio::fs::remove_file(&spec.pidfile).await;
        if let crate::platform::ControlEndpoint::Unix(socket) = &spec.control {
            let _ = tokio::fs::remove_file(socket).await;
        }

        let args = build_args(spec, self.platform.as_ref(), self.machine);
        tracing::debug!(vm = %spec.name, program = %self.system, ?args, "launching hypervisor");

        let pid = if self.platform.can_daemonize() {
            self.launch_daemonized(spec, args).await?
        } else {
            self.launch_detached(spec, args).await?
        };
        tracing::info!(vm = %spec.name, pid, platform = self.platform.name(), "VM launched");
        Ok(pid)
    }

    fn required_binaries(&self) -> Vec<String> {
        vec![self.system.clone(), self.img.clone()]
    }
}

/// `qcow2` if the file carries the QCOW magic, `raw` otherwise.
pub async fn disk_format(path: &Path) -> Result<&'static str, NidoError> {
    use tokio::io::AsyncReadExt;

    let mut file = tokio::fs::File::open(path).await.map_err(|e| NidoError::Io {
        context: format!("opening {}", path.display()),
        source: e,
    })?;
    let mut magic = [0u8; 4];
    match file.read_exact(&mut magic).await {
        Ok(_) if magic == QCOW2_MAGIC => Ok("qcow2"),
        _ => Ok("raw"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::Software;

    #[tokio::test]
    async fn detects_qcow2_magic() {
        let dir = tempfile::tempdir().unwrap();
        let qcow = dir.path().join("a.qcow2");
        let raw = dir.path().join("b.img");
        let tiny = dir.path().join("c.img");
        std::fs::write(&qcow, [0x51, 0x46, 0x49, 0xFB, 0, 0, 0, 3]).unwrap();
        std::fs::write(&raw, [0u8; 512]).unwrap();
        std::fs::write(&tiny, [1u8]).unwrap();

        assert_eq!(disk_format(&qcow).await.unwrap(), "qcow2");
        assert_eq!(disk_format(&raw).await.unwrap(), "raw");
        assert_eq!(disk_format(&tiny).await.unwrap(), "raw");
        assert!(disk_format(&dir.path().join("missing")).await.is_err());
    }

    #[test]
    fn config_overrides_binaries() {
        let mut config = EngineConfig::with_root("/tmp/nido");
        config.qemu_system = Some("/opt/qemu-system-x86_64".into());
        config.qemu_img = "/opt/qemu-img".into();
        let qemu = Qemu::with_platform(&config, Box::new(Software));
        assert_eq!(
            qemu.required_binaries(),
            ["/opt/qemu-system-x86_64", "/opt/qemu-img"]
        );
    }

    #[tokio::test]
    async fn missing_qemu_img_is_disk_creation_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::with_root(dir.path());
        config.qemu_img = "/nonexistent/qemu-img".into();
        let qemu = Qemu::with_platform(&config, Box::new(Software));
        let err = qemu
            .create_blank(&dir.path().join("vms/x.qcow2"), 1 << 30)
            .await
            .unwrap_err();
        assert!(matches!(err, NidoError::DiskCreation { .. }));
    }

    #[tokio::test]
    async fn missing_qemu_system_is_launch_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::with_root(dir.path());
        config.qemu_system = Some("/nonexistent/qemu-system".into());
        let qemu = Qemu::with_platform(&config, Box::new(Software));
        let layout = &config.layout;
        let spec = LaunchSpec {
            name: "box".into(),
            disk: layout.disk_path("box"),
            seed: None,
            memory_mb: 512,
            cpus: 1,
            ssh_port: 50022,
            vnc_port: None,
            control: crate::platform::ControlEndpoint::Unix(layout.qmp_path("box")),
            pidfile: layout.pid_path("box"),
            serial_log: layout.serial_log_path("box"),
        };
        let err = qemu.launch(&spec).await.unwrap_err();
        assert!(matches!(err, NidoError::Launch { .. }));
    }
}
