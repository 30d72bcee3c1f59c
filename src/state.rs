//! Per-VM state records and liveness-derived lifecycle state.
//!
//! One JSON file per VM under `run/`. Files are overwritten wholesale on every
//! mutation; there is no locking, so a data root is assumed to be driven by a
//! single engine process at a time.

use std::fmt;
use std::path::PathBuf;

use facet::Facet;

use crate::error::NidoError;

/// Lifecycle state of a VM. Never stored: recomputed by probing the host on
/// every query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Running,
    Stopped,
}

impl VmState {
    pub fn from_liveness(alive: bool) -> Self {
        if alive { VmState::Running } else { VmState::Stopped }
    }

    pub fn is_running(self) -> bool {
        matches!(self, VmState::Running)
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmState::Running => f.write_str("running"),
            VmState::Stopped => f.write_str("stopped"),
        }
    }
}

/// Durable projection of a VM's configuration.
#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct VmStateRecord {
    pub name: String,
    /// 0 when stopped.
    pub pid: u32,
    /// 0 until the first boot allocates one.
    pub ssh_port: u16,
    pub vnc_port: Option<u16>,
    pub gui: bool,
    #[facet(default)]
    pub ssh_user: String,
    #[facet(default)]
    pub memory_mb: u64,
    #[facet(default)]
    pub cpus: u32,
    /// Host TCP port of the control endpoint on hosts without Unix sockets.
    #[facet(default)]
    pub qmp_port: Option<u16>,
    /// Backing image the disk was created from, if any.
    #[facet(default)]
    pub base_image: Option<String>,
}

impl VmStateRecord {
    pub fn new(name: &str, ssh_user: &str) -> Self {
        Self {
            name: name.to_string(),
            pid: 0,
            ssh_port: 0,
            vnc_port: None,
            gui: false,
            ssh_user: ssh_user.to_string(),
            memory_mb: 0,
            cpus: 0,
            qmp_port: None,
            base_image: None,
        }
    }
}

pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    /// Overwrite the record for `record.name` in full.
    pub async fn save(&self, record: &VmStateRecord) -> Result<(), NidoError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| NidoError::Io {
                context: format!("creating directory {}", self.dir.display()),
                source: e,
            })?;

        let json = facet_json::to_string(record).map_err(|e| NidoError::Serialize {
            message: e.to_string(),
        })?;

        let path = self.path(&record.name);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json.as_bytes())
            .await
            .map_err(|e| NidoError::Io {
                context: format!("writing state record {}", tmp.display()),
                source: e,
            })?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| NidoError::Io {
                context: format!("renaming {} to {}", tmp.display(), path.display()),
                source: e,
            })?;

        tracing::debug!(vm = %record.name, pid = record.pid, "saved state record");
        Ok(())
    }

    /// Load a record. Absent and malformed files are both `NotFound`.
    pub async fn load(&self, name: &str) -> Result<VmStateRecord, NidoError> {
        let path = self.path(name);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|_| NidoError::not_found("state record", name))?;
        let record: VmStateRecord = facet_json::from_str(&contents).map_err(|e| {
            tracing::warn!(path = %path.display(), error = %e, "malformed state record");
            NidoError::not_found("state record", name)
        })?;
        Ok(record)
    }

    pub async fn remove(&self, name: &str) -> Result<(), NidoError> {
        let path = self.path(name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(NidoError::Io {
                context: format!("removing {}", path.display()),
                source: e,
            }),
        }
    }

    /// Names of all recorded VMs, sorted.
    pub async fn names(&self) -> Result<Vec<String>, NidoError> {
        let mut names = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => {
                return Err(NidoError::Io {
                    context: format!("reading {}", self.dir.display()),
                    source: e,
                });
            }
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let file_name = entry.file_name();
            if let Some(name) = file_name.to_str().and_then(|f| f.strip_suffix(".json")) {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Every readable record; unreadable ones are skipped.
    pub async fn load_all(&self) -> Result<Vec<VmStateRecord>, NidoError> {
        let mut records = Vec::new();
        for name in self.names().await? {
            if let Ok(record) = self.load(&name).await {
                records.push(record);
            }
        }
        Ok(records)
    }
}
