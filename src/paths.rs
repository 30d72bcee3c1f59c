use std::path::{Path, PathBuf};

/// On-disk layout of the engine's data root.
///
/// ```text
/// <root>/vms/<name>.qcow2        VM disk
/// <root>/vms/<name>-seed.iso     optional seed media
/// <root>/run/<name>.pid          hypervisor pidfile
/// <root>/run/<name>.qmp          control socket
/// <root>/run/<name>.json         state record
/// <root>/images/                 catalog cache + downloaded images
/// <root>/logs/                   engine and serial logs
/// <templates>/<t>.compact.qcow2  compacted templates
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    root: PathBuf,
    templates: PathBuf,
}

pub const TEMPLATE_SUFFIX: &str = ".compact.qcow2";

impl Layout {
    pub fn new(root: impl Into<PathBuf>, templates: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            templates: templates.into(),
        }
    }

    /// Layout with the template store nested under the root.
    pub fn rooted(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let templates = root.join("templates");
        Self { root, templates }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn vms_dir(&self) -> PathBuf {
        self.root.join("vms")
    }

    pub fn run_dir(&self) -> PathBuf {
        self.root.join("run")
    }

    pub fn images_dir(&self) -> PathBuf {
        self.root.join("images")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn templates_dir(&self) -> &Path {
        &self.templates
    }

    pub fn disk_path(&self, name: &str) -> PathBuf {
        self.vms_dir().join(format!("{name}.qcow2"))
    }

    pub fn seed_path(&self, name: &str) -> PathBuf {
        self.vms_dir().join(format!("{name}-seed.iso"))
    }

    pub fn pid_path(&self, name: &str) -> PathBuf {
        self.run_dir().join(format!("{name}.pid"))
    }

    pub fn qmp_path(&self, name: &str) -> PathBuf {
        self.run_dir().join(format!("{name}.qmp"))
    }

    pub fn state_path(&self, name: &str) -> PathBuf {
        self.run_dir().join(format!("{name}.json"))
    }

    pub fn serial_log_path(&self, name: &str) -> PathBuf {
        self.logs_dir().join(format!("{name}-serial.log"))
    }

    pub fn catalog_cache_path(&self) -> PathBuf {
        self.images_dir().join("catalog.json")
    }

    pub fn template_path(&self, template: &str) -> PathBuf {
        self.templates.join(format!("{template}{TEMPLATE_SUFFIX}"))
    }
}
