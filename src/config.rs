use std::path::{Path, PathBuf};
use std::time::Duration;

use facet::Facet;

use crate::error::NidoError;
use crate::keys::KeyInjection;
use crate::paths::Layout;

pub const DEFAULT_CATALOG_URL: &str =
    "https://raw.githubusercontent.com/nido-vm/catalog/main/catalog.json";

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct Config {
    /// Data root; empty means `~/.nido`.
    #[facet(default)]
    pub data_root: String,
    /// Template store; empty means `<data_root>/templates`.
    #[facet(default)]
    pub template_dir: String,
    #[facet(default)]
    pub catalog: CatalogConfig,
    #[facet(default)]
    pub hypervisor: HypervisorConfig,
    #[facet(default)]
    pub vm: VmConfig,
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct CatalogConfig {
    #[facet(default = "https://raw.githubusercontent.com/nido-vm/catalog/main/catalog.json")]
    pub url: String,
    #[facet(default = 24)]
    pub ttl_hours: u64,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_CATALOG_URL.into(),
            ttl_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct HypervisorConfig {
    /// Empty means `qemu-system-<host arch>`.
    #[facet(default)]
    pub qemu_system: String,
    #[facet(default = "qemu-img")]
    pub qemu_img: String,
    #[facet(default = 3000)]
    pub key_settle_ms: u64,
    #[facet(default = 3)]
    pub key_presses: u32,
    #[facet(default = 1000)]
    pub key_interval_ms: u64,
    #[facet(default = 15000)]
    pub key_deadline_ms: u64,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            qemu_system: String::new(),
            qemu_img: "qemu-img".into(),
            key_settle_ms: 3000,
            key_presses: 3,
            key_interval_ms: 1000,
            key_deadline_ms: 15000,
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct VmConfig {
    #[facet(default = 2048)]
    pub memory_mb: u64,
    #[facet(default = 2)]
    pub cpus: u32,
    #[facet(default = "vmuser")]
    pub ssh_user: String,
    #[facet(default = 50022)]
    pub ssh_port_start: u16,
    #[facet(default = 50122)]
    pub ssh_port_end: u16,
    #[facet(default = 5900)]
    pub vnc_port_start: u16,
    #[facet(default = 5999)]
    pub vnc_port_end: u16,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            memory_mb: 2048,
            cpus: 2,
            ssh_user: "vmuser".into(),
            ssh_port_start: 50022,
            ssh_port_end: 50122,
            vnc_port_start: 5900,
            vnc_port_end: 5999,
        }
    }
}

// ── EngineConfig ──────────────────────────────────────────

/// Resolved runtime configuration handed to every component constructor.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub layout: Layout,
    pub catalog_url: String,
    pub catalog_ttl: Duration,
    /// Overrides the platform's default `qemu-system-*` binary.
    pub qemu_system: Option<String>,
    pub qemu_img: String,
    pub memory_mb: u64,
    pub cpus: u32,
    pub ssh_user: String,
    pub ssh_ports: (u16, u16),
    pub vnc_ports: (u16, u16),
    pub key_injection: KeyInjection,
}

impl EngineConfig {
    /// Defaults rooted at an explicit directory.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let layout = Layout::rooted(root);
        resolve(Config::default(), layout)
    }

    pub fn from_config(config: Config) -> Result<Self, NidoError> {
        validate_config(&config)?;
        let root = if config.data_root.is_empty() {
            default_data_root()?
        } else {
            PathBuf::from(&config.data_root)
        };
        let layout = if config.template_dir.is_empty() {
            Layout::rooted(root)
        } else {
            Layout::new(root, PathBuf::from(&config.template_dir))
        };
        Ok(resolve(config, layout))
    }
}

fn resolve(config: Config, layout: Layout) -> EngineConfig {
    let hv = config.hypervisor;
    EngineConfig {
        layout,
        catalog_url: config.catalog.url,
        catalog_ttl: Duration::from_secs(config.catalog.ttl_hours * 3600),
        qemu_system: (!hv.qemu_system.is_empty()).then_some(hv.qemu_system),
        qemu_img: hv.qemu_img,
        memory_mb: config.vm.memory_mb,
        cpus: config.vm.cpus,
        ssh_user: config.vm.ssh_user,
        ssh_ports: (config.vm.ssh_port_start, config.vm.ssh_port_end),
        vnc_ports: (config.vm.vnc_port_start, config.vm.vnc_port_end),
        key_injection: KeyInjection {
            settle: Duration::from_millis(hv.key_settle_ms),
            presses: hv.key_presses,
            interval: Duration::from_millis(hv.key_interval_ms),
            deadline: Duration::from_millis(hv.key_deadline_ms),
            ..KeyInjection::default()
        },
    }
}

/// `~/.nido`. The only place the engine consults the home directory.
fn default_data_root() -> Result<PathBuf, NidoError> {
    dirs::home_dir()
        .map(|home| home.join(".nido"))
        .ok_or_else(|| NidoError::Validation {
            message: "cannot determine home directory; set data_root in nido.toml".into(),
        })
}

// ── validation ────────────────────────────────────────────

fn validate_config(config: &Config) -> Result<(), NidoError> {
    if config.vm.cpus < 1 {
        return Err(NidoError::Validation {
            message: "vm.cpus must be at least 1".into(),
        });
    }
    if config.vm.memory_mb < 128 {
        return Err(NidoError::Validation {
            message: "vm.memory_mb must be at least 128".into(),
        });
    }
    if config.vm.ssh_port_start > config.vm.ssh_port_end {
        return Err(NidoError::Validation {
            message: "vm.ssh_port_start must not exceed vm.ssh_port_end".into(),
        });
    }
    if config.vm.vnc_port_start < 5900 || config.vm.vnc_port_start > config.vm.vnc_port_end {
        return Err(NidoError::Validation {
            message: "vnc port range must start at 5900 or above and be non-empty".into(),
        });
    }
    if config.catalog.url.is_empty() {
        return Err(NidoError::Validation {
            message: "catalog.url must not be empty".into(),
        });
    }
    Ok(())
}

/// VM names must match `^[A-Za-z0-9_-]{1,64}$`.
pub fn validate_vm_name(name: &str) -> Result<(), NidoError> {
    let valid = (1..=64).contains(&name.len())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !valid {
        return Err(NidoError::Validation {
            message: format!("VM name must match [A-Za-z0-9_-]{{1,64}} (got '{name}')"),
        });
    }
    Ok(())
}

// ── public API ────────────────────────────────────────────

pub fn load_config(path: &Path) -> Result<EngineConfig, NidoError> {
    let contents = std::fs::read_to_string(path).map_err(|source| NidoError::ConfigLoad {
        path: path.display().to_string(),
        source,
    })?;

    let config: Config = facet_toml::from_str(&contents).map_err(|e| NidoError::ConfigParse {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    EngineConfig::from_config(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_resolve_under_root() {
        let cfg = EngineConfig::with_root("/tmp/nido-test");
        assert_eq!(cfg.layout.root(), Path::new("/tmp/nido-test"));
        assert_eq!(cfg.catalog_ttl, Duration::from_secs(24 * 3600));
        assert_eq!(cfg.ssh_ports, (50022, 50122));
        assert_eq!(cfg.qemu_img, "qemu-img");
        assert!(cfg.qemu_system.is_none());
        assert_eq!(cfg.key_injection.presses, 3);
    }

    #[test]
    fn parse_full_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nido.toml");
        std::fs::write(
            &path,
            format!(
                r#"
data_root = "{root}"
template_dir = "/srv/templates"

[catalog]
url = "https://example.com/catalog.json"
ttl_hours = 2

[hypervisor]
qemu_system = "/opt/qemu/bin/qemu-system-x86_64"
key_presses = 5

[vm]
memory_mb = 4096
ssh_user = "alice"
"#,
                root = dir.path().display()
            ),
        )
        .unwrap();

        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.layout.root(), dir.path());
        assert_eq!(cfg.layout.templates_dir(), Path::new("/srv/templates"));
        assert_eq!(cfg.catalog_url, "https://example.com/catalog.json");
        assert_eq!(cfg.catalog_ttl, Duration::from_secs(7200));
        assert_eq!(cfg.qemu_system.as_deref(), Some("/opt/qemu/bin/qemu-system-x86_64"));
        assert_eq!(cfg.key_injection.presses, 5);
        assert_eq!(cfg.memory_mb, 4096);
        assert_eq!(cfg.cpus, 2);
        assert_eq!(cfg.ssh_user, "alice");
    }

    #[test]
    fn missing_config_is_load_error() {
        let err = load_config(Path::new("/nonexistent/nido.toml")).unwrap_err();
        assert!(matches!(err, NidoError::ConfigLoad { .. }));
    }

    #[test]
    fn inverted_port_range_rejected() {
        let mut config = Config::default();
        config.data_root = "/tmp/x".into();
        config.vm.ssh_port_start = 6000;
        config.vm.ssh_port_end = 5000;
        assert!(EngineConfig::from_config(config).is_err());
    }

    #[test]
    fn valid_vm_names() {
        for name in ["box", "web-01", "a_b", "X", &"a".repeat(64)] {
            assert!(validate_vm_name(name).is_ok(), "{name} should be valid");
        }
    }

    #[test]
    fn invalid_vm_names() {
        for name in ["", "has space", "dot.name", "../etc", &"a".repeat(65)] {
            assert!(validate_vm_name(name).is_err(), "{name} should be invalid");
        }
    }
}
