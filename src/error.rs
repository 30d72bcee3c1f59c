use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum NidoError {
    #[error("failed to load config from {path}")]
    ConfigLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config from {path}: {message}")]
    ConfigParse { path: String, message: String },

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("{what} not found: {name}")]
    NotFound { what: &'static str, name: String },

    #[error("failed to launch VM '{vm}': {message}")]
    #[diagnostic(help("check the hypervisor output above; a port may have been taken since allocation"))]
    Launch { vm: String, message: String },

    #[error("failed to create disk {path}: {message}")]
    DiskCreation { path: String, message: String },

    #[error("no free port in range {start}-{end}")]
    #[diagnostic(help("stop or delete unused VMs, or widen the port range in nido.toml"))]
    PortsExhausted { start: u16, end: u16 },

    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    #[diagnostic(help("the download is corrupt or the catalog is outdated; remove the file and retry"))]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("unsupported checksum algorithm '{algorithm}' (use sha256 or sha512)")]
    UnsupportedAlgorithm { algorithm: String },

    #[error("unsupported catalog schema version '{found}' (expected '{expected}')")]
    #[diagnostic(help("upgrade nido to read this catalog"))]
    SchemaVersion { found: String, expected: String },

    #[error("malformed catalog from {origin}: {message}")]
    CatalogParse { origin: String, message: String },

    #[error("image catalog unreachable and no cached copy: {message}")]
    #[diagnostic(help("check network connectivity or the catalog URL in nido.toml"))]
    CatalogUnreachable { message: String },

    #[error("download failed: {message}")]
    Download {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("downloaded {actual} bytes to {path} but expected {expected}")]
    #[diagnostic(help("the partial file was kept; retrying resumes the download"))]
    DownloadSize {
        path: String,
        expected: u64,
        actual: u64,
    },

    #[error("control socket: {message}")]
    ControlSocket { message: String },

    #[error("serialization failed: {message}")]
    Serialize { message: String },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl NidoError {
    pub(crate) fn not_found(what: &'static str, name: impl Into<String>) -> Self {
        NidoError::NotFound {
            what,
            name: name.into(),
        }
    }
}
