#![allow(unused_assignments)] // thiserror/miette proc macros trigger false positives

pub mod catalog;
pub mod checksum;
pub mod config;
pub mod download;
pub mod error;
pub mod hypervisor;
pub mod keys;
pub mod logging;
pub mod paths;
pub mod platform;
pub mod ports;
pub mod process;
pub mod progress;
pub mod qmp;
pub mod state;
pub mod util;
pub mod vm;

pub use catalog::{Catalog, CatalogManager};
pub use config::{EngineConfig, load_config};
pub use error::NidoError;
pub use hypervisor::{Hypervisor, Qemu};
pub use vm::{SpawnOptions, SpawnSource, StartOptions, StartOutcome, VmManager};
