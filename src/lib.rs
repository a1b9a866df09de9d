pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod storage;

pub use config::{AppConfig, ParallelConfig, StorageConfig, StorageType};
pub use core::{run_mirror, Endpoint, MirrorJob, MirrorOptions, MirrorOutcome};
pub use error::{ClientError, MirrorError};

pub mod dirs {
    use std::path::PathBuf;

    pub fn config_dir() -> Option<PathBuf> {
        if cfg!(target_os = "windows") {
            std::env::var("APPDATA").ok().map(PathBuf::from)
        } else if cfg!(target_os = "macos") {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join("Library").join("Application Support"))
        } else {
            // Linux
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join(".config"))
        }
    }
}
