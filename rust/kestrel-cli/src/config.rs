//! Configuration file parsing for `kestrel.toml`.
//!
//! Searches the current directory then its ancestors. No file means the
//! defaults; a file that exists but cannot be read or parsed is an error.

use kestrel_core::ModuleError;
use kestrel_runtime::SchedulerConfig;
use kestrel_vm::{VmConfig, VmContext};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

pub const CONFIG_FILE: &str = "kestrel.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid toml in '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error(transparent)]
    Module(#[from] ModuleError),
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct KestrelConfig {
    pub vm: VmConfig,
    pub scheduler: SchedulerConfig,
    pub log: LogConfig,
    /// Modules registered before a stream is read, in order; atoms in a
    /// stream resolve against these by name.
    pub modules: Vec<ModuleDecl>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
    /// `tracing` filter directive used when `KESTREL_LOG` is unset.
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: "warn".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ModuleDecl {
    pub name: String,
    #[serde(default)]
    pub imports: Vec<String>,
}

impl KestrelConfig {
    /// Load from the nearest `kestrel.toml`, or the defaults if there is none.
    pub fn load() -> Result<Self, ConfigError> {
        Ok(Self::load_with_path()?.map(|(_, config)| config).unwrap_or_default())
    }

    /// Like [`load`](Self::load), also returning the file that was used.
    pub fn load_with_path() -> Result<Option<(PathBuf, Self)>, ConfigError> {
        let Ok(cwd) = std::env::current_dir() else {
            return Ok(None);
        };
        match Self::find(&cwd) {
            Some(path) => {
                let config = Self::load_from(&path)?;
                Ok(Some((path, config)))
            }
            None => Ok(None),
        }
    }

    /// The first `kestrel.toml` in `start` or one of its ancestors.
    pub fn find(start: &Path) -> Option<PathBuf> {
        start
            .ancestors()
            .map(|dir| dir.join(CONFIG_FILE))
            .find(|candidate| candidate.is_file())
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// A VM context with every declared module registered.
    pub fn build_context(&self) -> Result<Arc<VmContext>, ConfigError> {
        let context = VmContext::new(self.vm.clone());
        for module in &self.modules {
            let imports: Vec<&str> = module.imports.iter().map(String::as_str).collect();
            context.modules.add_module(&module.name, &imports)?;
        }
        Ok(context)
    }

    pub fn default_template() -> &'static str {
        r#"# Kestrel configuration

[vm]
# reoptimize_threshold = 10
# max_call_depth = 10000
# optimize = true

[scheduler]
# 0 means one worker per CPU
workers = 0

[log]
# Overridden by KESTREL_LOG
level = "warn"

# Modules that serialized atoms may refer to
# [[modules]]
# name = "base"
#
# [[modules]]
# name = "app"
# imports = ["base"]
"#
    }
}
