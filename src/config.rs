use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::cron::CronExpr;
use crate::errors::PupError;

pub const DEFAULT_CONFIG_NAME: &str = "pup.json";
pub const DEFAULT_RESTART_DELAY_MS: u64 = 10_000;
pub const DEFAULT_TERMINATE_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[derive(Default)]
pub enum RestartPolicy {
    #[default]
    Never,
    Always,
    OnError,
}

impl std::fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = match self {
            RestartPolicy::Never => "never",
            RestartPolicy::Always => "always",
            RestartPolicy::OnError => "on-error",
        };
        write!(f, "{value}")
    }
}

impl RestartPolicy {
    /// Whether a child exit should schedule another spawn. A signal-terminated
    /// child counts as an error exit.
    pub fn should_restart(&self, exited_successfully: bool) -> bool {
        match self {
            RestartPolicy::Always => true,
            RestartPolicy::OnError => !exited_successfully,
            RestartPolicy::Never => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct LoggerOptions {
    #[serde(default)]
    pub stdout: Option<PathBuf>,
    #[serde(default)]
    pub decorate: Option<bool>,
    #[serde(default)]
    pub colors: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ProcessSpec {
    pub id: String,
    pub cmd: Vec<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub autostart: bool,
    #[serde(default)]
    pub cron: Option<String>,
    #[serde(default)]
    pub watch: Vec<PathBuf>,
    #[serde(default)]
    pub restart: RestartPolicy,
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
    #[serde(default)]
    pub restart_limit: Option<u32>,
    #[serde(default = "default_terminate_timeout_ms")]
    pub terminate_timeout_ms: u64,
    #[serde(default = "default_instances")]
    pub instances: u32,
    #[serde(default)]
    pub path: Option<String>,
}

fn default_restart_delay_ms() -> u64 {
    DEFAULT_RESTART_DELAY_MS
}

fn default_terminate_timeout_ms() -> u64 {
    DEFAULT_TERMINATE_TIMEOUT_MS
}

fn default_instances() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default)]
    logger: LoggerOptions,
    processes: Vec<ProcessSpec>,
}

/// The validated, immutable configuration the core runs from.
///
/// `root_dir` is the directory the config file lives in; every relative path
/// in the file (cwd, watch entries) has already been resolved against it, and
/// the IPC endpoint lives underneath it.
#[derive(Debug, Clone)]
pub struct Plan {
    pub root_dir: PathBuf,
    pub logger: LoggerOptions,
    pub ipc_path: PathBuf,
    pub processes: Vec<ProcessSpec>,
}

impl Plan {
    pub fn load(config_path: &Path) -> Result<Self> {
        let payload = fs::read_to_string(config_path).map_err(|err| {
            PupError::Config(format!("failed to read {}: {err}", config_path.display()))
        })?;
        let file: ConfigFile = serde_json::from_str(&payload).map_err(|err| {
            PupError::Config(format!("failed to parse {}: {err}", config_path.display()))
        })?;

        let root_dir = config_path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let root_dir = root_dir
            .canonicalize()
            .with_context(|| format!("failed to resolve {}", root_dir.display()))?;

        let mut processes = file.processes;
        let mut seen_ids = HashSet::new();
        for spec in &mut processes {
            validate_process_id(&spec.id)?;
            if !seen_ids.insert(spec.id.clone()) {
                return Err(PupError::Config(format!("duplicate process id: {}", spec.id)).into());
            }
            if spec.cmd.is_empty() || spec.cmd[0].trim().is_empty() {
                return Err(
                    PupError::Config(format!("process {}: cmd cannot be empty", spec.id)).into(),
                );
            }
            if spec.instances == 0 {
                return Err(PupError::Config(format!(
                    "process {}: instances must be at least 1",
                    spec.id
                ))
                .into());
            }
            if let Some(expr) = &spec.cron {
                CronExpr::parse(expr).map_err(|err| {
                    PupError::Config(format!("process {}: invalid cron {expr:?}: {err}", spec.id))
                })?;
            }
            spec.cwd = Some(match spec.cwd.take() {
                Some(cwd) => resolve_path(&root_dir, &cwd),
                None => root_dir.clone(),
            });
            spec.watch = spec
                .watch
                .iter()
                .map(|path| resolve_path(&root_dir, path))
                .collect();
        }

        let ipc_path = root_dir.join(".pup").join("pup.sock");

        Ok(Plan {
            root_dir,
            logger: file.logger,
            ipc_path,
            processes,
        })
    }

    /// The broadest stop deadline any process in the plan may need.
    pub fn max_terminate_timeout_ms(&self) -> u64 {
        self.processes
            .iter()
            .map(|spec| spec.terminate_timeout_ms)
            .max()
            .unwrap_or(DEFAULT_TERMINATE_TIMEOUT_MS)
    }
}

fn resolve_path(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

fn validate_process_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(PupError::Config("process id cannot be empty".to_string()).into());
    }

    let valid = id
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-');

    if !valid {
        return Err(PupError::Config(format!("invalid process id: {id}")).into());
    }
    Ok(())
}
