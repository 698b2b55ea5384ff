//! `.ctrlflow.toml` loading.
//!
//! ```toml
//! [options]
//! fold_constant_conditions = true
//! model_exceptions_after_assignment = false
//! assignment_targets_are_nodes = false
//!
//! [policy]
//! variables = "locals"   # or "locals-and-fields", "parameters"
//! ```
//!
//! Every key is optional. The file is searched for in the working directory
//! and its ancestors; a missing file means defaults, a malformed one is an
//! error when named explicitly and a warning when discovered.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::analysis::control_flow::{
    FlowOptions, FlowPolicy, LocalVariablesPolicy, LocalsAndFieldsPolicy, ParametersOnlyPolicy,
};
use crate::errors::{FlowError, Result};

pub const CONFIG_FILE_NAME: &str = ".ctrlflow.toml";
const MAX_TRAVERSAL_DEPTH: usize = 10;

/// Which variables a flow records reads and writes for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyChoice {
    #[default]
    Locals,
    LocalsAndFields,
    Parameters,
}

impl PolicyChoice {
    pub fn policy(self) -> &'static dyn FlowPolicy {
        match self {
            Self::Locals => &LocalVariablesPolicy,
            Self::LocalsAndFields => &LocalsAndFieldsPolicy,
            Self::Parameters => &ParametersOnlyPolicy,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub variables: PolicyChoice,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CtrlflowConfig {
    pub options: FlowOptions,
    pub policy: PolicyConfig,
}

/// Parse config file contents.
pub fn parse_config(contents: &str) -> Result<CtrlflowConfig> {
    toml::from_str(contents)
        .map_err(|e| FlowError::config(format!("Failed to parse {CONFIG_FILE_NAME}: {e}")))
}

/// Load an explicitly named config file.
pub fn load_config_from(path: &Path) -> Result<CtrlflowConfig> {
    let contents = fs::read_to_string(path)?;
    let config = parse_config(&contents)?;
    debug!("Loaded config from {}", path.display());
    Ok(config)
}

fn directory_ancestors(start: PathBuf, max_depth: usize) -> impl Iterator<Item = PathBuf> {
    std::iter::successors(Some(start), |dir| {
        let mut parent = dir.clone();
        parent.pop().then_some(parent)
    })
    .take(max_depth)
}

fn try_load(path: &Path) -> Option<CtrlflowConfig> {
    match load_config_from(path) {
        Ok(config) => Some(config),
        Err(FlowError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            warn!("Ignoring {}: {e}", path.display());
            None
        }
    }
}

/// Find the nearest config file at or above `start`, or fall back to defaults.
pub fn discover_config(start: &Path) -> CtrlflowConfig {
    directory_ancestors(start.to_path_buf(), MAX_TRAVERSAL_DEPTH)
        .map(|dir| dir.join(CONFIG_FILE_NAME))
        .find_map(|path| try_load(&path))
        .unwrap_or_else(|| {
            debug!(
                "No config found after checking {} directories. Using default config.",
                MAX_TRAVERSAL_DEPTH
            );
            CtrlflowConfig::default()
        })
}

/// The explicit file when given, otherwise whatever [`discover_config`] finds
/// from the working directory.
pub fn load_config(explicit: Option<&Path>) -> Result<CtrlflowConfig> {
    match explicit {
        Some(path) => load_config_from(path),
        None => {
            let current = std::env::current_dir()?;
            Ok(discover_config(&current))
        }
    }
}
