//! Runspace lookup.
//!
//! A runspace is a project's working directory plus the environment a shell
//! for that project should see. Runspaces are owned elsewhere; this crate only
//! resolves them by id through [`RunspaceProvider`].

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::str::FromStr;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Working directory and environment for one project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Runspace {
    pub id: String,
    pub dir: PathBuf,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Runspace {
    pub fn new(id: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            dir: dir.into(),
            env: BTreeMap::new(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Parses the `ID=DIR` form used on the command line.
impl FromStr for Runspace {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id, dir) = s
            .split_once('=')
            .ok_or_else(|| format!("expected ID=DIR, got '{s}'"))?;
        if id.is_empty() {
            return Err("runspace id must not be empty".into());
        }
        if dir.is_empty() {
            return Err(format!("runspace '{id}' has an empty directory"));
        }
        Ok(Runspace::new(id, dir))
    }
}

/// Resolves a runspace id into its directory and environment.
///
/// Returning `None` means the id is unknown; callers reject the request
/// before any session is created.
pub trait RunspaceProvider: Send + Sync {
    fn resolve(&self, runspace_id: &str) -> Option<Runspace>;
}

/// In-memory provider backed by the config file and `--runspace` flags.
#[derive(Default)]
pub struct StaticRunspaces {
    entries: RwLock<HashMap<String, Runspace>>,
}

impl StaticRunspaces {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a runspace. Returns the previous entry for that id.
    pub fn insert(&self, runspace: Runspace) -> Option<Runspace> {
        self.entries.write().insert(runspace.id.clone(), runspace)
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl FromIterator<Runspace> for StaticRunspaces {
    fn from_iter<I: IntoIterator<Item = Runspace>>(iter: I) -> Self {
        let provider = StaticRunspaces::new();
        for runspace in iter {
            provider.insert(runspace);
        }
        provider
    }
}

impl RunspaceProvider for StaticRunspaces {
    fn resolve(&self, runspace_id: &str) -> Option<Runspace> {
        self.entries.read().get(runspace_id).cloned()
    }
}
