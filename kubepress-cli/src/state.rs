//! Recorded outputs, one JSON file per stack

use anyhow::{Context, Result};
use kubepress_common::Outputs;
use std::path::{Path, PathBuf};

pub struct OutputStore {
    dir: PathBuf,
}

impl OutputStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self, stack: &str) -> PathBuf {
        self.dir.join(format!("{}.json", stack))
    }

    /// Outputs recorded for a stack; empty when it was never applied
    pub fn load(&self, stack: &str) -> Result<Outputs> {
        let path = self.path(stack);
        if !path.exists() {
            return Ok(Outputs::new());
        }
        let contents =
            std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&contents).with_context(|| format!("parsing {}", path.display()))
    }

    /// Persist outputs; an empty set removes the file
    pub fn save(&self, stack: &str, outputs: &Outputs) -> Result<()> {
        let path = self.path(stack);
        if outputs.is_empty() {
            return remove_if_exists(&path);
        }

        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating {}", self.dir.display()))?;
        let contents = serde_json::to_string_pretty(outputs)?;
        std::fs::write(&path, contents).with_context(|| format!("writing {}", path.display()))?;
        tracing::debug!(path = %path.display(), resources = outputs.len(), "Saved outputs");
        Ok(())
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("removing {}", path.display())),
    }
}
