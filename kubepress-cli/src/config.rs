//! CLI configuration management

use anyhow::{bail, Context, Result};
use kubepress_common::StackSettings;
use kubepress_deploy::Credential;
use serde::{Deserialize, Serialize};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub default_output: String,
    /// Stack settings used when `--stack` is not given
    pub stack_file: Option<PathBuf>,
    pub subscription_id: Option<String>,
    pub tenant_id: Option<String>,
    pub client_id: Option<String>,
    pub log_level: String,
    /// JSON log files are written here when set
    pub log_dir: Option<PathBuf>,
    /// Where recorded outputs are kept; `~/.config/kubepress/outputs` when unset
    pub outputs_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_output: "table".to_string(),
            stack_file: None,
            subscription_id: None,
            tenant_id: None,
            client_id: None,
            log_level: "warn".to_string(),
            log_dir: None,
            outputs_dir: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        let config = if config_path.exists() {
            Self::load_from(&config_path)?
        } else {
            Self::default()
        };

        Ok(config.with_env(|key| std::env::var(key).ok()))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Config =
            toml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    pub fn save(&self) -> Result<PathBuf> {
        let config_path = Self::config_path()?;
        self.save_to(&config_path)?;
        Ok(config_path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;

        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("cli.toml"))
    }

    fn config_dir() -> Result<PathBuf> {
        let home = std::env::var("HOME").context("HOME is not set")?;
        Ok(PathBuf::from(home).join(".config/kubepress"))
    }

    /// Apply `AZURE_*` environment overrides
    pub fn with_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(id) = lookup("AZURE_SUBSCRIPTION_ID") {
            self.subscription_id = Some(id);
        }
        if let Some(id) = lookup("AZURE_TENANT_ID") {
            self.tenant_id = Some(id);
        }
        if let Some(id) = lookup("AZURE_CLIENT_ID") {
            self.client_id = Some(id);
        }
        self
    }

    pub fn subscription(&self) -> Result<&str> {
        match self.subscription_id.as_deref() {
            Some(id) if !id.trim().is_empty() => Ok(id),
            _ => bail!("no subscription id; set AZURE_SUBSCRIPTION_ID or subscription_id in the config file"),
        }
    }

    pub fn outputs_dir(&self) -> Result<PathBuf> {
        match &self.outputs_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(Self::config_dir()?.join("outputs")),
        }
    }

    /// Credential from the environment and config
    ///
    /// Pre-issued tokens win over a client secret. A missing secret is
    /// prompted for on an interactive terminal.
    pub fn credential(&self) -> Result<Credential> {
        self.credential_with(|key| std::env::var(key).ok())
    }

    pub fn credential_with(&self, lookup: impl Fn(&str) -> Option<String>) -> Result<Credential> {
        if let Some(arm) = lookup("AZURE_ARM_TOKEN") {
            return Ok(Credential::StaticToken {
                arm,
                graph: lookup("AZURE_GRAPH_TOKEN"),
            });
        }

        let (Some(tenant), Some(client)) = (self.tenant_id.as_deref(), self.client_id.as_deref())
        else {
            bail!("no Azure credentials; set AZURE_ARM_TOKEN, or AZURE_TENANT_ID and AZURE_CLIENT_ID");
        };

        let secret = match lookup("AZURE_CLIENT_SECRET") {
            Some(secret) => secret,
            None if std::io::stdin().is_terminal() => {
                rpassword::prompt_password(format!("Client secret for {}: ", client))?
            }
            None => bail!("AZURE_CLIENT_SECRET is not set"),
        };

        Ok(Credential::client_secret(tenant, client, &secret))
    }
}

/// Stack settings from a TOML file; the built-in defaults when no file is given
pub fn load_settings(path: Option<&Path>) -> Result<StackSettings> {
    let Some(path) = path else {
        return Ok(StackSettings::default());
    };
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading stack settings {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("parsing stack settings {}", path.display()))
}
