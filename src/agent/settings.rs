use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;
use url::Url;

use crate::agent::errors::{AgentError, Result};

/// Top-level agent configuration, loaded once at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub main: MainSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MainSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_polling_interval")]
    pub polling_interval_secs: u64,
    #[serde(default)]
    pub synced_via_tags: bool,
    pub watched_git_repositories: Vec<RepoSettings>,
    #[serde(default)]
    pub docker_private_registries: Vec<RegistrySettings>,
    pub docker_stack_recipe: StackRecipeSettings,
    pub portainer: Vec<PortainerSettings>,
    #[serde(default)]
    pub notifications: Vec<NotificationSettings>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RepoSettings {
    pub id: String,
    pub url: Url,
    pub branch: String,
    /// Tag-match regex, optionally with one capture group. Absent or empty
    /// means the repository tracks its branch head instead.
    #[serde(default)]
    pub tags: Option<String>,
    #[serde(default)]
    pub paths: Vec<PathBuf>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl RepoSettings {
    /// The tag expression, with "" normalized away.
    pub fn tag_pattern(&self) -> Option<&str> {
        self.tags.as_deref().filter(|t| !t.is_empty())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistrySettings {
    pub url: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileGroup {
    pub id: String,
    pub paths: Vec<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StackRecipeSettings {
    /// Files to collect from the watched repositories before assembly.
    #[serde(default)]
    pub files: Vec<FileGroup>,
    /// "temp" for a fresh scratch directory, or the id of a watched repo
    /// whose checkout becomes the assembly directory.
    #[serde(default = "default_workdir")]
    pub workdir: String,
    /// Optional trusted shell command run in the workdir before reading the
    /// stack file.
    #[serde(default)]
    pub command: Option<String>,
    pub stack_file: PathBuf,
    #[serde(default)]
    pub excluded_services: Vec<String>,
    #[serde(default)]
    pub excluded_volumes: Vec<String>,
    #[serde(default)]
    pub additional_parameters: BTreeMap<String, serde_yaml::Value>,
    #[serde(default)]
    pub services_prefix: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortainerSettings {
    pub url: Url,
    pub username: String,
    pub password: String,
    pub stack_name: String,
    /// Negative means "use the first endpoint the API reports".
    #[serde(default = "default_endpoint_id")]
    pub endpoint_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationSettings {
    #[serde(default = "default_notification_service")]
    pub service_type: String,
    pub url: Url,
    /// Fixed first line of every posted message.
    #[serde(default)]
    pub message: String,
    pub personal_token: String,
    pub channel_id: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8888
}

fn default_polling_interval() -> u64 {
    60
}

fn default_workdir() -> String {
    "temp".to_string()
}

fn default_endpoint_id() -> i64 {
    -1
}

fn default_enabled() -> bool {
    true
}

fn default_notification_service() -> String {
    "mattermost".to_string()
}

impl Settings {
    /// Load configuration from a YAML file layered with environment
    /// overrides (`STACKWATCH_MAIN__PORT=9000` style).
    pub fn load(path: &str) -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("STACKWATCH").separator("__"))
            .build()
            .map_err(|e| AgentError::Configuration(format!("cannot load {path}: {e}")))?;

        let settings: Settings = cfg
            .try_deserialize()
            .map_err(|e| AgentError::Configuration(format!("invalid configuration: {e}")))?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        let main = &self.main;

        if main.polling_interval_secs == 0 {
            return Err(AgentError::Configuration(
                "polling_interval_secs must be greater than 0".to_string(),
            ));
        }

        if main.watched_git_repositories.is_empty() {
            return Err(AgentError::Configuration(
                "at least one watched git repository is required".to_string(),
            ));
        }

        if main.portainer.is_empty() {
            return Err(AgentError::Configuration(
                "at least one portainer target is required".to_string(),
            ));
        }

        // Recipe file groups must reference configured repositories.
        for group in &main.docker_stack_recipe.files {
            if !main
                .watched_git_repositories
                .iter()
                .any(|r| r.id == group.id)
            {
                return Err(AgentError::Configuration(format!(
                    "recipe references repository id `{}` which is not watched",
                    group.id
                )));
            }
        }

        if main.synced_via_tags
            && !main
                .watched_git_repositories
                .iter()
                .any(|r| r.tag_pattern().is_some())
        {
            return Err(AgentError::Configuration(
                "synced_via_tags is enabled but no repository declares a tag expression"
                    .to_string(),
            ));
        }

        Ok(())
    }
}
