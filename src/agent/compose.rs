use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use tempfile::TempDir;

use crate::agent::command::shell_command;
use crate::agent::errors::{AgentError, Result};
use crate::agent::settings::StackRecipeSettings;

pub type ServiceName = String;
pub type VolumeName = String;

/// The deployment descriptor pushed to the orchestration API. Rebuilt from
/// the checked-out files on every cycle that deploys; never patched in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComposeSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub services: BTreeMap<ServiceName, Mapping>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub volumes: BTreeMap<VolumeName, Value>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl ComposeSpec {
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text)
            .map_err(|e| AgentError::Configuration(format!("invalid compose file: {e}")))
    }

    /// Every image reference declared by the services. A service without an
    /// image is a structural recipe defect and fails immediately.
    pub fn image_references(&self) -> Result<Vec<String>> {
        let mut images = Vec::new();
        for (name, spec) in &self.services {
            match spec.get("image").and_then(Value::as_str) {
                Some(image) => images.push(image.to_string()),
                None => {
                    return Err(AgentError::Configuration(format!(
                        "service `{name}` in the generated stack file has no image"
                    )))
                }
            }
        }
        Ok(images)
    }

    /// Drop excluded services and volumes, strip `build` sections (useless in
    /// a stack) and normalize the `extra_hosts: {"": ""}` artifact some
    /// generators emit into an empty list.
    pub fn filter_services(&mut self, excluded_services: &[String], excluded_volumes: &[String]) {
        debug!("filtering services and volumes");
        for service in excluded_services {
            self.services.remove(service);
        }
        for volume in excluded_volumes {
            self.volumes.remove(volume);
        }

        for spec in self.services.values_mut() {
            spec.remove("build");

            if let Some(Value::Mapping(hosts)) = spec.get("extra_hosts") {
                let only_empty_entry = hosts.len() == 1
                    && hosts.get("").and_then(Value::as_str) == Some("");
                if only_empty_entry {
                    spec.insert(
                        Value::String("extra_hosts".to_string()),
                        Value::Sequence(vec![]),
                    );
                }
            }
        }
    }

    /// Merge additional parameters into every service: mappings merge
    /// key-wise, sequences extend, strings overwrite. Empty values are
    /// ignored.
    pub fn add_parameters(&mut self, parameters: &BTreeMap<String, Value>) {
        debug!("adding parameters to stack: {parameters:?}");
        for (key, value) in parameters {
            match value {
                Value::Mapping(overrides) if !overrides.is_empty() => {
                    for spec in self.services.values_mut() {
                        if let Some(Value::Mapping(existing)) = spec.get_mut(key.as_str()) {
                            for (k, v) in overrides {
                                existing.insert(k.clone(), v.clone());
                            }
                        } else {
                            spec.insert(Value::String(key.clone()), value.clone());
                        }
                    }
                }
                Value::Sequence(items) if !items.is_empty() => {
                    for spec in self.services.values_mut() {
                        if let Some(Value::Sequence(existing)) = spec.get_mut(key.as_str()) {
                            existing.extend(items.iter().cloned());
                        } else {
                            spec.insert(Value::String(key.clone()), value.clone());
                        }
                    }
                }
                Value::String(s) if !s.is_empty() => {
                    for spec in self.services.values_mut() {
                        spec.insert(Value::String(key.clone()), value.clone());
                    }
                }
                _ => {}
            }
        }
    }

    /// Rename every service to `{prefix}_{name}` to avoid collisions on
    /// shared networks.
    pub fn add_prefix_to_services(&mut self, prefix: Option<&str>) {
        let Some(prefix) = prefix.filter(|p| !p.is_empty()) else {
            return;
        };
        debug!("adding service prefix {prefix} to all services");
        let services = std::mem::take(&mut self.services);
        self.services = services
            .into_iter()
            .map(|(name, spec)| (format!("{prefix}_{name}"), spec))
            .collect();
    }

    /// Export the resolved release tag and its creation date into every
    /// service environment, so deployed services can report what they run.
    pub fn inject_release_env(&mut self, tag: &str, created: DateTime<Utc>) {
        let entries = [
            ("VCS_RELEASE_TAG", tag.to_string()),
            ("VCS_RELEASE_DATE", created.to_rfc3339()),
        ];
        for spec in self.services.values_mut() {
            match spec.get_mut("environment") {
                Some(Value::Mapping(env)) => {
                    for (k, v) in &entries {
                        env.insert(
                            Value::String((*k).to_string()),
                            Value::String(v.clone()),
                        );
                    }
                }
                Some(Value::Sequence(env)) => {
                    for (k, v) in &entries {
                        env.push(Value::String(format!("{k}={v}")));
                    }
                }
                _ => {
                    let mut env = Mapping::new();
                    for (k, v) in &entries {
                        env.insert(
                            Value::String((*k).to_string()),
                            Value::String(v.clone()),
                        );
                    }
                    spec.insert(
                        Value::String("environment".to_string()),
                        Value::Mapping(env),
                    );
                }
            }
        }
    }
}

/// Collect the recipe's files from the watched repositories into the assembly
/// directory, run the recipe command and return the generated stack file.
///
/// The returned `TempDir` guard (when the recipe asked for a scratch workdir)
/// must stay alive until the file has been read.
pub async fn generate_stack_file(
    recipe: &StackRecipeSettings,
    repo_dirs: &BTreeMap<String, PathBuf>,
) -> Result<(PathBuf, Option<TempDir>)> {
    let (dest_dir, guard) = if recipe.workdir == "temp" {
        let tmp = TempDir::new()?;
        (tmp.path().to_path_buf(), Some(tmp))
    } else if let Some(dir) = repo_dirs.get(&recipe.workdir) {
        (dir.clone(), None)
    } else {
        (PathBuf::from(&recipe.workdir), None)
    };

    for group in &recipe.files {
        let src_dir = repo_dirs.get(&group.id).ok_or_else(|| {
            AgentError::Configuration(format!(
                "recipe is using an id `{}` that is not available in the watched git repositories",
                group.id
            ))
        })?;
        for path in &group.paths {
            let src = src_dir.join(path);
            if !src.exists() {
                return Err(AgentError::Configuration(format!(
                    "recipe from id `{}` uses non existing file {}",
                    group.id,
                    src.display()
                )));
            }
            let file_name = src.file_name().ok_or_else(|| {
                AgentError::Configuration(format!("recipe path {} has no file name", src.display()))
            })?;
            tokio::fs::copy(&src, dest_dir.join(file_name)).await?;
        }
    }

    if let Some(command) = recipe.command.as_deref().filter(|c| !c.is_empty()) {
        // Recipe commands may use pipes and cd, so this goes through the shell.
        shell_command(command, &dest_dir).await?;
    }

    let stack_file = dest_dir.join(&recipe.stack_file);
    let non_empty = tokio::fs::metadata(&stack_file)
        .await
        .map(|m| m.len() > 0)
        .unwrap_or(false);
    if !non_empty {
        return Err(AgentError::Configuration(format!(
            "generation of {} failed: the file is missing or empty",
            stack_file.display()
        )));
    }
    Ok((stack_file, guard))
}

/// Build the final descriptor: generate, filter, parameterize, decorate.
pub async fn create_stack_spec(
    recipe: &StackRecipeSettings,
    repo_dirs: &BTreeMap<String, PathBuf>,
    release: Option<(&str, DateTime<Utc>)>,
) -> Result<ComposeSpec> {
    let (stack_file, _guard) = generate_stack_file(recipe, repo_dirs).await?;
    debug!("generated stack file in {}", stack_file.display());

    let text = tokio::fs::read_to_string(&stack_file).await?;
    let mut spec = ComposeSpec::from_yaml(&text)?;

    spec.filter_services(&recipe.excluded_services, &recipe.excluded_volumes);
    spec.add_parameters(&recipe.additional_parameters);
    if let Some((tag, created)) = release {
        spec.inject_release_env(tag, created);
    }
    spec.add_prefix_to_services(recipe.services_prefix.as_deref());

    debug!(
        "final stack compose spec: {}",
        serde_json::to_string(&spec).unwrap_or_default()
    );
    Ok(spec)
}
