use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};

use crate::agent::compose::{create_stack_spec, ComposeSpec};
use crate::agent::errors::{AgentError, Result};
use crate::agent::git_watcher::GitUrlWatcher;
use crate::agent::notifier::Notifier;
use crate::agent::portainer::PortainerClient;
use crate::agent::registry_watcher::RegistryWatcher;
use crate::agent::retry::{with_retry, RetryPolicy};
use crate::agent::settings::{MainSettings, PortainerSettings};
use crate::agent::state::{SharedState, State};
use crate::agent::subtask::{ChangeMap, SubTask};

/// Cooldown after an uncaught cycle error before the loop resumes.
const PAUSED_COOLDOWN: Duration = Duration::from_secs(300);

/// Sweep every change source in order, merging what they report.
async fn check_changes(tasks: &mut [&mut dyn SubTask]) -> Result<ChangeMap> {
    let mut changes = ChangeMap::new();
    for task in tasks.iter_mut() {
        debug!("checking {} for changes...", task.name());
        changes.extend(task.check_for_changes().await?);
    }
    Ok(changes)
}

/// The timer-driven reconciliation loop: watch, reassemble, push, notify.
pub struct AutoDeployTask {
    settings: MainSettings,
    state: SharedState,
    notifier: Notifier,
    portainers: Vec<(PortainerSettings, PortainerClient)>,
}

impl AutoDeployTask {
    pub fn new(settings: MainSettings, state: SharedState) -> Result<Self> {
        let notifier = Notifier::new(&settings.notifications);
        let portainers = settings
            .portainer
            .iter()
            .map(|cfg| Ok((cfg.clone(), PortainerClient::new(cfg.url.clone())?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            settings,
            state,
            notifier,
            portainers,
        })
    }

    /// The repository whose status represents the deployment as a whole in
    /// notifications.
    fn main_repo_id(&self) -> &str {
        &self.settings.docker_stack_recipe.workdir
    }

    fn release_of(&self, git_task: &GitUrlWatcher) -> Option<(String, DateTime<Utc>)> {
        git_task.release_for(self.main_repo_id()).or_else(|| {
            git_task
                .repos()
                .iter()
                .find_map(|r| git_task.release_for(&r.repo_id))
        })
    }

    /// Wait for every Portainer instance to answer an authentication request.
    /// Swarm may bring the agent up before its dependencies.
    async fn wait_for_dependencies(&self) -> Result<()> {
        info!("waiting for dependencies to start...");
        let policy = RetryPolicy::boot();
        for (cfg, client) in &self.portainers {
            with_retry(&policy, "portainer dependency check", || async {
                match client.authenticate(&cfg.username, &cfg.password).await {
                    Ok(_) => {
                        info!("portainer at {} ready", cfg.url);
                        Ok(())
                    }
                    Err(AgentError::Request(e)) => {
                        warn!("portainer not ready at {}: {e}", cfg.url);
                        Err(AgentError::DependencyNotReady(format!(
                            "portainer not ready at {}",
                            cfg.url
                        )))
                    }
                    Err(e) => Err(e),
                }
            })
            .await?;
        }
        Ok(())
    }

    async fn create_stack(&self, git_task: &GitUrlWatcher) -> Result<ComposeSpec> {
        let release = self.release_of(git_task);
        create_stack_spec(
            &self.settings.docker_stack_recipe,
            &git_task.repo_directories(),
            release.as_ref().map(|(tag, created)| (tag.as_str(), *created)),
        )
        .await
    }

    /// Push the descriptor to every Portainer instance, creating the stack
    /// where it does not exist and updating it where it does.
    async fn deploy_stacks(&self, stack: &ComposeSpec) -> Result<()> {
        for (cfg, client) in &self.portainers {
            let token = client.authenticate(&cfg.username, &cfg.password).await?;
            match client
                .get_current_stack_id(&token, &cfg.stack_name)
                .await?
            {
                Some(stack_id) => {
                    info!("updating stack {} on {}", cfg.stack_name, cfg.url);
                    client
                        .update_stack(&token, stack_id, cfg.endpoint_id, stack)
                        .await?;
                }
                None => {
                    info!("creating stack {} on {}", cfg.stack_name, cfg.url);
                    let swarm_id = client.get_swarm_id(&token, cfg.endpoint_id).await?;
                    client
                        .post_new_stack(
                            &token,
                            &swarm_id,
                            cfg.endpoint_id,
                            &cfg.stack_name,
                            stack,
                        )
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn stacks_exist(&self) -> Result<bool> {
        for (cfg, client) in &self.portainers {
            let token = client.authenticate(&cfg.username, &cfg.password).await?;
            if client
                .get_current_stack_id(&token, &cfg.stack_name)
                .await?
                .is_none()
            {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn create_registry_watcher(&self, stack: &ComposeSpec) -> Result<RegistryWatcher> {
        let mut watcher =
            RegistryWatcher::new(&self.settings.docker_private_registries, stack)?;
        watcher.init().await?;
        Ok(watcher)
    }

    async fn notify_best_effort(&self, message: &str) {
        if let Err(e) = self.notifier.notify(message).await {
            warn!("could not send notification: {e}");
        }
    }

    async fn notify_state_best_effort(&self, message: &str) {
        if let Err(e) = self.notifier.notify_state(self.state.get(), message).await {
            warn!("could not send state notification: {e}");
        }
    }

    pub async fn init_deploy(&self) -> Result<(GitUrlWatcher, RegistryWatcher)> {
        info!("initializing...");
        self.state.set(State::Starting);

        self.wait_for_dependencies().await?;

        let mut git_task = GitUrlWatcher::new(
            &self.settings.watched_git_repositories,
            self.settings.synced_via_tags,
        )?;
        let descriptions = git_task.init().await?;

        let stack = self.create_stack(&git_task).await?;
        let registry_task = self.create_registry_watcher(&stack).await?;

        self.deploy_stacks(&stack).await?;

        self.notify_best_effort(&format!(
            "Stack initialised with:\n{:?}",
            descriptions.values().collect::<Vec<_>>()
        ))
        .await;
        self.notify_state_best_effort(
            descriptions
                .get(self.main_repo_id())
                .map(String::as_str)
                .unwrap_or(""),
        )
        .await;

        info!("initialisation completed");
        Ok((git_task, registry_task))
    }

    /// One reconciliation cycle. The registry watcher is replaced in place
    /// whenever the descriptor was reassembled, so its recorded digests keep
    /// describing what actually runs.
    pub async fn run_cycle(
        &self,
        git_task: &mut GitUrlWatcher,
        registry_task: &mut RegistryWatcher,
    ) -> Result<()> {
        info!("checking if stacks exist...");
        if !self.stacks_exist().await? {
            warn!("stacks do not exist, re-initialising...");
            let stack = self.create_stack(git_task).await?;
            self.deploy_stacks(&stack).await?;
            self.notify_best_effort("Stack was not found and re-initialised.")
                .await;
            self.notify_state_best_effort("Stack was not found and re-initialised.")
                .await;
        }

        info!("checking for changes...");
        let changes = check_changes(&mut [
            &mut *git_task as &mut dyn SubTask,
            &mut *registry_task as &mut dyn SubTask,
        ])
        .await?;
        if changes.is_empty() {
            info!("--> no changes detected");
            return Ok(());
        }
        info!("--> changes detected");

        let stack = self.create_stack(git_task).await?;
        *registry_task = self.create_registry_watcher(&stack).await?;

        info!("redeploying the stack...");
        self.deploy_stacks(&stack).await?;

        info!("sending notifications...");
        let changes_as_text: Vec<String> = changes
            .iter()
            .map(|(key, value)| format!("{key}:{value}"))
            .collect();
        self.notify_best_effort(&format!("Updated stack\n{changes_as_text:?}"))
            .await;
        if let Some(main_change) = changes.get(self.main_repo_id()) {
            self.notify_state_best_effort(main_change).await;
        }

        info!("stack re-deployed");
        Ok(())
    }

    /// Drive the agent until the surrounding task is cancelled. Failures at
    /// init are terminal; failures in steady state pause the loop for a
    /// cooldown and resume.
    pub async fn run(&self) {
        let (mut git_task, mut registry_task) = match self.init_deploy().await {
            Ok(tasks) => tasks,
            Err(e) => {
                // swarm restarts the service once the health endpoint reports it
                error!("error while initializing deployment: {e}");
                self.state.set(State::Failed);
                return;
            }
        };

        loop {
            self.state.set(State::Running);
            match self.run_cycle(&mut git_task, &mut registry_task).await {
                Ok(()) => {
                    tokio::time::sleep(Duration::from_secs(
                        self.settings.polling_interval_secs,
                    ))
                    .await;
                }
                Err(e) => {
                    error!("task error: {e}");
                    if self.state.get() != State::Paused {
                        self.state.set(State::Paused);
                        self.notify_state_best_effort(&e.to_string()).await;
                    }
                    tokio::time::sleep(PAUSED_COOLDOWN).await;
                }
            }
        }
    }
}
