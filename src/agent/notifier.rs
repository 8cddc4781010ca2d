use log::{debug, warn};
use reqwest::StatusCode;
use serde::Deserialize;
use url::Url;

use crate::agent::errors::{AgentError, Result};
use crate::agent::settings::NotificationSettings;
use crate::agent::state::State;

const STATUS_MARKER: &str = " | status:";

#[derive(Debug, Deserialize)]
struct ChannelInfo {
    #[serde(default)]
    header: String,
}

/// Posts deployment events to the configured Mattermost channels. Failures
/// here must never take the reconciliation loop down, so the loop treats
/// every call as best-effort.
pub struct Notifier {
    client: reqwest::Client,
    targets: Vec<NotificationSettings>,
}

impl Notifier {
    pub fn new(targets: &[NotificationSettings]) -> Self {
        Self {
            client: reqwest::Client::new(),
            targets: targets
                .iter()
                .filter(|t| t.enabled)
                .cloned()
                .collect(),
        }
    }

    fn enabled_mattermost_targets(&self) -> impl Iterator<Item = &NotificationSettings> {
        self.targets
            .iter()
            .filter(|t| t.service_type == "mattermost")
    }

    /// Post a message to every configured channel. The configured message
    /// prefix always forms the first line. One unreachable channel does not
    /// stop delivery to the others; the first failure is still reported.
    pub async fn notify(&self, message: &str) -> Result<()> {
        let mut failure = None;
        for target in self.enabled_mattermost_targets() {
            if let Err(e) = self.post_message(target, message).await {
                warn!(
                    "could not post to channel {} on {}: {e}",
                    target.channel_id, target.url
                );
                failure.get_or_insert(e);
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn post_message(&self, target: &NotificationSettings, message: &str) -> Result<()> {
        let text = if message.is_empty() {
            target.message.clone()
        } else {
            format!("{}\n{}", target.message, message)
        };
        debug!("posting to {}: {text}", target.url);
        let url = with_path(&target.url, "api/v4/posts");
        let response = self
            .client
            .post(url.clone())
            .bearer_auth(&target.personal_token)
            .json(&serde_json::json!({
                "channel_id": target.channel_id,
                "message": text,
            }))
            .send()
            .await?;
        if response.status() != StatusCode::CREATED {
            return Err(AgentError::UnexpectedResponse {
                status: response.status().as_u16(),
                url: url.to_string(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }

    /// Reflect the agent state in every channel header, keeping whatever the
    /// header said before the status segment. Like [`Notifier::notify`], all
    /// targets are attempted even when one of them fails.
    pub async fn notify_state(&self, state: State, message: &str) -> Result<()> {
        let mut failure = None;
        for target in self.enabled_mattermost_targets() {
            if let Err(e) = self.patch_channel_header(target, state, message).await {
                warn!(
                    "could not update header of channel {} on {}: {e}",
                    target.channel_id, target.url
                );
                failure.get_or_insert(e);
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn patch_channel_header(
        &self,
        target: &NotificationSettings,
        state: State,
        message: &str,
    ) -> Result<()> {
        let channel_url = with_path(
            &target.url,
            &format!("api/v4/channels/{}", target.channel_id),
        );
        let response = self
            .client
            .get(channel_url)
            .bearer_auth(&target.personal_token)
            .send()
            .await?;
        if !response.status().is_success() {
            warn!(
                "cannot read channel {} on {}: {}",
                target.channel_id,
                target.url,
                response.status()
            );
            return Ok(());
        }
        let channel: ChannelInfo = response.json().await?;

        let header = format!(
            "{}{STATUS_MARKER} {} {message}",
            strip_status_segment(&channel.header),
            state.name()
        );
        let patch_url = with_path(
            &target.url,
            &format!("api/v4/channels/{}/patch", target.channel_id),
        );
        let response = self
            .client
            .put(patch_url.clone())
            .bearer_auth(&target.personal_token)
            .json(&serde_json::json!({ "header": header.trim() }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(AgentError::UnexpectedResponse {
                status: response.status().as_u16(),
                url: patch_url.to_string(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }
}

fn with_path(base: &Url, path: &str) -> Url {
    let mut url = base.clone();
    url.set_path(path);
    url
}

fn strip_status_segment(header: &str) -> &str {
    match header.find(STATUS_MARKER) {
        Some(index) => header[..index].trim_end(),
        None => header.trim_end(),
    }
}
