use std::time::Duration;

use log::debug;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use url::Url;

use crate::agent::compose::ComposeSpec;
use crate::agent::errors::{AgentError, Result};
use crate::agent::retry::{with_retry, RetryPolicy};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct AuthResponse {
    jwt: String,
}

#[derive(Debug, Deserialize)]
struct Endpoint {
    #[serde(rename = "Id")]
    id: i64,
}

#[derive(Debug, Deserialize)]
struct SwarmInfo {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Debug, Deserialize)]
pub struct StackSummary {
    #[serde(rename = "Id")]
    pub id: i64,
    #[serde(rename = "Name")]
    pub name: String,
}

/// Swarm rejects uppercase stack names, so they are refused here before any
/// request goes out.
fn ensure_lowercase_stack_name(stack_name: &str) -> Result<()> {
    if stack_name.to_lowercase() != stack_name {
        return Err(AgentError::Configuration(
            "docker swarm stack names must be lowercase only".to_string(),
        ));
    }
    Ok(())
}

/// Client for one Portainer instance. Authentication is per call chain: the
/// reconciliation loop fetches a fresh bearer token at the start of every
/// interaction.
pub struct PortainerClient {
    base_url: Url,
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl PortainerClient {
    pub fn new(base_url: Url) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            base_url,
            client,
            retry: RetryPolicy::request(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn url(&self, path: &str, query: &[(&str, String)]) -> Url {
        let mut url = self.base_url.clone();
        url.set_path(path);
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }
        url
    }

    async fn send_once(
        &self,
        method: Method,
        url: &Url,
        token: Option<&str>,
        body: Option<&serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let mut request = self.client.request(method, url.clone());
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        debug!("portainer answered {} for {url}", response.status());
        match response.status() {
            StatusCode::OK => Ok(response.json().await?),
            StatusCode::NO_CONTENT => Ok(serde_json::Value::Null),
            StatusCode::NOT_FOUND => Err(AgentError::Configuration(format!(
                "could not reach portainer route {url}: {}",
                response.text().await.unwrap_or_default()
            ))),
            status => Err(AgentError::UnexpectedResponse {
                status: status.as_u16(),
                url: url.to_string(),
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }

    async fn request(
        &self,
        method: Method,
        url: Url,
        token: Option<&str>,
        body: Option<serde_json::Value>,
    ) -> Result<serde_json::Value> {
        with_retry(&self.retry, "portainer request", || {
            self.send_once(method.clone(), &url, token, body.as_ref())
        })
        .await
    }

    pub async fn authenticate(&self, username: &str, password: &str) -> Result<String> {
        debug!("authenticating with portainer at {}", self.base_url);
        let data = self
            .request(
                Method::POST,
                self.url("api/auth", &[]),
                None,
                Some(serde_json::json!({
                    "Username": username,
                    "Password": password,
                })),
            )
            .await?;
        let auth: AuthResponse = serde_json::from_value(data)
            .map_err(|e| AgentError::Other(format!("malformed auth response: {e}")))?;
        Ok(auth.jwt)
    }

    pub async fn get_first_endpoint_id(&self, token: &str) -> Result<i64> {
        let data = self
            .request(Method::GET, self.url("api/endpoints", &[]), Some(token), None)
            .await?;
        let endpoints: Vec<Endpoint> = serde_json::from_value(data)
            .map_err(|e| AgentError::Other(format!("malformed endpoint list: {e}")))?;
        endpoints
            .first()
            .map(|e| e.id)
            .ok_or_else(|| {
                AgentError::Configuration("portainer does not provide any endpoint".to_string())
            })
    }

    async fn resolve_endpoint_id(&self, token: &str, endpoint_id: i64) -> Result<i64> {
        if endpoint_id >= 0 {
            return Ok(endpoint_id);
        }
        let resolved = self.get_first_endpoint_id(token).await?;
        debug!("resolved first endpoint id: {resolved}");
        Ok(resolved)
    }

    pub async fn get_swarm_id(&self, token: &str, endpoint_id: i64) -> Result<String> {
        let endpoint_id = self.resolve_endpoint_id(token, endpoint_id).await?;
        let data = self
            .request(
                Method::GET,
                self.url(&format!("api/endpoints/{endpoint_id}/docker/swarm"), &[]),
                Some(token),
                None,
            )
            .await?;
        let swarm: SwarmInfo = serde_json::from_value(data)
            .map_err(|e| AgentError::Other(format!("malformed swarm response: {e}")))?;
        Ok(swarm.id)
    }

    pub async fn get_stacks_list(&self, token: &str) -> Result<Vec<StackSummary>> {
        let data = self
            .request(Method::GET, self.url("api/stacks", &[]), Some(token), None)
            .await?;
        serde_json::from_value(data)
            .map_err(|e| AgentError::Other(format!("malformed stack list: {e}")))
    }

    /// Id of the named stack, or `None` when no stack with that name exists.
    pub async fn get_current_stack_id(
        &self,
        token: &str,
        stack_name: &str,
    ) -> Result<Option<i64>> {
        ensure_lowercase_stack_name(stack_name)?;
        let stacks = self.get_stacks_list(token).await?;
        Ok(stacks
            .iter()
            .find(|s| s.name.to_lowercase() == stack_name)
            .map(|s| s.id))
    }

    pub async fn post_new_stack(
        &self,
        token: &str,
        swarm_id: &str,
        endpoint_id: i64,
        stack_name: &str,
        stack: &ComposeSpec,
    ) -> Result<()> {
        ensure_lowercase_stack_name(stack_name)?;
        debug!("creating new stack `{stack_name}` on {}", self.base_url);
        let endpoint_id = self.resolve_endpoint_id(token, endpoint_id).await?;
        let url = self.url(
            "api/stacks",
            &[
                ("type", "1".to_string()),
                ("method", "string".to_string()),
                ("endpointId", endpoint_id.to_string()),
            ],
        );
        let body = serde_json::json!({
            "Name": stack_name,
            "SwarmID": swarm_id,
            "StackFileContent": stack_file_content(stack)?,
        });
        self.request(Method::POST, url, Some(token), Some(body))
            .await?;
        Ok(())
    }

    pub async fn update_stack(
        &self,
        token: &str,
        stack_id: i64,
        endpoint_id: i64,
        stack: &ComposeSpec,
    ) -> Result<()> {
        debug!("updating stack {stack_id} on {}", self.base_url);
        let endpoint_id = self.resolve_endpoint_id(token, endpoint_id).await?;
        let url = self.url(
            &format!("api/stacks/{stack_id}"),
            &[
                ("endpointId", endpoint_id.to_string()),
                ("method", "string".to_string()),
                ("type", "1".to_string()),
            ],
        );
        let body = serde_json::json!({
            "StackFileContent": stack_file_content(stack)?,
            "pullImage": true,
        });
        self.request(Method::PUT, url, Some(token), Some(body))
            .await?;
        Ok(())
    }

    pub async fn delete_stack(
        &self,
        token: &str,
        stack_id: i64,
        endpoint_id: i64,
    ) -> Result<()> {
        debug!("deleting stack {stack_id} on {}", self.base_url);
        let endpoint_id = self.resolve_endpoint_id(token, endpoint_id).await?;
        let url = self.url(
            &format!("api/stacks/{stack_id}"),
            &[("endpointId", endpoint_id.to_string())],
        );
        self.request(Method::DELETE, url, Some(token), None).await?;
        Ok(())
    }
}

/// Portainer expects the descriptor as one JSON string inside the request
/// body, not as nested JSON.
fn stack_file_content(stack: &ComposeSpec) -> Result<String> {
    serde_json::to_string_pretty(stack)
        .map_err(|e| AgentError::Other(format!("cannot serialize stack descriptor: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lowercase_stack_names_accepted() {
        assert!(ensure_lowercase_stack_name("simcore-stack").is_ok());
    }

    #[test]
    fn test_uppercase_stack_names_rejected() {
        let err = ensure_lowercase_stack_name("MyStack").unwrap_err();
        assert!(matches!(err, AgentError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_uppercase_stack_name_fails_before_any_request() {
        // unroutable base url: the call must fail on validation, not I/O
        let client = PortainerClient::new(Url::parse("http://192.0.2.1:1").unwrap()).unwrap();
        let err = client
            .get_current_stack_id("token", "MyStack")
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Configuration(_)));
    }

    #[test]
    fn test_stack_summary_deserialization() {
        let stacks: Vec<StackSummary> = serde_json::from_str(
            r#"[{"Id": 1, "Name": "simcore", "Type": 1}, {"Id": 2, "Name": "ops"}]"#,
        )
        .unwrap();
        assert_eq!(stacks.len(), 2);
        assert_eq!(stacks[0].id, 1);
        assert_eq!(stacks[1].name, "ops");
    }

    #[test]
    fn test_url_replaces_path_and_keeps_query() {
        let client =
            PortainerClient::new(Url::parse("https://portainer.example.com").unwrap()).unwrap();
        let url = client.url("api/stacks", &[("endpointId", "2".to_string())]);
        assert_eq!(
            url.as_str(),
            "https://portainer.example.com/api/stacks?endpointId=2"
        );
    }
}
