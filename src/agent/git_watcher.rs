use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use regex::Regex;
use tempfile::TempDir;
use url::Url;

use crate::agent::command::exec_command;
use crate::agent::errors::{AgentError, Result};
use crate::agent::retry::{with_retry, RetryPolicy};
use crate::agent::settings::RepoSettings;
use crate::agent::subtask::{ChangeMap, SubTask};

/// What was last observed for one repository. Its canonical string form is
/// the unit of change comparison: any difference from the previous
/// serialization counts as a change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoStatus {
    pub repo_id: String,
    pub branch: String,
    pub tag: Option<String>,
    pub tag_created: Option<DateTime<Utc>>,
    pub sha: String,
}

impl fmt::Display for RepoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.tag {
            Some(tag) => write!(
                f,
                "{}:{}:{}:{}",
                self.repo_id, self.branch, tag, self.sha
            ),
            None => write!(f, "{}:{}:{}", self.repo_id, self.branch, self.sha),
        }
    }
}

impl RepoStatus {
    /// Inverse of `Display`, without the tag timestamp (which is not part of
    /// the canonical form).
    pub fn parse(s: &str) -> Option<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        match parts[..] {
            [repo_id, branch, sha] => Some(Self {
                repo_id: repo_id.to_string(),
                branch: branch.to_string(),
                tag: None,
                tag_created: None,
                sha: sha.to_string(),
            }),
            [repo_id, branch, tag, sha] => Some(Self {
                repo_id: repo_id.to_string(),
                branch: branch.to_string(),
                tag: Some(tag.to_string()),
                tag_created: None,
                sha: sha.to_string(),
            }),
            _ => None,
        }
    }
}

/// One watched repository with its exclusively owned working directory.
///
/// `directory` is `None` until `init()` and `Some` (and existing on disk)
/// until `cleanup()` drops it.
#[derive(Debug)]
pub struct GitRepo {
    pub repo_id: String,
    pub repo_url: Url,
    pub branch: String,
    pub tags: Option<Regex>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub paths: Vec<PathBuf>,
    directory: Option<TempDir>,
    status: Option<RepoStatus>,
}

impl GitRepo {
    fn from_settings(cfg: &RepoSettings) -> Result<Self> {
        let tags = cfg
            .tag_pattern()
            .map(Regex::new)
            .transpose()
            .map_err(|e| {
                AgentError::Configuration(format!(
                    "invalid tag expression for repository `{}`: {e}",
                    cfg.id
                ))
            })?;
        Ok(Self {
            repo_id: cfg.id.clone(),
            repo_url: cfg.url.clone(),
            branch: cfg.branch.clone(),
            tags,
            username: cfg.username.clone().filter(|s| !s.is_empty()),
            password: cfg.password.clone().filter(|s| !s.is_empty()),
            paths: cfg.paths.clone(),
            directory: None,
            status: None,
        })
    }

    pub fn directory(&self) -> Option<&Path> {
        self.directory.as_ref().map(TempDir::path)
    }

    pub fn status(&self) -> Option<&RepoStatus> {
        self.status.as_ref()
    }

    fn dir(&self) -> Result<&Path> {
        self.directory().ok_or_else(|| {
            AgentError::Other(format!(
                "repository `{}` used before initialization",
                self.repo_id
            ))
        })
    }

    fn verify_watched_paths(&self) -> Result<()> {
        let dir = self.dir()?;
        for path in &self.paths {
            if !dir.join(path).exists() {
                return Err(AgentError::Configuration(format!(
                    "watched file {} missing in repository `{}` after checkout",
                    path.display(),
                    self.repo_id
                )));
            }
        }
        Ok(())
    }
}

fn git(args: &[&str]) -> Vec<String> {
    std::iter::once("git")
        .chain(args.iter().copied())
        .map(String::from)
        .collect()
}

async fn clone_repo(
    url: &Url,
    username: Option<&str>,
    password: Option<&str>,
    dir: &Path,
    branch: &str,
) -> Result<()> {
    let mut remote = url.clone();
    if let (Some(user), Some(pass)) = (username, password) {
        let _ = remote.set_username(user);
        let _ = remote.set_password(Some(pass));
    }
    let dir_str = dir.to_string_lossy();
    exec_command(
        &git(&[
            "clone",
            "-n",
            remote.as_str(),
            "--depth",
            "1",
            &dir_str,
            "--single-branch",
            "--branch",
            branch,
        ]),
        Path::new("."),
    )
    .await?;
    Ok(())
}

async fn fetch(dir: &Path) -> Result<()> {
    debug!("fetching git repo in {}", dir.display());
    exec_command(&git(&["fetch", "--prune", "--tags"]), dir).await?;
    Ok(())
}

async fn fetch_head_sha(dir: &Path) -> Result<String> {
    exec_command(&git(&["rev-parse", "--short", "FETCH_HEAD"]), dir).await
}

async fn sha_of_tag(dir: &Path, tag: &str) -> Result<String> {
    let long = exec_command(&git(&["rev-list", "-1", tag]), dir).await?;
    exec_command(&git(&["rev-parse", "--short", long.trim()]), dir).await
}

async fn clean_repo(dir: &Path) -> Result<()> {
    exec_command(&git(&["clean", "-dxf"]), dir).await?;
    Ok(())
}

async fn checkout(dir: &Path, reference: &str) -> Result<()> {
    exec_command(&git(&["checkout", reference]), dir).await?;
    Ok(())
}

async fn pull(dir: &Path) -> Result<()> {
    exec_command(&git(&["pull"]), dir).await?;
    Ok(())
}

/// All tags matching the expression, ordered by creation timestamp,
/// oldest first. Creation order is the required ordering: tag names sort
/// alphabetically in ways that have nothing to do with release order.
async fn matching_tags_by_creation(dir: &Path, pattern: &Regex) -> Result<Vec<String>> {
    let output = exec_command(&git(&["tag", "--list", "--sort=creatordate"]), dir).await?;
    Ok(output
        .lines()
        .filter(|line| !line.is_empty() && pattern.is_match(line))
        .map(String::from)
        .collect())
}

async fn latest_matching_tag(dir: &Path, pattern: &Regex) -> Result<Option<String>> {
    Ok(matching_tags_by_creation(dir, pattern).await?.pop())
}

/// The agreement value of a tag: the first capture group when the
/// expression defines one and it participates in the match, otherwise the
/// full tag name.
fn tag_value(pattern: &Regex, tag: &str) -> String {
    if let Some(caps) = pattern.captures(tag) {
        if let Some(group) = caps.get(1) {
            return group.as_str().to_string();
        }
    }
    tag.to_string()
}

/// Newest matching tag whose agreement value equals `value`.
async fn latest_tag_for_value(
    dir: &Path,
    pattern: &Regex,
    value: &str,
) -> Result<Option<String>> {
    let tags = matching_tags_by_creation(dir, pattern).await?;
    Ok(tags
        .into_iter()
        .filter(|t| tag_value(pattern, t) == value)
        .last())
}

/// Creation timestamp of a tag: the tagger date for annotated tags, the
/// tagged commit's author date for lightweight ones (automated release
/// pipelines often create the latter).
async fn tag_creation_date(dir: &Path, tag: &str) -> Result<DateTime<Utc>> {
    let refname = format!("refs/tags/{tag}");
    let tagger_date = exec_command(
        &git(&["for-each-ref", "--format=%(taggerdate:iso8601-strict)", &refname]),
        dir,
    )
    .await?;
    let raw = if tagger_date.trim().is_empty() {
        exec_command(&git(&["log", "-1", "--format=%aI", tag]), dir).await?
    } else {
        tagger_date
    };
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| AgentError::Other(format!("cannot parse tag date `{raw}`: {e}")))
}

/// Tags matching the expression that point at the current HEAD commit.
/// There may be several: releases are often re-tagged on the same commit.
async fn current_matching_tags(dir: &Path, pattern: &Regex) -> Result<Vec<String>> {
    let refs = match exec_command(&git(&["show-ref", "--tags", "--dereference"]), dir).await {
        Ok(out) => out,
        // show-ref exits non-zero when the repository has no tags at all
        Err(AgentError::CommandFailed { .. }) => return Ok(vec![]),
        Err(e) => return Err(e),
    };
    let head = exec_command(&git(&["rev-parse", "HEAD"]), dir).await?;
    let head = head.lines().next().unwrap_or_default();

    let mut found = Vec::new();
    for line in refs.lines() {
        let mut parts = line.split_whitespace();
        let (Some(sha), Some(refname)) = (parts.next(), parts.next()) else {
            continue;
        };
        if sha != head {
            continue;
        }
        if let Some(name) = refname.strip_prefix("refs/tags/") {
            let name = name.strip_suffix("^{}").unwrap_or(name);
            if pattern.is_match(name) && !found.iter().any(|t| t == name) {
                found.push(name.to_string());
            }
        }
    }
    Ok(found)
}

async fn diff_filenames(dir: &Path) -> Result<Vec<String>> {
    let output = exec_command(
        &git(&["--no-pager", "diff", "--name-only", "FETCH_HEAD"]),
        dir,
    )
    .await?;
    Ok(output
        .lines()
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect())
}

async fn changelog(dir: &Path, from: &str, to: &str) -> Result<String> {
    exec_command(
        &git(&["--no-pager", "log", "--oneline", &format!("{from}..{to}")]),
        dir,
    )
    .await
}

/// Whether `tag` sits on `branch`, judged from the decorated tag log.
///
/// A vanished branch is unrecoverable and raises; a tag that is simply not
/// on the branch (yet) reports `false` so the caller can skip the cycle.
async fn tag_on_branch(dir: &Path, branch: &str, tag: &str) -> Result<bool> {
    let output = exec_command(
        &git(&[
            "log",
            "--tags",
            "--simplify-by-decoration",
            "--pretty=format:%ai %d",
        ]),
        dir,
    )
    .await?;

    let mut branch_seen = false;
    for line in output.lines() {
        let has_branch = line.contains(branch);
        if has_branch && line.contains(tag) {
            return Ok(true);
        }
        branch_seen |= has_branch;
    }
    if !branch_seen {
        return Err(AgentError::Configuration(format!(
            "branch `{branch}` no longer exists on the remote"
        )));
    }
    Ok(false)
}

/// Compute the tag value all tag-bearing repositories agree on, if any.
///
/// Per repository, every matching tag contributes its agreement value with
/// the newest creation timestamp seen for that value. The winner is the
/// common value with the newest timestamp overall.
async fn resolve_common_tag_value(repos: &[GitRepo]) -> Result<Option<String>> {
    let mut per_repo: Vec<(String, BTreeMap<String, DateTime<Utc>>)> = Vec::new();

    for repo in repos {
        let Some(pattern) = &repo.tags else { continue };
        let dir = repo.dir()?;
        let mut values: BTreeMap<String, DateTime<Utc>> = BTreeMap::new();
        for tag in matching_tags_by_creation(dir, pattern).await? {
            let created = tag_creation_date(dir, &tag).await?;
            let value = tag_value(pattern, &tag);
            let entry = values.entry(value).or_insert(created);
            if created > *entry {
                *entry = created;
            }
        }
        per_repo.push((repo.repo_id.clone(), values));
    }

    if per_repo.is_empty() {
        return Err(AgentError::Configuration(
            "tag synchronization is enabled but no repository declares a tag expression"
                .to_string(),
        ));
    }

    let mut common: BTreeSet<String> = per_repo[0].1.keys().cloned().collect();
    for (_, values) in &per_repo[1..] {
        common.retain(|v| values.contains_key(v));
    }

    if common.is_empty() {
        info!("watched repositories do not share a common release tag value");
        for (repo_id, values) in &per_repo {
            info!(
                "  {repo_id}: {:?}",
                values.keys().collect::<Vec<_>>()
            );
        }
        return Ok(None);
    }

    let winner = common
        .into_iter()
        .max_by_key(|value| {
            let newest = per_repo
                .iter()
                .filter_map(|(_, values)| values.get(value))
                .max()
                .copied()
                .unwrap_or(DateTime::<Utc>::MIN_UTC);
            (newest, value.clone())
        })
        .unwrap_or_default();
    Ok(Some(winner))
}

/// Watches a set of git repositories and reports when their resolved target
/// (latest matching tag, or branch head filtered by watched paths) moves.
#[derive(Debug)]
pub struct GitUrlWatcher {
    repos: Vec<GitRepo>,
    synced_via_tags: bool,
    retry: RetryPolicy,
}

impl GitUrlWatcher {
    pub fn new(repos: &[RepoSettings], synced_via_tags: bool) -> Result<Self> {
        let repos = repos
            .iter()
            .map(GitRepo::from_settings)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            repos,
            synced_via_tags,
            retry: RetryPolicy::watcher(),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn repos(&self) -> &[GitRepo] {
        &self.repos
    }

    /// Directories of all initialized repositories, keyed by id. Used by the
    /// descriptor assembly to collect recipe files.
    pub fn repo_directories(&self) -> BTreeMap<String, PathBuf> {
        self.repos
            .iter()
            .filter_map(|r| {
                r.directory()
                    .map(|d| (r.repo_id.clone(), d.to_path_buf()))
            })
            .collect()
    }

    /// Release metadata (tag and creation timestamp) for a repository, when
    /// its current status carries a tag.
    pub fn release_for(&self, repo_id: &str) -> Option<(String, DateTime<Utc>)> {
        let status = self
            .repos
            .iter()
            .find(|r| r.repo_id == repo_id)
            .and_then(GitRepo::status)?;
        Some((status.tag.clone()?, status.tag_created?))
    }

    async fn init_repositories(&mut self) -> Result<ChangeMap> {
        info!("initializing git repositories...");
        for repo in &mut self.repos {
            let tmp = TempDir::new()?;
            debug!(
                "cloning {} into {}...",
                repo.repo_id,
                tmp.path().display()
            );
            let (url, branch) = (repo.repo_url.clone(), repo.branch.clone());
            let (user, pass) = (repo.username.clone(), repo.password.clone());
            with_retry(&self.retry, "git clone", || {
                clone_repo(&url, user.as_deref(), pass.as_deref(), tmp.path(), &branch)
            })
            .await?;
            fetch(tmp.path()).await?;
            repo.directory = Some(tmp);
        }

        // A disagreement at startup is a hard error: deploying from
        // mismatched repositories is never acceptable as an initial state.
        let common = if self.synced_via_tags {
            match resolve_common_tag_value(&self.repos).await? {
                Some(value) => Some(value),
                None => {
                    return Err(AgentError::TagSync(
                        "watched repositories do not agree on a common release tag".to_string(),
                    ))
                }
            }
        } else {
            None
        };

        let mut description = ChangeMap::new();
        for repo in &mut self.repos {
            let dir = repo.dir()?.to_path_buf();
            let target_tag = match &repo.tags {
                Some(pattern) => {
                    let tag = match &common {
                        Some(value) => latest_tag_for_value(&dir, pattern, value).await?,
                        None => latest_matching_tag(&dir, pattern).await?,
                    };
                    Some(tag.ok_or_else(|| {
                        AgentError::Configuration(format!(
                            "no tags found in {}:{} matching pattern `{}`",
                            repo.repo_url, repo.branch, pattern
                        ))
                    })?)
                }
                None => None,
            };

            checkout(&dir, target_tag.as_deref().unwrap_or("HEAD")).await?;
            repo.verify_watched_paths()?;

            let status = match &target_tag {
                Some(tag) => RepoStatus {
                    repo_id: repo.repo_id.clone(),
                    branch: repo.branch.clone(),
                    tag: Some(tag.clone()),
                    tag_created: tag_creation_date(&dir, tag).await.ok(),
                    sha: sha_of_tag(&dir, tag).await?,
                },
                None => RepoStatus {
                    repo_id: repo.repo_id.clone(),
                    branch: repo.branch.clone(),
                    tag: None,
                    tag_created: None,
                    sha: fetch_head_sha(&dir).await?,
                },
            };
            info!("repository {} checked out on {status}", repo.repo_id);
            description.insert(repo.repo_id.clone(), status.to_string());
            repo.status = Some(status);
        }
        Ok(description)
    }

    async fn check_repositories(&mut self) -> Result<ChangeMap> {
        for repo in &self.repos {
            fetch(repo.dir()?).await?;
        }

        let (common, sync_blocked) = if self.synced_via_tags {
            match resolve_common_tag_value(&self.repos).await? {
                Some(value) => {
                    info!("all synced repositories agree on tag value `{value}`");
                    (Some(value), false)
                }
                None => {
                    info!("no common tag this cycle; only repositories without a tag expression will update");
                    (None, true)
                }
            }
        } else {
            (None, false)
        };

        let mut changes = ChangeMap::new();
        for repo in &mut self.repos {
            if sync_blocked && repo.tags.is_some() {
                continue;
            }
            debug!("checking repo {}...", repo.repo_id);
            clean_repo(repo.dir()?).await?;

            let new_status = if repo.tags.is_some() {
                update_repo_using_tags(repo, common.as_deref()).await?
            } else {
                update_repo_using_branch_head(repo).await?
            };
            if let Some(status) = new_status {
                changes.insert(repo.repo_id.clone(), status.to_string());
                repo.status = Some(status);
            }
        }
        Ok(changes)
    }
}

async fn update_repo_using_tags(
    repo: &GitRepo,
    common_value: Option<&str>,
) -> Result<Option<RepoStatus>> {
    let dir = repo.dir()?;
    let Some(pattern) = &repo.tags else {
        return Ok(None);
    };

    let latest = match common_value {
        Some(value) => latest_tag_for_value(dir, pattern, value).await?,
        None => latest_matching_tag(dir, pattern).await?,
    };
    let Some(latest) = latest else {
        warn!(
            "no tag matching `{pattern}` in {} yet, skipping this cycle",
            repo.repo_id
        );
        return Ok(None);
    };

    if !tag_on_branch(dir, &repo.branch, &latest).await? {
        warn!(
            "tag {latest} is not on branch {} of {}, skipping this cycle",
            repo.branch, repo.repo_id
        );
        return Ok(None);
    }

    let current_tags = current_matching_tags(dir, pattern).await?;
    debug!(
        "tags for {}: current {current_tags:?}, latest {latest}",
        repo.repo_id
    );
    if let Some(current) = current_tags.first() {
        if let Ok(logs) = changelog(dir, current, &latest).await {
            debug!("{latest} tag changes:\n{logs}");
        }
    }

    // Checkout regardless of change, so HEAD always sits on the latest
    // matching tag and the next current-tag lookup sees it.
    checkout(dir, &latest).await?;
    repo.verify_watched_paths()?;

    if current_tags.iter().any(|t| t == &latest) {
        debug!("no change detected for {}", repo.repo_id);
        return Ok(None);
    }

    info!("new tag {latest} checked out on repo {}", repo.repo_id);
    Ok(Some(RepoStatus {
        repo_id: repo.repo_id.clone(),
        branch: repo.branch.clone(),
        tag: Some(latest.clone()),
        tag_created: tag_creation_date(dir, &latest).await.ok(),
        sha: sha_of_tag(dir, &latest).await?,
    }))
}

async fn update_repo_using_branch_head(repo: &GitRepo) -> Result<Option<RepoStatus>> {
    let dir = repo.dir()?;
    let modified = diff_filenames(dir).await?;
    if modified.is_empty() {
        return Ok(None);
    }

    if let Ok(logs) = changelog(dir, &repo.branch, &format!("origin/{}", repo.branch)).await {
        debug!("changelog:\n{logs}");
    }
    pull(dir).await?;

    let relevant: Vec<&String> = if repo.paths.is_empty() {
        modified.iter().collect()
    } else {
        modified
            .iter()
            .filter(|f| repo.paths.iter().any(|p| p == Path::new(f)))
            .collect()
    };
    if relevant.is_empty() {
        return Ok(None);
    }

    info!("files {relevant:?} changed in {}", repo.repo_id);
    Ok(Some(RepoStatus {
        repo_id: repo.repo_id.clone(),
        branch: repo.branch.clone(),
        tag: None,
        tag_created: None,
        sha: fetch_head_sha(dir).await?,
    }))
}

#[async_trait]
impl SubTask for GitUrlWatcher {
    fn name(&self) -> &str {
        "git repo watcher"
    }

    async fn init(&mut self) -> Result<ChangeMap> {
        self.init_repositories().await
    }

    async fn check_for_changes(&mut self) -> Result<ChangeMap> {
        let policy = self.retry.clone();
        let mut attempt = 1;
        loop {
            match self.check_repositories().await {
                Ok(changes) => return Ok(changes),
                Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                    let delay = policy.jittered_delay();
                    warn!(
                        "git check failed (attempt {attempt}/{}): {e}; retrying in {delay:?}",
                        policy.max_attempts
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn cleanup(&mut self) -> Result<()> {
        for repo in &mut self.repos {
            repo.status = None;
            if let Some(dir) = repo.directory.take() {
                if let Err(e) = dir.close() {
                    warn!("could not remove working directory of {}: {e}", repo.repo_id);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_string_without_tag() {
        let status = RepoStatus {
            repo_id: "r1".to_string(),
            branch: "main".to_string(),
            tag: None,
            tag_created: None,
            sha: "abc1234".to_string(),
        };
        assert_eq!(status.to_string(), "r1:main:abc1234");
    }

    #[test]
    fn test_status_string_roundtrip() {
        let status = RepoStatus {
            repo_id: "simcore".to_string(),
            branch: "master".to_string(),
            tag: Some("staging_v3".to_string()),
            tag_created: None,
            sha: "deadbee".to_string(),
        };
        let parsed = RepoStatus::parse(&status.to_string()).unwrap();
        assert_eq!(parsed, status);

        let plain = RepoStatus::parse("r1:main:abc1234").unwrap();
        assert_eq!(plain.tag, None);
        assert_eq!(plain.sha, "abc1234");

        assert!(RepoStatus::parse("garbage").is_none());
    }

    #[test]
    fn test_tag_value_uses_first_capture_group() {
        let pattern = Regex::new("^test(staging_.+)$").unwrap();
        assert_eq!(tag_value(&pattern, "teststaging_v1"), "staging_v1");
    }

    #[test]
    fn test_tag_value_falls_back_to_full_tag() {
        let pattern = Regex::new("^staging_.+$").unwrap();
        assert_eq!(tag_value(&pattern, "staging_v1"), "staging_v1");
    }

    #[test]
    fn test_invalid_tag_expression_is_a_configuration_error() {
        let cfg = RepoSettings {
            id: "r1".to_string(),
            url: Url::parse("https://example.com/repo.git").unwrap(),
            branch: "main".to_string(),
            tags: Some("^staging_(unclosed".to_string()),
            paths: vec![],
            username: None,
            password: None,
        };
        let err = GitUrlWatcher::new(std::slice::from_ref(&cfg), false).unwrap_err();
        assert!(matches!(err, AgentError::Configuration(_)));
    }
}
