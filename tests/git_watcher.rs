mod common;

use stackwatch::agent::errors::AgentError;
use stackwatch::agent::git_watcher::GitUrlWatcher;
use stackwatch::agent::subtask::SubTask;

use common::{wait_for_distinct_timestamps, GitFixture};

const TAG_PATTERN: &str = "^test(staging_.+)$";

#[tokio::test]
async fn test_branch_head_watcher_sees_new_commits() {
    let origin = GitFixture::new("devel");
    let mut watcher =
        GitUrlWatcher::new(&[origin.repo_settings("test-repo-0", None, &[])], false).unwrap();

    let init_result = watcher.init().await.unwrap();
    let sha = origin.head_short_sha();
    assert_eq!(
        init_result.get("test-repo-0"),
        Some(&format!("test-repo-0:devel:{sha}"))
    );

    // no changes yet
    assert!(watcher.check_for_changes().await.unwrap().is_empty());

    origin.commit_new_file("my_file.txt", "I added a file");
    let changes = watcher.check_for_changes().await.unwrap();
    let sha = origin.head_short_sha();
    assert_eq!(
        changes.get("test-repo-0"),
        Some(&format!("test-repo-0:devel:{sha}"))
    );

    // reporting is edge triggered
    assert!(watcher.check_for_changes().await.unwrap().is_empty());

    watcher.cleanup().await.unwrap();
}

#[tokio::test]
async fn test_watched_paths_scope_change_detection() {
    let origin = GitFixture::new("devel");
    let settings = origin.repo_settings("test-repo-0", None, &["theonefile.csv"]);

    // the watched file does not exist yet
    let mut watcher = GitUrlWatcher::new(std::slice::from_ref(&settings), false).unwrap();
    let err = watcher.init().await.unwrap_err();
    assert!(matches!(err, AgentError::Configuration(_)));

    origin.commit_new_file("theonefile.csv", "I added theonefile.csv");
    let mut watcher = GitUrlWatcher::new(std::slice::from_ref(&settings), false).unwrap();
    watcher.init().await.unwrap();

    assert!(watcher.check_for_changes().await.unwrap().is_empty());

    // a commit outside the watched paths is not a change
    origin.commit_new_file("my_file.txt", "I added a file");
    assert!(watcher.check_for_changes().await.unwrap().is_empty());

    origin.append_and_commit("theonefile.csv", "I modified theonefile.csv");
    let changes = watcher.check_for_changes().await.unwrap();
    let sha = origin.head_short_sha();
    assert_eq!(
        changes.get("test-repo-0"),
        Some(&format!("test-repo-0:devel:{sha}"))
    );

    watcher.cleanup().await.unwrap();
}

#[tokio::test]
async fn test_tag_watcher_follows_matching_tags_only() {
    let origin = GitFixture::new("devel");
    let settings = origin.repo_settings("test-repo-0", Some(TAG_PATTERN), &["theonefile.csv"]);

    // no matching tag exists yet
    let mut watcher = GitUrlWatcher::new(std::slice::from_ref(&settings), false).unwrap();
    let err = watcher.init().await.unwrap_err();
    assert!(matches!(err, AgentError::Configuration(_)));

    origin.commit_new_file("theonefile.csv", "I added theonefile.csv");
    origin.tag("teststaging_z1stvalid");
    let mut watcher = GitUrlWatcher::new(std::slice::from_ref(&settings), false).unwrap();
    let init_result = watcher.init().await.unwrap();
    let sha = origin.head_short_sha();
    assert_eq!(
        init_result.get("test-repo-0"),
        Some(&format!("test-repo-0:devel:teststaging_z1stvalid:{sha}"))
    );

    assert!(watcher.check_for_changes().await.unwrap().is_empty());

    // new commits without a matching tag are not changes in tag mode
    origin.commit_new_file("my_file.txt", "I added a file");
    assert!(watcher.check_for_changes().await.unwrap().is_empty());

    wait_for_distinct_timestamps();
    origin.append_and_commit("theonefile.csv", "I modified theonefile.csv");
    assert!(watcher.check_for_changes().await.unwrap().is_empty());

    // a tag outside the pattern is ignored
    origin.tag("v3.4.5");
    assert!(watcher.check_for_changes().await.unwrap().is_empty());

    origin.tag("teststaging_g2ndvalid");
    let changes = watcher.check_for_changes().await.unwrap();
    let sha = origin.head_short_sha();
    assert_eq!(
        changes.get("test-repo-0"),
        Some(&format!("test-repo-0:devel:teststaging_g2ndvalid:{sha}"))
    );

    // another matching tag on the same commit is not a change
    origin.tag("teststaging_a3rdvalid");
    assert!(watcher.check_for_changes().await.unwrap().is_empty());

    watcher.cleanup().await.unwrap();
}

#[tokio::test]
async fn test_tags_are_ordered_by_creation_not_alphabetically() {
    let origin = GitFixture::new("devel");
    let settings = origin.repo_settings("test-repo-0", Some(TAG_PATTERN), &[]);

    origin.tag("teststaging_z1stvalid");
    let mut watcher = GitUrlWatcher::new(std::slice::from_ref(&settings), false).unwrap();
    watcher.init().await.unwrap();

    wait_for_distinct_timestamps();
    // alphabetically this sorts before the existing tag, temporally after
    origin.commit_new_file("another.txt", "newer release");
    origin.tag("teststaging_h5thvalid");

    let changes = watcher.check_for_changes().await.unwrap();
    let sha = origin.head_short_sha();
    assert_eq!(
        changes.get("test-repo-0"),
        Some(&format!("test-repo-0:devel:teststaging_h5thvalid:{sha}"))
    );

    watcher.cleanup().await.unwrap();
}

const SYNC_PATTERN: &str = "^staging_(v[0-9]+)$";

#[tokio::test]
async fn test_tag_sync_disagreement_at_init_is_fatal() {
    let origin_a = GitFixture::new("devel");
    let origin_b = GitFixture::new("devel");
    origin_a.tag("staging_v1");
    origin_b.tag("staging_v2");

    let mut watcher = GitUrlWatcher::new(
        &[
            origin_a.repo_settings("repo-a", Some(SYNC_PATTERN), &[]),
            origin_b.repo_settings("repo-b", Some(SYNC_PATTERN), &[]),
        ],
        true,
    )
    .unwrap();
    let err = watcher.init().await.unwrap_err();
    assert!(matches!(err, AgentError::TagSync(_)));
}

#[tokio::test]
async fn test_tag_sync_waits_for_agreement_then_moves_together() {
    let origin_a = GitFixture::new("devel");
    let origin_b = GitFixture::new("devel");
    origin_a.tag("staging_v1");
    origin_b.tag("staging_v1");

    let mut watcher = GitUrlWatcher::new(
        &[
            origin_a.repo_settings("repo-a", Some(SYNC_PATTERN), &[]),
            origin_b.repo_settings("repo-b", Some(SYNC_PATTERN), &[]),
        ],
        true,
    )
    .unwrap();
    let init_result = watcher.init().await.unwrap();
    assert!(init_result["repo-a"].contains(":staging_v1:"));
    assert!(init_result["repo-b"].contains(":staging_v1:"));

    // only one repo carries the new release value, nobody moves
    wait_for_distinct_timestamps();
    origin_a.commit_new_file("release.txt", "release v2");
    origin_a.tag("staging_v2");
    assert!(watcher.check_for_changes().await.unwrap().is_empty());

    // the other repo catches up, both move to v2
    origin_b.commit_new_file("release.txt", "release v2");
    origin_b.tag("staging_v2");
    let changes = watcher.check_for_changes().await.unwrap();
    assert!(changes["repo-a"].contains(":staging_v2:"));
    assert!(changes["repo-b"].contains(":staging_v2:"));

    watcher.cleanup().await.unwrap();
}

#[tokio::test]
async fn test_repo_directories_are_removed_on_cleanup() {
    let origin = GitFixture::new("devel");
    let mut watcher =
        GitUrlWatcher::new(&[origin.repo_settings("test-repo-0", None, &[])], false).unwrap();
    watcher.init().await.unwrap();

    let dirs = watcher.repo_directories();
    let checkout = dirs.get("test-repo-0").unwrap().clone();
    assert!(checkout.join("initial_file.txt").exists());

    watcher.cleanup().await.unwrap();
    assert!(!checkout.exists());
    assert!(watcher.repo_directories().is_empty());
}
