#![allow(dead_code)]

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use tempfile::TempDir;
use url::Url;

use stackwatch::agent::settings::RepoSettings;

/// A local git repository acting as the watched remote. Tests commit and tag
/// here, the watcher clones from `url()`.
pub struct GitFixture {
    dir: TempDir,
    pub branch: String,
}

impl GitFixture {
    pub fn new(branch: &str) -> Self {
        let fixture = Self {
            dir: TempDir::new().unwrap(),
            branch: branch.to_string(),
        };
        fixture.sh("git init && git config user.name tester && git config user.email tester@test.com");
        fixture.sh(&format!(
            "git checkout -b {branch} && touch initial_file.txt && git add . && git commit -m 'initial commit'"
        ));
        fixture
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn url(&self) -> Url {
        Url::parse(&format!("file://{}", self.path().display())).unwrap()
    }

    pub fn sh(&self, script: &str) {
        let output = Command::new("sh")
            .arg("-c")
            .arg(script)
            .current_dir(self.path())
            .output()
            .unwrap();
        assert!(
            output.status.success(),
            "script `{script}` failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }

    pub fn stdout(&self, script: &str) -> String {
        let output = Command::new("sh")
            .arg("-c")
            .arg(script)
            .current_dir(self.path())
            .output()
            .unwrap();
        assert!(output.status.success());
        String::from_utf8_lossy(&output.stdout).trim_end().to_string()
    }

    pub fn commit_new_file(&self, name: &str, message: &str) {
        self.sh(&format!("touch {name} && git add . && git commit -m '{message}'"));
    }

    pub fn append_and_commit(&self, name: &str, message: &str) {
        self.sh(&format!(
            "echo '# blahblah' >> {name} && git add . && git commit -m '{message}'"
        ));
    }

    pub fn tag(&self, name: &str) {
        self.sh(&format!("git tag {name}"));
    }

    pub fn head_short_sha(&self) -> String {
        self.stdout("git rev-parse --short HEAD")
    }

    pub fn repo_settings(&self, id: &str, tags: Option<&str>, paths: &[&str]) -> RepoSettings {
        RepoSettings {
            id: id.to_string(),
            url: self.url(),
            branch: self.branch.clone(),
            tags: tags.map(String::from),
            paths: paths.iter().map(From::from).collect(),
            username: None,
            password: None,
        }
    }
}

/// Lightweight tags inherit the commit timestamp, which only has second
/// granularity. Tests that rely on creation ordering space commits out.
pub fn wait_for_distinct_timestamps() {
    std::thread::sleep(Duration::from_millis(1100));
}
