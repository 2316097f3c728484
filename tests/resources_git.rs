//! Resource cache against real git, using local `file://` fixtures.

mod common;

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use btca_server::config::{ConfigFile, ConfigStore, GitResource, ResourceDefinition};
use btca_server::error::BtcaError;
use btca_server::resources::ResourceStore;

fn git(dir: &Path, args: &[&str]) {
    let status = Command::new("git")
        .args([
            "-c",
            "user.email=tests@example.com",
            "-c",
            "user.name=tests",
        ])
        .args(args)
        .current_dir(dir)
        .status()
        .expect("git runs");
    assert!(status.success(), "git {args:?} failed");
}

/// Build an upstream repo with the given files and one commit on `main`.
fn init_upstream(dir: &Path, files: &[(&str, &str)]) {
    std::fs::create_dir_all(dir).unwrap();
    git(dir, &["init", "-b", "main"]);
    for (rel, contents) in files {
        let path = dir.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, contents).unwrap();
    }
    git(dir, &["add", "-A"]);
    git(dir, &["commit", "-m", "init"]);
}

fn store_for(
    root: &Path,
    name: &str,
    upstream: &Path,
    search_path: Option<&str>,
) -> (Arc<ConfigStore>, ResourceStore) {
    let file = ConfigFile {
        schema: None,
        resources: vec![ResourceDefinition::Git(GitResource {
            name: name.to_string(),
            url: format!("file://{}", upstream.display()),
            branch: "main".to_string(),
            search_path: search_path.map(|s| s.to_string()),
            special_notes: None,
        })],
        model: "test-model".to_string(),
        provider: "openrouter".to_string(),
    };
    let config = Arc::new(ConfigStore::new(root.join("config.jsonc"), file));
    let store = ResourceStore::new(root.join("resources"), Arc::clone(&config));
    (config, store)
}

#[tokio::test]
async fn first_load_clones_second_load_updates() {
    let root = tempfile::tempdir().unwrap();
    let upstream = root.path().join("upstream");
    init_upstream(&upstream, &[("README.md", "v1")]);

    let (_config, store) = store_for(root.path(), "docs", &upstream, None);

    let loaded = store.load("docs", true).await.unwrap();
    let cached: PathBuf = loaded.absolute_path().to_path_buf();
    assert_eq!(std::fs::read_to_string(cached.join("README.md")).unwrap(), "v1");

    // An untracked marker survives fetch + reset but not a re-clone.
    std::fs::write(cached.join(".marker"), "here").unwrap();

    std::fs::write(upstream.join("README.md"), "v2").unwrap();
    git(&upstream, &["add", "-A"]);
    git(&upstream, &["commit", "-m", "update"]);

    let again = store.load("docs", true).await.unwrap();
    assert_eq!(again.absolute_path(), cached.as_path());
    assert_eq!(std::fs::read_to_string(cached.join("README.md")).unwrap(), "v2");
    assert!(
        cached.join(".marker").exists(),
        "second load must take the update path, not re-clone"
    );
}

#[tokio::test]
async fn sparse_checkout_materializes_only_the_focus_path() {
    let root = tempfile::tempdir().unwrap();
    let upstream = root.path().join("upstream");
    init_upstream(
        &upstream,
        &[("docs/guide.md", "guide"), ("src/main.js", "code")],
    );

    let (_config, store) = store_for(root.path(), "proj", &upstream, Some("docs"));

    let loaded = store.load("proj", true).await.unwrap();
    assert_eq!(loaded.repo_sub_path.as_deref(), Some("docs"));
    assert!(loaded.absolute_path().join("docs/guide.md").exists());
    assert!(
        !loaded.absolute_path().join("src/main.js").exists(),
        "sparse checkout must not materialize paths outside the focus"
    );
}

#[tokio::test]
async fn removing_the_search_path_re_materializes_the_full_worktree() {
    let root = tempfile::tempdir().unwrap();
    let upstream = root.path().join("upstream");
    init_upstream(
        &upstream,
        &[("docs/guide.md", "guide"), ("src/main.js", "code")],
    );

    let (_config, sparse_store) = store_for(root.path(), "proj", &upstream, Some("docs"));
    let loaded = sparse_store.load("proj", true).await.unwrap();
    assert!(!loaded.absolute_path().join("src/main.js").exists());

    // The marker proves the second load updates in place instead of
    // re-cloning.
    std::fs::write(loaded.absolute_path().join(".marker"), "here").unwrap();

    // Same cache directory, config now without a searchPath.
    let (_config, full_store) = store_for(root.path(), "proj", &upstream, None);
    let reloaded = full_store.load("proj", true).await.unwrap();

    assert_eq!(reloaded.repo_sub_path, None);
    assert!(
        reloaded.absolute_path().join("src/main.js").exists(),
        "dropping searchPath must widen the worktree back to the full tree"
    );
    assert!(reloaded.absolute_path().join("docs/guide.md").exists());
    assert!(reloaded.absolute_path().join(".marker").exists());
}

#[tokio::test]
async fn missing_search_path_is_reported() {
    let root = tempfile::tempdir().unwrap();
    let upstream = root.path().join("upstream");
    init_upstream(&upstream, &[("README.md", "x")]);

    let (_config, store) = store_for(root.path(), "docs", &upstream, Some("no-such-dir"));

    let err = store.load("docs", true).await.unwrap_err();
    assert!(matches!(err, BtcaError::SearchPathMissing { .. }));
    assert_eq!(err.tag(), "ResourceError");
}

#[tokio::test]
async fn unknown_resource_name_is_reported() {
    let root = tempfile::tempdir().unwrap();
    let upstream = root.path().join("upstream");
    init_upstream(&upstream, &[("README.md", "x")]);

    let (_config, store) = store_for(root.path(), "docs", &upstream, None);

    let err = store.load("nope", true).await.unwrap_err();
    assert!(matches!(err, BtcaError::ResourceNotFound(_)));
}

#[tokio::test]
async fn failed_clone_leaves_no_cache_entry() {
    let root = tempfile::tempdir().unwrap();
    let upstream = root.path().join("upstream");
    init_upstream(&upstream, &[("README.md", "x")]);

    let file = ConfigFile {
        schema: None,
        resources: vec![ResourceDefinition::Git(GitResource {
            name: "broken".to_string(),
            url: format!("file://{}/does-not-exist", root.path().display()),
            branch: "main".to_string(),
            search_path: None,
            special_notes: None,
        })],
        model: "test-model".to_string(),
        provider: "openrouter".to_string(),
    };
    let config = Arc::new(ConfigStore::new(root.path().join("c.jsonc"), file));
    let store = ResourceStore::new(root.path().join("resources"), config);

    let err = store.load("broken", true).await.unwrap_err();
    assert_eq!(err.tag(), "ResourceError");
    assert!(
        !root.path().join("resources/broken").exists(),
        "failed clone must not leave a partial directory"
    );
}

#[tokio::test]
async fn concurrent_loads_of_different_resources_succeed() {
    let root = tempfile::tempdir().unwrap();
    let up_a = root.path().join("up-a");
    let up_b = root.path().join("up-b");
    init_upstream(&up_a, &[("a.md", "a")]);
    init_upstream(&up_b, &[("b.md", "b")]);

    let file = ConfigFile {
        schema: None,
        resources: vec![
            ResourceDefinition::Git(GitResource {
                name: "alpha".to_string(),
                url: format!("file://{}", up_a.display()),
                branch: "main".to_string(),
                search_path: None,
                special_notes: None,
            }),
            ResourceDefinition::Git(GitResource {
                name: "beta".to_string(),
                url: format!("file://{}", up_b.display()),
                branch: "main".to_string(),
                search_path: None,
                special_notes: None,
            }),
        ],
        model: "test-model".to_string(),
        provider: "openrouter".to_string(),
    };
    let config = Arc::new(ConfigStore::new(root.path().join("c.jsonc"), file));
    let store = Arc::new(ResourceStore::new(root.path().join("resources"), config));

    let (a, b) = tokio::join!(store.load("alpha", true), store.load("beta", true));
    assert!(a.unwrap().absolute_path().join("a.md").exists());
    assert!(b.unwrap().absolute_path().join("b.md").exists());
}
