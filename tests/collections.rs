//! Collection assembly: symlink forest shape, key determinism, generated
//! instructions.

mod common;

use std::sync::Arc;

use common::FakeLoader;

use btca_server::collections::{CollectionAssembler, collection_key};
use btca_server::error::BtcaError;

fn setup() -> (tempfile::TempDir, Arc<FakeLoader>, CollectionAssembler) {
    let root = tempfile::tempdir().unwrap();
    let loader = Arc::new(FakeLoader {
        root: root.path().join("resources"),
    });
    let assembler = CollectionAssembler::new(
        root.path().join("collections"),
        Arc::clone(&loader) as Arc<dyn btca_server::resources::ResourceLoader>,
    );
    (root, loader, assembler)
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn collection_contains_one_symlink_per_resource() {
    let (_root, loader, assembler) = setup();
    loader.seed("svelte", &[("README.md", "svelte docs")]);
    loader.seed("astro", &[("guide.md", "astro docs")]);

    let collection = assembler
        .load(&names(&["svelte", "astro", "svelte"]), true)
        .await
        .unwrap();

    assert_eq!(collection.key, "astro+svelte");
    assert_eq!(collection.resources, names(&["astro", "svelte"]));

    let mut entries: Vec<String> = std::fs::read_dir(&collection.path)
        .unwrap()
        .flatten()
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    entries.sort();
    assert_eq!(entries, names(&["astro", "svelte"]));

    for entry in &entries {
        let link = collection.path.join(entry);
        let meta = std::fs::symlink_metadata(&link).unwrap();
        assert!(meta.file_type().is_symlink(), "{entry} should be a symlink");
        let target = std::fs::canonicalize(&link).unwrap();
        assert!(target.is_dir());
    }

    assert_eq!(
        std::fs::read_to_string(collection.path.join("svelte/README.md")).unwrap(),
        "svelte docs"
    );
}

#[tokio::test]
async fn reload_replaces_existing_links() {
    let (_root, loader, assembler) = setup();
    loader.seed("docs", &[("a.md", "v1")]);

    let first = assembler.load(&names(&["docs"]), true).await.unwrap();
    let second = assembler.load(&names(&["docs"]), true).await.unwrap();
    assert_eq!(first.path, second.path);
    assert_eq!(
        std::fs::read_to_string(second.path.join("docs/a.md")).unwrap(),
        "v1"
    );
}

#[tokio::test]
async fn empty_resource_set_is_rejected() {
    let (_root, _loader, assembler) = setup();
    let err = assembler.load(&[], true).await.unwrap_err();
    assert!(matches!(err, BtcaError::Collection(_)));
    assert_eq!(err.tag(), "CollectionError");
}

#[tokio::test]
async fn missing_resource_aborts_the_load() {
    let (_root, loader, assembler) = setup();
    loader.seed("present", &[("a.md", "x")]);

    let err = assembler
        .load(&names(&["present", "absent"]), true)
        .await
        .unwrap_err();
    assert!(matches!(err, BtcaError::ResourceNotFound(_)));
}

#[tokio::test]
async fn instructions_name_every_resource() {
    let (_root, loader, assembler) = setup();
    loader.seed("svelte", &[("README.md", "x")]);
    loader.seed("astro", &[("README.md", "x")]);

    let collection = assembler
        .load(&names(&["svelte", "astro"]), true)
        .await
        .unwrap();

    let blocks: Vec<&str> = collection.agent_instructions.split("\n\n").collect();
    assert_eq!(blocks.len(), 2);
    assert!(blocks[0].starts_with("## Resource: astro"));
    assert!(blocks[0].contains("Path: ./astro"));
    assert!(blocks[1].starts_with("## Resource: svelte"));
    assert!(blocks[1].contains("Path: ./svelte"));
}

#[test]
fn key_determinism_under_permutation_and_duplication() {
    let a = collection_key(&names(&["x", "y", "z"]));
    let b = collection_key(&names(&["z", "y", "x", "x", "y"]));
    assert_eq!(a, b);
    assert_eq!(a, "x+y+z");
}
