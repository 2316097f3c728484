//! Collection assembler: a per-request directory of symlinks into the
//! resource cache, plus the generated agent instructions for its contents.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::Instrument;

use crate::error::BtcaError;
use crate::resources::{FsResource, ResourceLoader};

/// A materialized collection — the sandbox root for one request.
#[derive(Debug, Clone)]
pub struct Collection {
    pub key: String,
    pub path: PathBuf,
    pub agent_instructions: String,
    pub resources: Vec<String>,
}

pub struct CollectionAssembler {
    collections_dir: PathBuf,
    store: Arc<dyn ResourceLoader>,
}

impl CollectionAssembler {
    pub fn new(collections_dir: PathBuf, store: Arc<dyn ResourceLoader>) -> Self {
        Self {
            collections_dir,
            store,
        }
    }

    pub fn collections_dir(&self) -> &Path {
        &self.collections_dir
    }

    /// Materialize the named resources and link them into
    /// `<collectionsDir>/<key>`. Pre-existing links are replaced, so a stale
    /// collection from an earlier config is rebuilt on every load.
    pub async fn load(&self, resource_names: &[String], quiet: bool) -> Result<Collection, BtcaError> {
        let names = dedupe_sorted(resource_names);
        if names.is_empty() {
            return Err(BtcaError::Collection(
                "no resources to build a collection from".to_string(),
            ));
        }

        let key = collection_key(&names);
        let span = tracing::info_span!("collection_load", key = %key);
        self.load_sorted(names, key, quiet).instrument(span).await
    }

    async fn load_sorted(
        &self,
        names: Vec<String>,
        key: String,
        quiet: bool,
    ) -> Result<Collection, BtcaError> {
        let collection_path = self.collections_dir.join(&key);
        tokio::fs::create_dir_all(&collection_path)
            .await
            .map_err(|e| BtcaError::Collection(format!("cannot create collection dir: {e}")))?;

        let mut loaded: Vec<FsResource> = Vec::with_capacity(names.len());
        for name in &names {
            loaded.push(self.store.load(name, quiet).await?);
        }

        for resource in &loaded {
            let link = collection_path.join(&resource.name);
            remove_entry(&link).await?;
            symlink_dir(resource.absolute_path(), &link).await.map_err(|e| {
                BtcaError::Collection(format!("cannot link resource {}: {e}", resource.name))
            })?;
        }

        let agent_instructions = build_instructions(&loaded);

        Ok(Collection {
            key,
            path: collection_path,
            agent_instructions,
            resources: names,
        })
    }
}

/// Stable key for a set of names: sorted, deduplicated, `+`-joined.
/// Invariant under permutation and duplication of the input.
pub fn collection_key(names: &[String]) -> String {
    dedupe_sorted(names).join("+")
}

fn dedupe_sorted(names: &[String]) -> Vec<String> {
    let mut sorted: Vec<String> = names.to_vec();
    sorted.sort();
    sorted.dedup();
    sorted
}

/// One instruction block per resource, blank-line separated.
fn build_instructions(resources: &[FsResource]) -> String {
    resources
        .iter()
        .map(|r| {
            let mut block = format!(
                "## Resource: {name}\nDocumentation and source for {name} is available under the directory below.\nPath: ./{name}",
                name = r.name
            );
            if let Some(ref sub) = r.repo_sub_path {
                block.push_str(&format!("\nFocus: ./{}/{sub}", r.name));
            }
            if let Some(ref notes) = r.special_instructions {
                block.push_str(&format!("\nNotes: {notes}"));
            }
            block
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

async fn remove_entry(path: &Path) -> Result<(), BtcaError> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path)
            .await
            .map_err(|e| BtcaError::Collection(format!("cannot clear {}: {e}", path.display()))),
        Ok(_) => tokio::fs::remove_file(path)
            .await
            .map_err(|e| BtcaError::Collection(format!("cannot clear {}: {e}", path.display()))),
        Err(_) => Ok(()),
    }
}

#[cfg(unix)]
async fn symlink_dir(target: &Path, link: &Path) -> std::io::Result<()> {
    tokio::fs::symlink(target, link).await
}

#[cfg(windows)]
async fn symlink_dir(target: &Path, link: &Path) -> std::io::Result<()> {
    tokio::fs::symlink_dir(target, link).await
}
