//! Curated integration documentation and example files.
//!
//! Auth (Clerk) and payment (Stripe) prompt sections embed a documentation
//! summary plus a fixed set of example files loaded from local disk. Loads
//! are cached: the composition rules are deterministic and idempotent, so
//! one read per provider per process is enough.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct IntegrationExample {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct IntegrationPack {
    pub provider: String,
    pub docs: String,
    pub examples: Vec<IntegrationExample>,
}

/// Example files, in prompt order, per provider.
fn example_files(provider: &str) -> &'static [&'static str] {
    match provider {
        "clerk" => &[
            "middleware.js",
            "protected-endpoint.js",
            "current-user.js",
            "signup-webhook.js",
        ],
        "stripe" => &["create-intent.js", "webhook-handler.js", "create-customer.js"],
        _ => &[],
    }
}

pub struct IntegrationStore {
    dir: PathBuf,
    cache: Mutex<HashMap<String, Arc<IntegrationPack>>>,
}

impl IntegrationStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn load(&self, provider: &str) -> Result<Arc<IntegrationPack>> {
        if let Some(pack) = self.cache.lock().unwrap().get(provider) {
            return Ok(pack.clone());
        }

        let pack = Arc::new(read_pack(&self.dir, provider)?);
        self.cache
            .lock()
            .unwrap()
            .insert(provider.to_string(), pack.clone());
        Ok(pack)
    }
}

fn read_pack(dir: &Path, provider: &str) -> Result<IntegrationPack> {
    let base = dir.join(provider);
    let docs_path = base.join("docs.md");
    let docs = std::fs::read_to_string(&docs_path)
        .with_context(|| format!("Failed to read {}", docs_path.display()))?;

    let mut examples = Vec::new();
    for name in example_files(provider) {
        let path = base.join("examples").join(name);
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        examples.push(IntegrationExample {
            path: format!("examples/{}/{}", provider, name),
            content,
        });
    }

    Ok(IntegrationPack {
        provider: provider.to_string(),
        docs,
        examples,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn seed_provider(dir: &Path, provider: &str) {
        let base = dir.join(provider);
        fs::create_dir_all(base.join("examples")).unwrap();
        fs::write(base.join("docs.md"), format!("{} docs", provider)).unwrap();
        for name in example_files(provider) {
            fs::write(base.join("examples").join(name), format!("// {}", name)).unwrap();
        }
    }

    #[test]
    fn test_load_clerk_pack() {
        let dir = tempfile::tempdir().unwrap();
        seed_provider(dir.path(), "clerk");

        let store = IntegrationStore::new(dir.path());
        let pack = store.load("clerk").unwrap();
        assert_eq!(pack.docs, "clerk docs");
        assert_eq!(pack.examples.len(), 4);
        assert_eq!(pack.examples[0].path, "examples/clerk/middleware.js");
    }

    #[test]
    fn test_load_is_cached() {
        let dir = tempfile::tempdir().unwrap();
        seed_provider(dir.path(), "stripe");

        let store = IntegrationStore::new(dir.path());
        let first = store.load("stripe").unwrap();
        // Remove the backing files: the second load must come from cache.
        fs::remove_dir_all(dir.path().join("stripe")).unwrap();
        let second = store.load("stripe").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_load_missing_provider_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = IntegrationStore::new(dir.path());
        assert!(store.load("clerk").is_err());
    }
}
