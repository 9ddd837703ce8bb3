//! # Content Repository Registry
//!
//! A process usually hosts several content repositories (one per site, for
//! example). The registry maps ids to running [`ContentRepositoryHandle`]s.
//! It is an ordinary value: build it at startup and pass it to whoever needs
//! it.

use std::collections::BTreeMap;
use std::path::Path;

use tracing::info;

use crate::api::ContentRepositoryHandle;
use crate::config::RepositoryConfig;
use crate::error::{Error, Result};
use crate::types::ContentRepositoryId;

/// Running content repositories by id.
#[derive(Debug, Default)]
pub struct ContentRepositoryRegistry {
    repositories: BTreeMap<ContentRepositoryId, ContentRepositoryHandle>,
}

impl ContentRepositoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a running repository.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] if the id is already registered.
    pub fn register(&mut self, handle: ContentRepositoryHandle) -> Result<()> {
        if self.repositories.contains_key(handle.id()) {
            return Err(Error::Config(format!(
                "content repository '{}' is already registered",
                handle.id()
            )));
        }
        info!(content_repository_id = %handle.id(), "content repository registered");
        self.repositories.insert(handle.id().clone(), handle);
        Ok(())
    }

    /// Opens a file-backed repository and registers it.
    pub async fn open(&mut self, path: impl AsRef<Path>, config: RepositoryConfig) -> Result<ContentRepositoryHandle> {
        if self.repositories.contains_key(&config.content_repository_id) {
            return Err(Error::Config(format!(
                "content repository '{}' is already registered",
                config.content_repository_id
            )));
        }
        let handle = ContentRepositoryHandle::open(path, config).await?;
        self.register(handle.clone())?;
        Ok(handle)
    }

    /// # Errors
    ///
    /// [`Error::ContentRepositoryNotFound`] for an unknown id.
    pub fn get(&self, id: &ContentRepositoryId) -> Result<&ContentRepositoryHandle> {
        self.repositories
            .get(id)
            .ok_or_else(|| Error::ContentRepositoryNotFound(id.to_string()))
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> impl Iterator<Item = &ContentRepositoryId> {
        self.repositories.keys()
    }

    /// Stops every repository thread.
    pub async fn shutdown_all(self) {
        for (id, handle) in self.repositories {
            handle.shutdown().await;
            info!(content_repository_id = %id, "content repository shut down");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::ContentRepository;

    fn handle(id: &str) -> ContentRepositoryHandle {
        let config = RepositoryConfig::new(ContentRepositoryId::new(id).unwrap());
        ContentRepositoryHandle::spawn(ContentRepository::open_in_memory(config).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_register_and_get() {
        let mut registry = ContentRepositoryRegistry::new();
        registry.register(handle("site_b")).unwrap();
        registry.register(handle("site_a")).unwrap();

        let ids: Vec<&str> = registry.ids().map(|id| id.as_str()).collect();
        assert_eq!(ids, vec!["site_a", "site_b"]);
        assert_eq!(
            registry.get(&ContentRepositoryId::new("site_a").unwrap()).unwrap().id().as_str(),
            "site_a"
        );
        assert!(matches!(
            registry.get(&ContentRepositoryId::new("missing").unwrap()),
            Err(Error::ContentRepositoryNotFound(_))
        ));

        registry.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_duplicate_registration_is_rejected() {
        let mut registry = ContentRepositoryRegistry::new();
        registry.register(handle("default")).unwrap();

        let duplicate = handle("default");
        assert!(matches!(registry.register(duplicate.clone()), Err(Error::Config(_))));
        duplicate.shutdown().await;
        registry.shutdown_all().await;
    }
}
