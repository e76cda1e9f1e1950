//! Novel persistence contract and its storage-backed implementation.
//!
//! Records are namespaced per owner: anonymous sessions write to the local
//! namespace, signed-in readers to a per-account namespace. Each namespace
//! holds one collection document mapping novel id to the full novel record.
//! The local collection also carries the id of the locally active novel and
//! any choice held back by the paywall, both of which belong to the device
//! rather than an account.

use crate::core::error::{StoryError, StoryResult};
use crate::core::io::Storage;
use crate::core::model::Novel;
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Whose records a repository call addresses.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OwnerKey {
    Local,
    Account(String),
}

impl OwnerKey {
    pub fn from_user(user_id: Option<&str>) -> Self {
        match user_id {
            Some(id) => OwnerKey::Account(id.to_string()),
            None => OwnerKey::Local,
        }
    }

    fn namespace(&self) -> String {
        match self {
            OwnerKey::Local => "local".to_string(),
            // Unpadded base64url is path safe and distinct for distinct ids.
            OwnerKey::Account(id) => format!("users/{}", URL_SAFE_NO_PAD.encode(id.as_bytes())),
        }
    }
}

/// A choice the paywall held back, kept until the reader subscribes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeldChoice {
    pub novel_id: String,
    pub choice: String,
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[async_trait]
pub trait NovelRepository: Send + Sync {
    /// Stores the full novel record, replacing any previous version.
    async fn save(&self, owner: &OwnerKey, novel: &Novel) -> StoryResult<()>;

    /// All novels of `owner`, most recently saved first.
    async fn list_all(&self, owner: &OwnerKey) -> StoryResult<Vec<Novel>>;

    async fn delete_one(&self, owner: &OwnerKey, novel_id: &str) -> StoryResult<()>;

    /// The active novel of the anonymous session, if any.
    async fn load_local_active(&self) -> StoryResult<Option<Novel>>;

    async fn set_local_active(&self, novel_id: Option<&str>) -> StoryResult<()>;

    async fn load_held_choice(&self) -> StoryResult<Option<HeldChoice>>;

    /// Replaces the held choice; `None` clears it.
    async fn set_held_choice(&self, held: Option<&HeldChoice>) -> StoryResult<()>;
}

#[derive(Serialize, Deserialize, Default, Debug)]
#[serde(rename_all = "camelCase")]
struct NovelCollection {
    #[serde(default)]
    novels: HashMap<String, Novel>,
    #[serde(default)]
    active_novel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    held_choice: Option<HeldChoice>,
}

pub struct StorageNovelRepository {
    root: String,
    storage: Arc<dyn Storage>,
}

impl StorageNovelRepository {
    pub fn new(root: impl Into<String>, storage: Arc<dyn Storage>) -> Self {
        Self {
            root: root.into(),
            storage,
        }
    }

    fn collection_path(&self, owner: &OwnerKey) -> String {
        Path::new(&self.root)
            .join(owner.namespace())
            .join("collection.json")
            .to_string_lossy()
            .to_string()
    }

    async fn load_collection(&self, owner: &OwnerKey) -> Result<NovelCollection> {
        let path = self.collection_path(owner);
        if !self.storage.exists(&path).await? {
            return Ok(NovelCollection::default());
        }
        let bytes = self.storage.read(&path).await?;
        let content = String::from_utf8(bytes)?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse novel collection at {}", path))
    }

    async fn save_collection(&self, owner: &OwnerKey, collection: &NovelCollection) -> Result<()> {
        let path = self.collection_path(owner);
        let content = serde_json::to_string_pretty(collection)?;
        self.storage.write(&path, content.as_bytes()).await?;
        Ok(())
    }
}

#[async_trait]
impl NovelRepository for StorageNovelRepository {
    async fn save(&self, owner: &OwnerKey, novel: &Novel) -> StoryResult<()> {
        let result: Result<()> = async {
            let mut collection = self.load_collection(owner).await?;
            let mut record = novel.clone();
            // Strictly increasing stamps keep the listing order stable even
            // when two saves land within the same millisecond.
            let newest = collection
                .novels
                .values()
                .filter_map(|n| n.last_saved)
                .max()
                .unwrap_or(0);
            record.last_saved = Some(now_millis().max(newest + 1));
            collection.novels.insert(record.id.clone(), record);
            self.save_collection(owner, &collection).await
        }
        .await;
        result
            .with_context(|| format!("Failed to save novel {}", novel.id))
            .map_err(StoryError::persistence)?;
        debug!("Saved novel {} for {:?}", novel.id, owner);
        Ok(())
    }

    async fn list_all(&self, owner: &OwnerKey) -> StoryResult<Vec<Novel>> {
        let collection = self
            .load_collection(owner)
            .await
            .context("Failed to load saved novels")
            .map_err(StoryError::persistence)?;
        let mut novels: Vec<Novel> = collection.novels.into_values().collect();
        novels.sort_by(|a, b| {
            b.last_saved
                .cmp(&a.last_saved)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(novels)
    }

    async fn delete_one(&self, owner: &OwnerKey, novel_id: &str) -> StoryResult<()> {
        let result: Result<()> = async {
            let mut collection = self.load_collection(owner).await?;
            if collection.novels.remove(novel_id).is_none() {
                return Ok(());
            }
            if collection.active_novel_id.as_deref() == Some(novel_id) {
                collection.active_novel_id = None;
            }
            self.save_collection(owner, &collection).await
        }
        .await;
        result
            .with_context(|| format!("Failed to delete novel {}", novel_id))
            .map_err(StoryError::persistence)?;
        info!("Deleted novel {} for {:?}", novel_id, owner);
        Ok(())
    }

    async fn load_local_active(&self) -> StoryResult<Option<Novel>> {
        let mut collection = self
            .load_collection(&OwnerKey::Local)
            .await
            .context("Failed to load local novels")
            .map_err(StoryError::persistence)?;
        Ok(collection
            .active_novel_id
            .take()
            .and_then(|id| collection.novels.remove(&id)))
    }

    async fn set_local_active(&self, novel_id: Option<&str>) -> StoryResult<()> {
        let result: Result<()> = async {
            let mut collection = self.load_collection(&OwnerKey::Local).await?;
            collection.active_novel_id = novel_id.map(str::to_string);
            self.save_collection(&OwnerKey::Local, &collection).await
        }
        .await;
        result
            .context("Failed to update the active novel")
            .map_err(StoryError::persistence)
    }

    async fn load_held_choice(&self) -> StoryResult<Option<HeldChoice>> {
        let collection = self
            .load_collection(&OwnerKey::Local)
            .await
            .context("Failed to load the held choice")
            .map_err(StoryError::persistence)?;
        Ok(collection.held_choice)
    }

    async fn set_held_choice(&self, held: Option<&HeldChoice>) -> StoryResult<()> {
        let result: Result<()> = async {
            let mut collection = self.load_collection(&OwnerKey::Local).await?;
            collection.held_choice = held.cloned();
            self.save_collection(&OwnerKey::Local, &collection).await
        }
        .await;
        result
            .context("Failed to store the held choice")
            .map_err(StoryError::persistence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::io::{MemoryStorage, NativeStorage};
    use crate::core::model::{AdvancedOptions, ChapterContent};
    use crate::core::stage::NarrativeStage;

    fn novel(id: &str) -> Novel {
        Novel::from_opening(
            id,
            "A quiet village",
            AdvancedOptions::default(),
            ChapterContent {
                text: "The bells rang.".into(),
                choices: vec!["Listen".into()],
                new_themes: vec![],
                new_characters: vec![],
                is_ending: false,
                narrative_stage: NarrativeStage::Introduction,
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_list_orders_by_most_recent_save() -> StoryResult<()> {
        let repo = StorageNovelRepository::new("data", Arc::new(MemoryStorage::new()));
        let owner = OwnerKey::Account("reader".into());

        repo.save(&owner, &novel("1")).await?;
        repo.save(&owner, &novel("2")).await?;
        repo.save(&owner, &novel("1")).await?;

        let ids: Vec<String> = repo
            .list_all(&owner)
            .await?
            .into_iter()
            .map(|n| n.id)
            .collect();
        assert_eq!(ids, vec!["1", "2"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_owners_are_isolated() -> StoryResult<()> {
        let repo = StorageNovelRepository::new("data", Arc::new(MemoryStorage::new()));
        repo.save(&OwnerKey::Account("a".into()), &novel("1")).await?;

        assert!(repo.list_all(&OwnerKey::Account("b".into())).await?.is_empty());
        assert!(repo.list_all(&OwnerKey::Local).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_similar_account_ids_stay_separate() -> StoryResult<()> {
        let repo = StorageNovelRepository::new("data", Arc::new(MemoryStorage::new()));
        let alice = OwnerKey::Account("alice@example.com".into());
        let lookalike = OwnerKey::Account("alice_example_com".into());
        assert_ne!(alice.namespace(), lookalike.namespace());

        repo.save(&alice, &novel("1")).await?;
        assert!(repo.list_all(&lookalike).await?.is_empty());
        repo.save(&lookalike, &novel("2")).await?;

        let ids: Vec<String> = repo.list_all(&alice).await?.into_iter().map(|n| n.id).collect();
        assert_eq!(ids, vec!["1"]);
        Ok(())
    }

    #[test]
    fn test_account_namespace_is_path_safe() {
        let ns = OwnerKey::Account("../../etc/passwd".into()).namespace();
        let encoded = ns.strip_prefix("users/").unwrap();
        assert!(encoded
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert_eq!(OwnerKey::Local.namespace(), "local");
    }

    #[tokio::test]
    async fn test_held_choice_lives_beside_local_novels() -> StoryResult<()> {
        let repo = StorageNovelRepository::new("data", Arc::new(MemoryStorage::new()));
        assert_eq!(repo.load_held_choice().await?, None);

        repo.save(&OwnerKey::Local, &novel("7")).await?;
        repo.set_local_active(Some("7")).await?;
        let held = HeldChoice {
            novel_id: "7".into(),
            choice: "Listen".into(),
        };
        repo.set_held_choice(Some(&held)).await?;

        assert_eq!(repo.load_held_choice().await?, Some(held));
        assert_eq!(repo.load_local_active().await?.unwrap().id, "7");

        repo.set_held_choice(None).await?;
        assert_eq!(repo.load_held_choice().await?, None);
        assert_eq!(repo.list_all(&OwnerKey::Local).await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_local_active_cleared_on_delete() -> StoryResult<()> {
        let repo = StorageNovelRepository::new("data", Arc::new(MemoryStorage::new()));
        assert_eq!(repo.load_local_active().await?, None);

        repo.save(&OwnerKey::Local, &novel("7")).await?;
        repo.set_local_active(Some("7")).await?;
        let active = repo.load_local_active().await?.unwrap();
        assert_eq!(active.id, "7");
        assert!(active.last_saved.is_some());

        repo.delete_one(&OwnerKey::Local, "7").await?;
        assert_eq!(repo.load_local_active().await?, None);
        assert!(repo.list_all(&OwnerKey::Local).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_native_backend_persists_full_record() -> StoryResult<()> {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_string_lossy().to_string();
        let repo = StorageNovelRepository::new(root.clone(), Arc::new(NativeStorage::new()));

        let mut original = novel("42");
        original.chapters.record_choice("Listen").unwrap();
        repo.save(&OwnerKey::Local, &original).await?;

        let reopened = StorageNovelRepository::new(root, Arc::new(NativeStorage::new()));
        let loaded = reopened.list_all(&OwnerKey::Local).await?;
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].chapters, original.chapters);
        assert_eq!(loaded[0].concept, original.concept);
        Ok(())
    }

    #[tokio::test]
    async fn test_corrupt_collection_is_persistence_error() {
        let storage = Arc::new(MemoryStorage::new());
        storage
            .write("data/local/collection.json", b"not json")
            .await
            .unwrap();
        let repo = StorageNovelRepository::new("data", storage);
        let err = repo.list_all(&OwnerKey::Local).await.unwrap_err();
        assert!(matches!(err, StoryError::Persistence(_)));
    }
}
