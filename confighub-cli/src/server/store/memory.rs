use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use confighub_lib::{
    AccessKey, Document, DocumentKey, Error, FileType, GrayRule, NewRelease, NewVersion, Release,
    ReleaseStatus, ReleaseType, Result, Version,
};
use tokio::sync::RwLock;

use super::{gray_conflict, new_document, new_release, new_version, wrong_status, ConfigStore};

#[derive(Default)]
struct Inner {
    next_document_id: u64,
    next_release_id: u64,
    documents: HashMap<u64, Document>,
    by_key: HashMap<DocumentKey, u64>,
    /// Index `n - 1` holds version `n`.
    versions: HashMap<u64, Vec<Version>>,
    releases: BTreeMap<u64, Release>,
    active_gray: HashMap<(u64, String), u64>,
    access_keys: HashMap<String, AccessKey>,
}

impl Inner {
    fn insert_release(&mut self, release: NewRelease) -> Result<Release> {
        if !self.documents.contains_key(&release.document_id) {
            return Err(Error::NotFound(format!("document {}", release.document_id)));
        }
        let slot = (release.document_id, release.environment.clone());
        if release.status == ReleaseStatus::Gray && self.active_gray.contains_key(&slot) {
            return Err(gray_conflict(release.document_id, &release.environment));
        }
        self.next_release_id += 1;
        let release = new_release(self.next_release_id, release, Utc::now());
        if release.status == ReleaseStatus::Gray {
            self.active_gray.insert(slot, release.id);
        }
        self.releases.insert(release.id, release.clone());
        Ok(release)
    }
}

/// In-memory store behind a single `RwLock`; every compound write runs
/// under one write guard.
pub struct MemoryStore {
    data: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(Inner::default()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn create_document(
        &self,
        key: &DocumentKey,
        file_type: FileType,
        first: NewVersion,
    ) -> Result<(Document, Version)> {
        let mut data = self.data.write().await;
        if data.by_key.contains_key(key) {
            return Err(Error::Conflict(format!("document {} already exists", key)));
        }
        data.next_document_id += 1;
        let now = Utc::now();
        let document = new_document(data.next_document_id, key, file_type, now);
        let version = new_version(document.id, 1, first, now);

        data.by_key.insert(key.clone(), document.id);
        data.versions.insert(document.id, vec![version.clone()]);
        data.documents.insert(document.id, document.clone());
        Ok((document, version))
    }

    async fn get_document(&self, id: u64) -> Result<Option<Document>> {
        let data = self.data.read().await;
        Ok(data.documents.get(&id).cloned())
    }

    async fn find_document(&self, key: &DocumentKey) -> Result<Option<Document>> {
        let data = self.data.read().await;
        Ok(data
            .by_key
            .get(key)
            .and_then(|id| data.documents.get(id))
            .cloned())
    }

    async fn delete_document(&self, id: u64) -> Result<()> {
        let mut data = self.data.write().await;
        let document = data
            .documents
            .remove(&id)
            .ok_or_else(|| Error::NotFound(format!("document {}", id)))?;
        data.by_key.remove(&document.key);
        data.versions.remove(&id);
        data.releases.retain(|_, r| r.document_id != id);
        data.active_gray.retain(|(doc, _), _| *doc != id);
        Ok(())
    }

    async fn append_version(&self, document_id: u64, version: NewVersion) -> Result<Version> {
        let mut data = self.data.write().await;
        let now = Utc::now();
        let document = data
            .documents
            .get_mut(&document_id)
            .ok_or_else(|| Error::NotFound(format!("document {}", document_id)))?;

        let number = document.current_version + 1;
        document.current_version = number;
        document.updated_at = now;

        let version = new_version(document_id, number, version, now);
        data.versions
            .entry(document_id)
            .or_default()
            .push(version.clone());
        Ok(version)
    }

    async fn get_version(&self, document_id: u64, version: u64) -> Result<Option<Version>> {
        if version == 0 {
            return Ok(None);
        }
        let data = self.data.read().await;
        Ok(data
            .versions
            .get(&document_id)
            .and_then(|history| history.get((version - 1) as usize))
            .cloned())
    }

    async fn list_versions(&self, document_id: u64) -> Result<Vec<Version>> {
        let data = self.data.read().await;
        Ok(data.versions.get(&document_id).cloned().unwrap_or_default())
    }

    async fn insert_release(&self, release: NewRelease) -> Result<Release> {
        let mut data = self.data.write().await;
        data.insert_release(release)
    }

    async fn get_release(&self, id: u64) -> Result<Option<Release>> {
        let data = self.data.read().await;
        Ok(data.releases.get(&id).cloned())
    }

    async fn list_releases(&self, document_id: u64) -> Result<Vec<Release>> {
        let data = self.data.read().await;
        Ok(data
            .releases
            .values()
            .rev()
            .filter(|r| r.document_id == document_id)
            .cloned()
            .collect())
    }

    async fn active_gray(&self, document_id: u64, environment: &str) -> Result<Option<Release>> {
        let data = self.data.read().await;
        Ok(data
            .active_gray
            .get(&(document_id, environment.to_string()))
            .and_then(|id| data.releases.get(id))
            .cloned())
    }

    async fn transition_release(
        &self,
        id: u64,
        from: ReleaseStatus,
        to: ReleaseStatus,
        follow_up: Option<NewRelease>,
    ) -> Result<(Release, Option<Release>)> {
        let mut data = self.data.write().await;
        let release = data
            .releases
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("release {}", id)))?;
        if release.status != from {
            return Err(wrong_status(id, release.status, from));
        }
        release.status = to;
        release.updated_at = Utc::now();
        let updated = release.clone();

        if from == ReleaseStatus::Gray {
            data.active_gray
                .remove(&(updated.document_id, updated.environment.clone()));
        }

        let follow_up = match follow_up {
            Some(next) => Some(data.insert_release(next)?),
            None => None,
        };
        Ok((updated, follow_up))
    }

    async fn update_gray_rule(&self, id: u64, rule: GrayRule) -> Result<Release> {
        let mut data = self.data.write().await;
        let release = data
            .releases
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("release {}", id)))?;
        if release.status != ReleaseStatus::Gray || release.release_type != ReleaseType::Gray {
            return Err(wrong_status(id, release.status, ReleaseStatus::Gray));
        }
        release.gray_rule = Some(rule);
        release.updated_at = Utc::now();
        Ok(release.clone())
    }

    async fn put_access_key(&self, key: AccessKey) -> Result<()> {
        let mut data = self.data.write().await;
        data.access_keys.insert(key.access_key.clone(), key);
        Ok(())
    }

    async fn get_access_key(&self, access_key: &str) -> Result<Option<AccessKey>> {
        let data = self.data.read().await;
        Ok(data.access_keys.get(access_key).cloned())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
