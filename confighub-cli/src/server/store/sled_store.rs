use async_trait::async_trait;
use chrono::Utc;
use confighub_lib::{
    AccessKey, Document, DocumentKey, Error, FileType, GrayRule, NewRelease, NewVersion, Release,
    ReleaseStatus, ReleaseType, Result, Version,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::{
    abort, ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
    TransactionResult, TransactionalTree,
};

use tracing::debug;

use super::{gray_conflict, new_document, new_release, new_version, wrong_status, ConfigStore};

/// Persistent store backed by sled. Every compound write is a single sled
/// transaction over the default tree.
///
/// Key layout:
///
/// ```text
/// doc:{id}                 -> Document
/// dockey:{p}\0{ns}\0{env}\0{name} -> id
/// ver:{doc}:{n}            -> Version
/// rel:{id}                 -> Release
/// relidx:{doc}:{id}        -> ()
/// gray:{doc}:{env}         -> id of the active gray release
/// docrev:{doc}             -> write counter, bumped by appends and releases
/// key:{access_key}         -> AccessKey
/// ```
pub struct SledStore {
    db: sled::Db,
}

fn storage(e: sled::Error) -> Error {
    Error::Internal(format!("sled: {}", e))
}

fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(Error::internal)
}

fn from_json<T: DeserializeOwned>(raw: &[u8]) -> Result<T> {
    serde_json::from_slice(raw).map_err(Error::internal)
}

fn tx_result<T>(result: TransactionResult<T, Error>) -> Result<T> {
    match result {
        Ok(value) => Ok(value),
        Err(TransactionError::Abort(e)) => Err(e),
        Err(TransactionError::Storage(e)) => Err(storage(e)),
    }
}

/// Rounds of scan-then-delete before giving up on a busy document.
const DELETE_ATTEMPTS: usize = 8;

fn id_bytes(id: u64) -> [u8; 8] {
    id.to_be_bytes()
}

fn id_from(raw: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = raw
        .try_into()
        .map_err(|_| Error::Internal("malformed id entry".into()))?;
    Ok(u64::from_be_bytes(bytes))
}

impl SledStore {
    pub fn new(db: sled::Db) -> Self {
        Self { db }
    }

    /// Open a sled database at the given directory path.
    pub fn open(data_dir: &str) -> Result<Self> {
        let db = sled::open(data_dir).map_err(storage)?;
        Ok(Self::new(db))
    }

    fn next_id(&self) -> Result<u64> {
        self.db.generate_id().map(|id| id + 1).map_err(storage)
    }

    async fn flush(&self) -> Result<()> {
        self.db.flush_async().await.map(|_| ()).map_err(storage)
    }

    fn doc_key(id: u64) -> String {
        format!("doc:{:020}", id)
    }

    fn index_key(key: &DocumentKey) -> String {
        format!(
            "dockey:{}\u{0}{}\u{0}{}\u{0}{}",
            key.project, key.namespace, key.environment, key.name
        )
    }

    fn versions_prefix(document_id: u64) -> String {
        format!("ver:{:020}:", document_id)
    }

    fn version_key(document_id: u64, version: u64) -> String {
        format!("ver:{:020}:{:020}", document_id, version)
    }

    fn release_key(id: u64) -> String {
        format!("rel:{:020}", id)
    }

    fn release_index_prefix(document_id: u64) -> String {
        format!("relidx:{:020}:", document_id)
    }

    fn release_index_key(document_id: u64, id: u64) -> String {
        format!("relidx:{:020}:{:020}", document_id, id)
    }

    fn gray_key(document_id: u64, environment: &str) -> String {
        format!("gray:{:020}:{}", document_id, environment)
    }

    fn revision_key(document_id: u64) -> String {
        format!("docrev:{:020}", document_id)
    }

    fn access_key_key(access_key: &str) -> String {
        format!("key:{}", access_key)
    }

    fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.db.get(key).map_err(storage)? {
            Some(raw) => from_json(&raw).map(Some),
            None => Ok(None),
        }
    }

    fn scan_keys(&self, prefix: &str) -> Result<Vec<sled::IVec>> {
        self.db
            .scan_prefix(prefix)
            .keys()
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(storage)
    }

    fn revision(&self, document_id: u64) -> Result<u64> {
        match self.db.get(Self::revision_key(document_id)).map_err(storage)? {
            Some(raw) => id_from(&raw),
            None => Ok(0),
        }
    }

    /// Every row a document owns besides its own record and index entry.
    fn owned_keys(&self, document_id: u64) -> Result<Vec<sled::IVec>> {
        let mut owned = self.scan_keys(&Self::versions_prefix(document_id))?;
        for index in self.scan_keys(&Self::release_index_prefix(document_id))? {
            let release_id = std::str::from_utf8(&index)
                .ok()
                .and_then(|k| k.rsplit(':').next())
                .and_then(|n| n.parse::<u64>().ok())
                .ok_or_else(|| Error::Internal("malformed release index key".into()))?;
            owned.push(sled::IVec::from(Self::release_key(release_id).as_bytes()));
            owned.push(index);
        }
        owned.extend(self.scan_keys(&format!("gray:{:020}:", document_id))?);
        owned.push(sled::IVec::from(Self::revision_key(document_id).as_bytes()));
        Ok(owned)
    }
}

fn tx_revision(
    tx: &TransactionalTree,
    document_id: u64,
) -> ConflictableTransactionResult<u64, Error> {
    match tx.get(SledStore::revision_key(document_id).as_bytes())? {
        Some(raw) => id_from(&raw).map_err(ConflictableTransactionError::Abort),
        None => Ok(0),
    }
}

/// Record a write that adds rows under `document_id`, so a concurrent
/// delete notices its scan went stale.
fn tx_bump_revision(
    tx: &TransactionalTree,
    document_id: u64,
) -> ConflictableTransactionResult<(), Error> {
    let next = tx_revision(tx, document_id)? + 1;
    tx.insert(SledStore::revision_key(document_id).as_bytes(), &id_bytes(next)[..])?;
    Ok(())
}

fn tx_get_json<T: DeserializeOwned>(
    tx: &TransactionalTree,
    key: &str,
) -> ConflictableTransactionResult<Option<T>, Error> {
    match tx.get(key.as_bytes())? {
        Some(raw) => from_json(&raw)
            .map(Some)
            .map_err(ConflictableTransactionError::Abort),
        None => Ok(None),
    }
}

fn tx_put_json<T: Serialize>(
    tx: &TransactionalTree,
    key: &str,
    value: &T,
) -> ConflictableTransactionResult<(), Error> {
    let raw = to_json(value).map_err(ConflictableTransactionError::Abort)?;
    tx.insert(key.as_bytes(), raw)?;
    Ok(())
}

fn tx_insert_release(
    tx: &TransactionalTree,
    id: u64,
    release: NewRelease,
) -> ConflictableTransactionResult<Release, Error> {
    if tx.get(SledStore::doc_key(release.document_id).as_bytes())?.is_none() {
        return abort(Error::NotFound(format!("document {}", release.document_id)));
    }
    let gray_key = SledStore::gray_key(release.document_id, &release.environment);
    let is_gray = release.status == ReleaseStatus::Gray;
    if is_gray && tx.get(gray_key.as_bytes())?.is_some() {
        return abort(gray_conflict(release.document_id, &release.environment));
    }

    let stored = new_release(id, release, Utc::now());
    tx_put_json(tx, &SledStore::release_key(id), &stored)?;
    tx.insert(
        SledStore::release_index_key(stored.document_id, id).as_bytes(),
        &[][..],
    )?;
    if is_gray {
        tx.insert(gray_key.as_bytes(), &id_bytes(id)[..])?;
    }
    tx_bump_revision(tx, stored.document_id)?;
    Ok(stored)
}

#[async_trait]
impl ConfigStore for SledStore {
    async fn create_document(
        &self,
        key: &DocumentKey,
        file_type: FileType,
        first: NewVersion,
    ) -> Result<(Document, Version)> {
        let id = self.next_id()?;
        let now = Utc::now();
        let document = new_document(id, key, file_type, now);
        let version = new_version(id, 1, first, now);
        let index_key = Self::index_key(key);

        let result = self.db.transaction(|tx| -> ConflictableTransactionResult<(), Error> {
            if tx.get(index_key.as_bytes())?.is_some() {
                return abort(Error::Conflict(format!("document {} already exists", key)));
            }
            tx.insert(index_key.as_bytes(), &id_bytes(id)[..])?;
            tx_put_json(tx, &Self::doc_key(id), &document)?;
            tx_put_json(tx, &Self::version_key(id, 1), &version)?;
            Ok(())
        });
        tx_result(result)?;
        self.flush().await?;
        Ok((document, version))
    }

    async fn get_document(&self, id: u64) -> Result<Option<Document>> {
        self.get_json(&Self::doc_key(id))
    }

    async fn find_document(&self, key: &DocumentKey) -> Result<Option<Document>> {
        match self.db.get(Self::index_key(key)).map_err(storage)? {
            Some(raw) => self.get_document(id_from(&raw)?).await,
            None => Ok(None),
        }
    }

    async fn delete_document(&self, id: u64) -> Result<()> {
        let doc_key = Self::doc_key(id);
        for _ in 0..DELETE_ATTEMPTS {
            let seen = self.revision(id)?;
            let owned = self.owned_keys(id)?;

            // Commits only if nothing was added since the scan.
            let result = self.db.transaction(|tx| -> ConflictableTransactionResult<bool, Error> {
                let Some(document) = tx_get_json::<Document>(tx, &doc_key)? else {
                    return abort(Error::NotFound(format!("document {}", id)));
                };
                if tx_revision(tx, id)? != seen {
                    return Ok(false);
                }
                tx.remove(Self::index_key(&document.key).as_bytes())?;
                tx.remove(doc_key.as_bytes())?;
                for key in &owned {
                    tx.remove(key.clone())?;
                }
                Ok(true)
            });
            if tx_result(result)? {
                return self.flush().await;
            }
            debug!(document = id, "document changed during delete, rescanning");
        }
        Err(Error::Conflict(format!(
            "document {} is being written concurrently, retry the delete",
            id
        )))
    }

    async fn append_version(&self, document_id: u64, version: NewVersion) -> Result<Version> {
        let doc_key = Self::doc_key(document_id);
        let result = self
            .db
            .transaction(|tx| -> ConflictableTransactionResult<Version, Error> {
                let Some(mut document) = tx_get_json::<Document>(tx, &doc_key)? else {
                    return abort(Error::NotFound(format!("document {}", document_id)));
                };
                let now = Utc::now();
                let number = document.current_version + 1;
                document.current_version = number;
                document.updated_at = now;

                let stored = new_version(document_id, number, version.clone(), now);
                tx_put_json(tx, &Self::version_key(document_id, number), &stored)?;
                tx_put_json(tx, &doc_key, &document)?;
                tx_bump_revision(tx, document_id)?;
                Ok(stored)
            });
        let stored = tx_result(result)?;
        self.flush().await?;
        Ok(stored)
    }

    async fn get_version(&self, document_id: u64, version: u64) -> Result<Option<Version>> {
        self.get_json(&Self::version_key(document_id, version))
    }

    async fn list_versions(&self, document_id: u64) -> Result<Vec<Version>> {
        self.db
            .scan_prefix(Self::versions_prefix(document_id))
            .values()
            .map(|raw| from_json(&raw.map_err(storage)?))
            .collect()
    }

    async fn insert_release(&self, release: NewRelease) -> Result<Release> {
        let id = self.next_id()?;
        let result = self
            .db
            .transaction(|tx| tx_insert_release(tx, id, release.clone()));
        let stored = tx_result(result)?;
        self.flush().await?;
        Ok(stored)
    }

    async fn get_release(&self, id: u64) -> Result<Option<Release>> {
        self.get_json(&Self::release_key(id))
    }

    async fn list_releases(&self, document_id: u64) -> Result<Vec<Release>> {
        let mut releases = Vec::new();
        for index in self.scan_keys(&Self::release_index_prefix(document_id))?.iter().rev() {
            let release_id = std::str::from_utf8(index)
                .ok()
                .and_then(|k| k.rsplit(':').next())
                .and_then(|n| n.parse::<u64>().ok());
            if let Some(release) = match release_id {
                Some(id) => self.get_release(id).await?,
                None => None,
            } {
                releases.push(release);
            }
        }
        Ok(releases)
    }

    async fn active_gray(&self, document_id: u64, environment: &str) -> Result<Option<Release>> {
        match self
            .db
            .get(Self::gray_key(document_id, environment))
            .map_err(storage)?
        {
            Some(raw) => self.get_release(id_from(&raw)?).await,
            None => Ok(None),
        }
    }

    async fn transition_release(
        &self,
        id: u64,
        from: ReleaseStatus,
        to: ReleaseStatus,
        follow_up: Option<NewRelease>,
    ) -> Result<(Release, Option<Release>)> {
        let follow_up_id = match follow_up {
            Some(_) => Some(self.next_id()?),
            None => None,
        };
        let release_key = Self::release_key(id);

        let result = self.db.transaction(
            |tx| -> ConflictableTransactionResult<(Release, Option<Release>), Error> {
                let Some(mut release) = tx_get_json::<Release>(tx, &release_key)? else {
                    return abort(Error::NotFound(format!("release {}", id)));
                };
                if release.status != from {
                    return abort(wrong_status(id, release.status, from));
                }
                release.status = to;
                release.updated_at = Utc::now();
                tx_put_json(tx, &release_key, &release)?;

                if from == ReleaseStatus::Gray {
                    tx.remove(Self::gray_key(release.document_id, &release.environment).as_bytes())?;
                }

                let inserted = match (&follow_up, follow_up_id) {
                    (Some(next), Some(next_id)) => Some(tx_insert_release(tx, next_id, next.clone())?),
                    _ => None,
                };
                Ok((release, inserted))
            },
        );
        let outcome = tx_result(result)?;
        self.flush().await?;
        Ok(outcome)
    }

    async fn update_gray_rule(&self, id: u64, rule: GrayRule) -> Result<Release> {
        let release_key = Self::release_key(id);
        let result = self
            .db
            .transaction(|tx| -> ConflictableTransactionResult<Release, Error> {
                let Some(mut release) = tx_get_json::<Release>(tx, &release_key)? else {
                    return abort(Error::NotFound(format!("release {}", id)));
                };
                if release.status != ReleaseStatus::Gray
                    || release.release_type != ReleaseType::Gray
                {
                    return abort(wrong_status(id, release.status, ReleaseStatus::Gray));
                }
                release.gray_rule = Some(rule.clone());
                release.updated_at = Utc::now();
                tx_put_json(tx, &release_key, &release)?;
                Ok(release)
            });
        let release = tx_result(result)?;
        self.flush().await?;
        Ok(release)
    }

    async fn put_access_key(&self, key: AccessKey) -> Result<()> {
        let raw = to_json(&key)?;
        self.db
            .insert(Self::access_key_key(&key.access_key), raw)
            .map_err(storage)?;
        self.flush().await
    }

    async fn get_access_key(&self, access_key: &str) -> Result<Option<AccessKey>> {
        self.get_json(&Self::access_key_key(access_key))
    }

    async fn ping(&self) -> Result<()> {
        self.db.get("doc:").map(|_| ()).map_err(storage)
    }
}
