//! Collaborator stores behind the gallery.
//!
//! Two opaque stores: blobs (image bytes) and records (metadata).
//! Production runs the filesystem blob store and the sqlite record
//! store; tests use the in-memory pair. The gallery never hands out
//! raw blob locations, only minted URLs.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

// ── Domain types ───────────────────────────────────────────────────

/// Store identifier + object key; never a raw URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobReference {
    pub key: String,
}

impl BlobReference {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Private,
    Public,
}

/// Structured analysis attached to a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    #[serde(default)]
    pub surface_type: String,
    #[serde(default)]
    pub material: String,
    #[serde(default)]
    pub color: String,
    /// `[ymin, xmin, ymax, xmax]`, normalized 0..1000.
    #[serde(default)]
    pub bounding_box: Option<[u32; 4]>,
    /// Faces found (and blurred) in the source image.
    #[serde(default)]
    pub face_count: usize,
}

/// Persisted analysis artifact.
///
/// Invariant: both image references present, or the record is rejected
/// before it ever reaches a store. Counters only move up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GalleryRecord {
    pub id: String,
    pub owner: String,
    pub title: String,
    pub description: String,
    pub before_blob: BlobReference,
    pub after_blob: BlobReference,
    pub thumbnail_blob: BlobReference,
    pub metadata: SnapshotMetadata,
    pub tags: Vec<String>,
    pub visibility: Visibility,
    pub likes: u64,
    pub views: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ── Traits ─────────────────────────────────────────────────────────

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Bytes, content_type: &str) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;
    async fn delete(&self, key: &str) -> Result<()>;
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn put(&self, record: &GalleryRecord) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Option<GalleryRecord>>;
    /// Public records, newest first where the store can order cheaply;
    /// pagination is stable by id either way.
    async fn list_public(&self, limit: usize) -> Result<Vec<GalleryRecord>>;
    /// Returns the new view count. Monotone non-decreasing.
    async fn increment_views(&self, id: &str) -> Result<u64>;
    /// Returns the new like count. Monotone non-decreasing.
    async fn toggle_like(&self, id: &str) -> Result<u64>;
}

/// Reject keys that could escape the store root.
pub fn validate_key(key: &str) -> Result<()> {
    anyhow::ensure!(!key.is_empty(), "empty blob key");
    anyhow::ensure!(
        key.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '_' | '-' | '.')),
        "blob key has invalid characters"
    );
    anyhow::ensure!(
        !key.split('/').any(|part| part == ".." || part.is_empty()),
        "blob key must be a clean relative path"
    );
    Ok(())
}

// ── In-memory blob store ───────────────────────────────────────────

#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Bytes>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, bytes: Bytes, _content_type: &str) -> Result<()> {
        validate_key(key)?;
        self.blobs.write().insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.blobs.read().get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.blobs.write().remove(key);
        Ok(())
    }
}

// ── Filesystem blob store ──────────────────────────────────────────

/// Blobs as files under a root directory, keyed by relative path.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, bytes: Bytes, _content_type: &str) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("create blob directory")?;
        }
        tokio::fs::write(&path, &bytes)
            .await
            .with_context(|| format!("write blob {key}"))
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(Bytes::from(bytes))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("read blob {key}")),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("delete blob {key}")),
        }
    }
}

// ── In-memory record store ─────────────────────────────────────────

#[derive(Default)]
pub struct MemoryRecordStore {
    /// Insertion-ordered; the listing contract allows this.
    records: Mutex<Vec<GalleryRecord>>,
    /// When set, the next `put` fails once (compensation testing).
    fail_next_put: Mutex<bool>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_put(&self) {
        *self.fail_next_put.lock() = true;
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn put(&self, record: &GalleryRecord) -> Result<()> {
        if std::mem::take(&mut *self.fail_next_put.lock()) {
            anyhow::bail!("record store write refused");
        }
        let mut records = self.records.lock();
        if let Some(existing) = records.iter_mut().find(|r| r.id == record.id) {
            *existing = record.clone();
        } else {
            records.push(record.clone());
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<GalleryRecord>> {
        Ok(self.records.lock().iter().find(|r| r.id == id).cloned())
    }

    async fn list_public(&self, limit: usize) -> Result<Vec<GalleryRecord>> {
        Ok(self
            .records
            .lock()
            .iter()
            .filter(|r| r.visibility == Visibility::Public)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn increment_views(&self, id: &str) -> Result<u64> {
        let mut records = self.records.lock();
        let record = records
            .iter_mut()
            .find(|r| r.id == id)
            .with_context(|| format!("no record {id}"))?;
        record.views += 1;
        record.updated_at = Utc::now();
        Ok(record.views)
    }

    async fn toggle_like(&self, id: &str) -> Result<u64> {
        let mut records = self.records.lock();
        let record = records
            .iter_mut()
            .find(|r| r.id == id)
            .with_context(|| format!("no record {id}"))?;
        record.likes += 1;
        record.updated_at = Utc::now();
        Ok(record.likes)
    }
}

// ── Sqlite record store ────────────────────────────────────────────

/// Record store on sqlite. Metadata and tags are stored as JSON text;
/// listing orders newest-first with id as the stable tiebreaker.
pub struct SqliteRecordStore {
    conn: Mutex<Connection>,
}

impl SqliteRecordStore {
    pub fn open(path: &str) -> Result<Self> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory().context("open in-memory record store")?
        } else {
            if let Some(parent) = std::path::Path::new(path).parent() {
                std::fs::create_dir_all(parent).context("create record store directory")?;
            }
            Connection::open(path).with_context(|| format!("open record store {path}"))?
        };
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS gallery_records (
                id            TEXT PRIMARY KEY,
                owner         TEXT NOT NULL,
                title         TEXT NOT NULL,
                description   TEXT NOT NULL,
                before_key    TEXT NOT NULL,
                after_key     TEXT NOT NULL,
                thumbnail_key TEXT NOT NULL,
                metadata      TEXT NOT NULL,
                tags          TEXT NOT NULL,
                visibility    TEXT NOT NULL,
                likes         INTEGER NOT NULL DEFAULT 0,
                views         INTEGER NOT NULL DEFAULT 0,
                created_at    TEXT NOT NULL,
                updated_at    TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_gallery_public
                ON gallery_records (visibility, created_at DESC, id DESC);",
        )
        .context("create gallery schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<GalleryRecord> {
        let metadata_json: String = row.get("metadata")?;
        let tags_json: String = row.get("tags")?;
        let visibility: String = row.get("visibility")?;
        let created_at: String = row.get("created_at")?;
        let updated_at: String = row.get("updated_at")?;
        Ok(GalleryRecord {
            id: row.get("id")?,
            owner: row.get("owner")?,
            title: row.get("title")?,
            description: row.get("description")?,
            before_blob: BlobReference::new(row.get::<_, String>("before_key")?),
            after_blob: BlobReference::new(row.get::<_, String>("after_key")?),
            thumbnail_blob: BlobReference::new(row.get::<_, String>("thumbnail_key")?),
            metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
            tags: serde_json::from_str(&tags_json).unwrap_or_default(),
            visibility: if visibility == "public" {
                Visibility::Public
            } else {
                Visibility::Private
            },
            likes: row.get::<_, i64>("likes")? as u64,
            views: row.get::<_, i64>("views")? as u64,
            created_at: created_at.parse().unwrap_or_else(|_| Utc::now()),
            updated_at: updated_at.parse().unwrap_or_else(|_| Utc::now()),
        })
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn put(&self, record: &GalleryRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO gallery_records
             (id, owner, title, description, before_key, after_key, thumbnail_key,
              metadata, tags, visibility, likes, views, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                record.id,
                record.owner,
                record.title,
                record.description,
                record.before_blob.key,
                record.after_blob.key,
                record.thumbnail_blob.key,
                serde_json::to_string(&record.metadata)?,
                serde_json::to_string(&record.tags)?,
                match record.visibility {
                    Visibility::Public => "public",
                    Visibility::Private => "private",
                },
                record.likes as i64,
                record.views as i64,
                record.created_at.to_rfc3339(),
                record.updated_at.to_rfc3339(),
            ],
        )
        .context("insert gallery record")?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<GalleryRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT * FROM gallery_records WHERE id = ?1")
            .context("prepare get")?;
        let mut rows = stmt
            .query_map(params![id], Self::row_to_record)
            .context("query record")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("decode record")?)),
            None => Ok(None),
        }
    }

    async fn list_public(&self, limit: usize) -> Result<Vec<GalleryRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT * FROM gallery_records WHERE visibility = 'public'
                 ORDER BY created_at DESC, id DESC LIMIT ?1",
            )
            .context("prepare list")?;
        let rows = stmt
            .query_map(params![limit as i64], Self::row_to_record)
            .context("query public records")?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row.context("decode record")?);
        }
        Ok(records)
    }

    async fn increment_views(&self, id: &str) -> Result<u64> {
        let conn = self.conn.lock();
        let changed = conn
            .execute(
                "UPDATE gallery_records SET views = views + 1, updated_at = ?2 WHERE id = ?1",
                params![id, Utc::now().to_rfc3339()],
            )
            .context("bump views")?;
        anyhow::ensure!(changed == 1, "no record {id}");
        let views: i64 = conn
            .query_row(
                "SELECT views FROM gallery_records WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .context("read views")?;
        Ok(views as u64)
    }

    async fn toggle_like(&self, id: &str) -> Result<u64> {
        let conn = self.conn.lock();
        let changed = conn
            .execute(
                "UPDATE gallery_records SET likes = likes + 1, updated_at = ?2 WHERE id = ?1",
                params![id, Utc::now().to_rfc3339()],
            )
            .context("bump likes")?;
        anyhow::ensure!(changed == 1, "no record {id}");
        let likes: i64 = conn
            .query_row(
                "SELECT likes FROM gallery_records WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .context("read likes")?;
        Ok(likes as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, visibility: Visibility) -> GalleryRecord {
        let now = Utc::now();
        GalleryRecord {
            id: id.to_string(),
            owner: "owner-1".into(),
            title: "living room".into(),
            description: "north wall".into(),
            before_blob: BlobReference::new(format!("snapshots/owner-1/{id}/before.jpg")),
            after_blob: BlobReference::new(format!("snapshots/owner-1/{id}/after.jpg")),
            thumbnail_blob: BlobReference::new(format!("snapshots/owner-1/{id}/thumb.jpg")),
            metadata: SnapshotMetadata {
                surface_type: "wall".into(),
                material: "plaster".into(),
                color: "white".into(),
                bounding_box: Some([0, 0, 900, 1000]),
                face_count: 0,
            },
            tags: vec!["minimal".into()],
            visibility,
            likes: 0,
            views: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn key_validation() {
        assert!(validate_key("snapshots/a/b/before.jpg").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("../etc/passwd").is_err());
        assert!(validate_key("a//b").is_err());
        assert!(validate_key("a/b/../c").is_err());
        assert!(validate_key("weird key").is_err());
    }

    #[tokio::test]
    async fn memory_blob_roundtrip() {
        let store = MemoryBlobStore::new();
        store
            .put("k/a.jpg", Bytes::from_static(b"123"), "image/jpeg")
            .await
            .unwrap();
        assert_eq!(
            store.get("k/a.jpg").await.unwrap(),
            Some(Bytes::from_static(b"123"))
        );
        store.delete("k/a.jpg").await.unwrap();
        assert_eq!(store.get("k/a.jpg").await.unwrap(), None);
    }

    #[tokio::test]
    async fn fs_blob_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        store
            .put("snapshots/o/1/before.jpg", Bytes::from_static(b"jpeg"), "image/jpeg")
            .await
            .unwrap();
        assert_eq!(
            store.get("snapshots/o/1/before.jpg").await.unwrap(),
            Some(Bytes::from_static(b"jpeg"))
        );
        assert_eq!(store.get("snapshots/o/1/missing.jpg").await.unwrap(), None);
        store.delete("snapshots/o/1/before.jpg").await.unwrap();
        assert_eq!(store.get("snapshots/o/1/before.jpg").await.unwrap(), None);
        // Deleting a missing blob is not an error.
        store.delete("snapshots/o/1/before.jpg").await.unwrap();
    }

    #[tokio::test]
    async fn fs_blob_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        assert!(store
            .put("../outside.jpg", Bytes::from_static(b"x"), "image/jpeg")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn sqlite_record_roundtrip_preserves_metadata() {
        let store = SqliteRecordStore::open(":memory:").unwrap();
        let original = record("r-1", Visibility::Public);
        store.put(&original).await.unwrap();

        let loaded = store.get("r-1").await.unwrap().unwrap();
        assert_eq!(loaded.metadata, original.metadata);
        assert_eq!(loaded.tags, original.tags);
        assert_eq!(loaded.before_blob, original.before_blob);
        assert_eq!(loaded.visibility, Visibility::Public);
    }

    #[tokio::test]
    async fn sqlite_list_public_excludes_private() {
        let store = SqliteRecordStore::open(":memory:").unwrap();
        store.put(&record("pub-1", Visibility::Public)).await.unwrap();
        store
            .put(&record("priv-1", Visibility::Private))
            .await
            .unwrap();
        store.put(&record("pub-2", Visibility::Public)).await.unwrap();

        let listed = store.list_public(10).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|r| r.visibility == Visibility::Public));

        let limited = store.list_public(1).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn sqlite_counters_are_monotone() {
        let store = SqliteRecordStore::open(":memory:").unwrap();
        store.put(&record("r-1", Visibility::Public)).await.unwrap();

        assert_eq!(store.increment_views("r-1").await.unwrap(), 1);
        assert_eq!(store.increment_views("r-1").await.unwrap(), 2);
        assert_eq!(store.toggle_like("r-1").await.unwrap(), 1);
        assert_eq!(store.toggle_like("r-1").await.unwrap(), 2);

        let loaded = store.get("r-1").await.unwrap().unwrap();
        assert_eq!(loaded.views, 2);
        assert_eq!(loaded.likes, 2);
    }

    #[tokio::test]
    async fn sqlite_counter_on_missing_record_errors() {
        let store = SqliteRecordStore::open(":memory:").unwrap();
        assert!(store.increment_views("ghost").await.is_err());
    }

    #[tokio::test]
    async fn memory_record_store_counters() {
        let store = MemoryRecordStore::new();
        store.put(&record("r-1", Visibility::Private)).await.unwrap();
        assert_eq!(store.increment_views("r-1").await.unwrap(), 1);
        assert_eq!(store.toggle_like("r-1").await.unwrap(), 1);
        assert!(store.list_public(10).await.unwrap().is_empty());
    }
}
