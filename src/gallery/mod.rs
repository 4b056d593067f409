//! Gallery: durable storage for analysis artifacts.
//!
//! A snapshot is a pair of images (before/after) plus metadata. Blobs
//! land in the blob store under `snapshots/{owner}/{id}/...`, the
//! record in the record store. If the record write fails after blobs
//! were written, the blobs are deleted best-effort (at-least-once;
//! the store's 30-day lifecycle rule is the safety net).
//!
//! Reads never expose blob locations. Download URLs are minted per
//! call: HMAC-signed `(key, expiry)` pairs served by `GET /blobs/...`
//! with a bounded lifetime.

pub mod store;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use uuid::Uuid;

use crate::media::codec;

pub use store::{
    BlobReference, BlobStore, FsBlobStore, GalleryRecord, MemoryBlobStore, MemoryRecordStore,
    RecordStore, SnapshotMetadata, SqliteRecordStore, Visibility,
};

/// Thumbnail long side, pixels.
const THUMBNAIL_SIDE: u32 = 256;

// ── Minted URLs ────────────────────────────────────────────────────

type HmacSha256 = Hmac<Sha256>;

/// Mints and verifies time-bounded download URLs.
pub struct UrlSigner {
    key: Vec<u8>,
    ttl: Duration,
}

impl UrlSigner {
    pub fn new(key: Vec<u8>, ttl: Duration) -> Self {
        Self { key, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn signature(&self, blob_key: &str, expires: i64) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.key).expect("hmac accepts any key length");
        mac.update(blob_key.as_bytes());
        mac.update(b"\n");
        mac.update(expires.to_string().as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Mint a relative download URL valid for the configured TTL.
    pub fn mint(&self, blob_key: &str) -> String {
        let expires = Utc::now().timestamp() + self.ttl.as_secs() as i64;
        let sig = self.signature(blob_key, expires);
        format!("/blobs/{blob_key}?exp={expires}&sig={sig}")
    }

    /// Verify a presented `(key, exp, sig)` triple.
    pub fn verify(&self, blob_key: &str, expires: i64, sig: &str) -> bool {
        if expires < Utc::now().timestamp() {
            return false;
        }
        constant_time_eq(self.signature(blob_key, expires).as_bytes(), sig.as_bytes())
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b) {
        diff |= x ^ y;
    }
    diff == 0
}

// ── Gallery operations ─────────────────────────────────────────────

/// Input for a new snapshot.
#[derive(Debug, Clone)]
pub struct NewSnapshot {
    pub owner: String,
    pub title: String,
    pub description: String,
    pub before_jpeg: Bytes,
    pub after_jpeg: Bytes,
    pub metadata: SnapshotMetadata,
    pub tags: Vec<String>,
    pub visibility: Visibility,
}

/// A record plus its minted download URLs.
#[derive(Debug, Clone, Serialize)]
pub struct GalleryItem {
    #[serde(flatten)]
    pub record: GalleryRecord,
    pub before_url: String,
    pub after_url: String,
    pub thumbnail_url: String,
}

/// Stateless dispatcher over the two collaborator stores.
pub struct GalleryStore {
    blobs: Arc<dyn BlobStore>,
    records: Arc<dyn RecordStore>,
    signer: UrlSigner,
}

impl GalleryStore {
    pub fn new(blobs: Arc<dyn BlobStore>, records: Arc<dyn RecordStore>, signer: UrlSigner) -> Self {
        Self {
            blobs,
            records,
            signer,
        }
    }

    pub fn signer(&self) -> &UrlSigner {
        &self.signer
    }

    /// Fetch blob bytes for a verified download.
    pub async fn blob(&self, key: &str) -> Result<Option<Bytes>> {
        self.blobs.get(key).await
    }

    /// Persist a snapshot: blobs first, then the record. A failed
    /// record write schedules compensating blob deletion.
    pub async fn save(&self, snapshot: NewSnapshot) -> Result<GalleryRecord> {
        anyhow::ensure!(
            !snapshot.before_jpeg.is_empty() && !snapshot.after_jpeg.is_empty(),
            "snapshot requires both before and after images"
        );

        let id = Uuid::new_v4().to_string();
        let prefix = format!("snapshots/{}/{}", snapshot.owner, id);
        let before_key = format!("{prefix}/before.jpg");
        let after_key = format!("{prefix}/after.jpg");
        let thumb_key = format!("{prefix}/thumb.jpg");

        let thumbnail = {
            let after = snapshot.after_jpeg.clone();
            tokio::task::spawn_blocking(move || make_thumbnail(&after))
                .await
                .context("thumbnail task")??
        };

        self.put_with_retry(&before_key, snapshot.before_jpeg.clone())
            .await?;
        self.put_with_retry(&after_key, snapshot.after_jpeg.clone())
            .await?;
        self.put_with_retry(&thumb_key, thumbnail).await?;

        let now = Utc::now();
        let record = GalleryRecord {
            id: id.clone(),
            owner: snapshot.owner,
            title: snapshot.title,
            description: snapshot.description,
            before_blob: BlobReference::new(&before_key),
            after_blob: BlobReference::new(&after_key),
            thumbnail_blob: BlobReference::new(&thumb_key),
            metadata: snapshot.metadata,
            tags: snapshot.tags,
            visibility: snapshot.visibility,
            likes: 0,
            views: 0,
            created_at: now,
            updated_at: now,
        };

        if let Err(e) = self.records.put(&record).await {
            tracing::error!(error = %e, id = %id, "record write failed, cleaning up blobs");
            for key in [&before_key, &after_key, &thumb_key] {
                if let Err(del) = self.blobs.delete(key).await {
                    // At-least-once: the blob-store lifecycle rule
                    // collects anything we miss here.
                    tracing::warn!(error = %del, key = %key, "compensating delete failed");
                }
            }
            return Err(e).context("persist gallery record");
        }

        tracing::info!(id = %id, "snapshot saved");
        Ok(record)
    }

    async fn put_with_retry(&self, key: &str, bytes: Bytes) -> Result<()> {
        match self.blobs.put(key, bytes.clone(), "image/jpeg").await {
            Ok(()) => Ok(()),
            Err(first) => {
                tracing::warn!(error = %first, key = %key, "blob write failed, retrying once");
                self.blobs
                    .put(key, bytes, "image/jpeg")
                    .await
                    .with_context(|| format!("blob write {key}"))
            }
        }
    }

    /// Up to `limit` public records with freshly minted URLs.
    pub async fn list_public(&self, limit: usize) -> Result<Vec<GalleryItem>> {
        let records = self.records.list_public(limit).await?;
        Ok(records.into_iter().map(|r| self.with_urls(r)).collect())
    }

    /// One record with freshly minted URLs.
    pub async fn get(&self, id: &str) -> Result<Option<GalleryItem>> {
        Ok(self.records.get(id).await?.map(|r| self.with_urls(r)))
    }

    pub async fn increment_views(&self, id: &str) -> Result<u64> {
        self.records.increment_views(id).await
    }

    pub async fn toggle_like(&self, id: &str) -> Result<u64> {
        self.records.toggle_like(id).await
    }

    fn with_urls(&self, record: GalleryRecord) -> GalleryItem {
        let before_url = self.signer.mint(&record.before_blob.key);
        let after_url = self.signer.mint(&record.after_blob.key);
        let thumbnail_url = self.signer.mint(&record.thumbnail_blob.key);
        GalleryItem {
            record,
            before_url,
            after_url,
            thumbnail_url,
        }
    }
}

/// Downscale the "after" image into a gallery thumbnail.
fn make_thumbnail(jpeg: &Bytes) -> Result<Bytes> {
    let image = codec::decode_jpeg(jpeg)?;
    let (w, h) = image.dimensions();
    let long_side = w.max(h).max(1);
    if long_side <= THUMBNAIL_SIDE {
        return codec::encode_jpeg(&image);
    }
    let scale = THUMBNAIL_SIDE as f64 / long_side as f64;
    let nw = ((w as f64 * scale).round() as u32).max(1);
    let nh = ((h as f64 * scale).round() as u32).max(1);
    let thumb = image::imageops::resize(&image, nw, nh, image::imageops::FilterType::Lanczos3);
    codec::encode_jpeg(&thumb)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jpeg(side: u32) -> Bytes {
        let image = image::RgbImage::from_pixel(side, side, image::Rgb([10, 200, 30]));
        codec::encode_jpeg(&image).unwrap()
    }

    fn gallery() -> (GalleryStore, Arc<MemoryBlobStore>, Arc<MemoryRecordStore>) {
        let blobs = Arc::new(MemoryBlobStore::new());
        let records = Arc::new(MemoryRecordStore::new());
        let signer = UrlSigner::new(b"test-key".to_vec(), Duration::from_secs(900));
        (
            GalleryStore::new(
                Arc::clone(&blobs) as Arc<dyn BlobStore>,
                Arc::clone(&records) as Arc<dyn RecordStore>,
                signer,
            ),
            blobs,
            records,
        )
    }

    fn snapshot(visibility: Visibility) -> NewSnapshot {
        NewSnapshot {
            owner: "owner-1".into(),
            title: "study".into(),
            description: "desk wall".into(),
            before_jpeg: jpeg(64),
            after_jpeg: jpeg(512),
            metadata: SnapshotMetadata {
                surface_type: "wall".into(),
                ..Default::default()
            },
            tags: vec!["wood".into()],
            visibility,
        }
    }

    #[tokio::test]
    async fn save_then_get_roundtrips_metadata() {
        let (gallery, blobs, _records) = gallery();
        let record = gallery.save(snapshot(Visibility::Public)).await.unwrap();

        // Three blobs under the owner/id prefix.
        assert_eq!(blobs.len(), 3);
        assert!(record
            .before_blob
            .key
            .starts_with(&format!("snapshots/owner-1/{}/", record.id)));

        let item = gallery.get(&record.id).await.unwrap().unwrap();
        assert_eq!(item.record.metadata, record.metadata);
        assert_eq!(item.record.title, "study");
        assert!(item.before_url.starts_with("/blobs/"));
        assert!(item.after_url.contains("exp="));
        assert!(item.thumbnail_url.contains("sig="));
    }

    #[tokio::test]
    async fn minted_urls_differ_across_calls_but_resolve_same_blob() {
        let (gallery, _blobs, _records) = gallery();
        let record = gallery.save(snapshot(Visibility::Public)).await.unwrap();

        let a = gallery.get(&record.id).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        let b = gallery.get(&record.id).await.unwrap().unwrap();
        assert_ne!(a.before_url, b.before_url);

        // Both URLs refer to the same key.
        let key_of = |url: &str| url.trim_start_matches("/blobs/").split('?').next().unwrap().to_string();
        assert_eq!(key_of(&a.before_url), key_of(&b.before_url));
    }

    #[tokio::test]
    async fn record_failure_cleans_up_blobs() {
        let (gallery, blobs, records) = gallery();
        records.fail_next_put();
        let result = gallery.save(snapshot(Visibility::Private)).await;
        assert!(result.is_err());
        assert!(blobs.is_empty(), "compensating cleanup must remove blobs");
    }

    #[tokio::test]
    async fn missing_images_are_rejected() {
        let (gallery, _blobs, _records) = gallery();
        let mut bad = snapshot(Visibility::Private);
        bad.after_jpeg = Bytes::new();
        assert!(gallery.save(bad).await.is_err());
    }

    #[tokio::test]
    async fn list_public_only_lists_public() {
        let (gallery, _blobs, _records) = gallery();
        gallery.save(snapshot(Visibility::Public)).await.unwrap();
        gallery.save(snapshot(Visibility::Private)).await.unwrap();
        let items = gallery.list_public(10).await.unwrap();
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn signer_verify_accepts_fresh_and_rejects_forged() {
        let signer = UrlSigner::new(b"k".to_vec(), Duration::from_secs(900));
        let url = signer.mint("snapshots/o/1/before.jpg");
        // Pull exp and sig back out of the minted URL.
        let query = url.split('?').nth(1).unwrap();
        let mut exp = 0i64;
        let mut sig = String::new();
        for pair in query.split('&') {
            let (k, v) = pair.split_once('=').unwrap();
            match k {
                "exp" => exp = v.parse().unwrap(),
                "sig" => sig = v.to_string(),
                _ => {}
            }
        }
        assert!(signer.verify("snapshots/o/1/before.jpg", exp, &sig));
        assert!(!signer.verify("snapshots/o/1/after.jpg", exp, &sig));
        assert!(!signer.verify("snapshots/o/1/before.jpg", exp + 1, &sig));
    }

    #[test]
    fn signer_rejects_expired() {
        let signer = UrlSigner::new(b"k".to_vec(), Duration::from_secs(900));
        let past = Utc::now().timestamp() - 10;
        let sig = signer.signature("key.jpg", past);
        assert!(!signer.verify("key.jpg", past, &sig));
    }

    #[test]
    fn ttl_is_bounded_by_config() {
        let signer = UrlSigner::new(b"k".to_vec(), Duration::from_secs(900));
        let url = signer.mint("a.jpg");
        let query = url.split('?').nth(1).unwrap();
        let exp: i64 = query
            .split('&')
            .find_map(|p| p.strip_prefix("exp="))
            .unwrap()
            .parse()
            .unwrap();
        let ttl = exp - Utc::now().timestamp();
        assert!(ttl <= 900, "ttl {ttl} exceeds the configured bound");
        assert!(ttl > 880);
    }

    #[test]
    fn thumbnail_is_bounded() {
        let thumb = make_thumbnail(&jpeg(800)).unwrap();
        let decoded = codec::decode_jpeg(&thumb).unwrap();
        assert!(decoded.width().max(decoded.height()) <= THUMBNAIL_SIDE);
    }
}
