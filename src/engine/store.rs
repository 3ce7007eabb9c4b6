// Content-addressed on-disk cache of caller-supplied input files.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{EngineConfig, CONTENT_NAME_PREFIX, SHARD_PREFIX_LEN};
use crate::detect::media;
use crate::error::{EngineError, EngineResult};

/// Lowercase hex SHA-256 of a file's bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(bytes: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(bytes)))
    }

    /// Accept a 64-character hex digest in either case.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.len() == 64 && value.bytes().all(|b| b.is_ascii_hexdigit()) {
            Some(Self(value.to_ascii_lowercase()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        &self.0[..8]
    }

    /// Caller-visible stable name, `files/<fingerprint>`.
    pub fn content_name(&self) -> String {
        format!("{}{}", CONTENT_NAME_PREFIX, self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Caller-supplied description of ingested bytes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContentMetadata {
    pub display_name: Option<String>,
    pub media_type: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CachedContent {
    pub fingerprint: Fingerprint,
    pub path: PathBuf,
    pub display_name: String,
    pub media_type: String,
    pub size_bytes: u64,
    pub created_at: Instant,
    pub last_access: Instant,
    /// When the most recent remote copy is estimated to expire upstream.
    pub upstream_expires_at: Option<Instant>,
}

/// Serializable listing row.
#[derive(Debug, Clone, Serialize)]
pub struct ContentInfo {
    pub name: String,
    pub sha256: Fingerprint,
    pub display_name: String,
    pub media_type: String,
    pub size_bytes: u64,
    pub age_secs: u64,
}

impl ContentInfo {
    fn from_entry(entry: &CachedContent, now: Instant) -> Self {
        Self {
            name: entry.fingerprint.content_name(),
            sha256: entry.fingerprint.clone(),
            display_name: entry.display_name.clone(),
            media_type: entry.media_type.clone(),
            size_bytes: entry.size_bytes,
            age_secs: now.saturating_duration_since(entry.created_at).as_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ContentPage {
    pub files: Vec<ContentInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<String>,
}

struct Grant {
    fingerprint: Fingerprint,
    expires_at: Instant,
}

pub struct ContentStore {
    root: PathBuf,
    entries: RwLock<HashMap<Fingerprint, CachedContent>>,
    grants: Mutex<HashMap<String, Grant>>,
    ttl: Duration,
    capacity: usize,
    upstream_ttl: Duration,
    grant_ttl: Duration,
    stored_bytes: AtomicU64,
}

impl ContentStore {
    /// Open (or create) the store under `config.content_dir`, indexing files
    /// left by a previous run. Ages restart from the moment of indexing.
    pub fn open(config: &EngineConfig) -> EngineResult<Self> {
        let root = PathBuf::from(&config.content_dir);
        fs::create_dir_all(&root)?;

        let store = Self {
            root,
            entries: RwLock::new(HashMap::new()),
            grants: Mutex::new(HashMap::new()),
            ttl: config.content_ttl(),
            capacity: config.content_capacity,
            upstream_ttl: config.upstream_ttl(),
            grant_ttl: config.grant_ttl(),
            stored_bytes: AtomicU64::new(0),
        };
        let indexed = store.reindex()?;
        info!(
            "content store at {} opened, {} file(s) indexed",
            store.root.display(),
            indexed
        );
        Ok(store)
    }

    fn reindex(&self) -> EngineResult<usize> {
        let now = Instant::now();
        let mut entries = self.entries.write();
        for shard in fs::read_dir(&self.root)? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }
            for file in fs::read_dir(shard.path())? {
                let file = file?;
                let path = file.path();
                let name = file.file_name().to_string_lossy().into_owned();
                let Some(fingerprint) = Fingerprint::parse(&name) else {
                    // Leftover partial write from a crash.
                    if name.contains(".tmp-") {
                        let _ = fs::remove_file(&path);
                    }
                    continue;
                };
                let size_bytes = file.metadata()?.len();
                let mut header = Vec::with_capacity(media::SNIFF_LEN);
                fs::File::open(&path)?
                    .take(media::SNIFF_LEN as u64)
                    .read_to_end(&mut header)?;
                let media_type = media::resolve(None, None, &header);
                self.stored_bytes.fetch_add(size_bytes, Ordering::Relaxed);
                entries.insert(
                    fingerprint.clone(),
                    CachedContent {
                        display_name: media::fallback_name(fingerprint.as_str(), &media_type),
                        fingerprint,
                        path,
                        media_type,
                        size_bytes,
                        created_at: now,
                        last_access: now,
                        upstream_expires_at: None,
                    },
                );
            }
        }
        Ok(entries.len())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `root/<first two hex chars>/<fingerprint>`
    pub fn path_for(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.root
            .join(&fingerprint.as_str()[..SHARD_PREFIX_LEN])
            .join(fingerprint.as_str())
    }

    /// Store bytes under their fingerprint. Storing the same bytes twice is a no-op
    /// apart from refreshing the access time.
    pub async fn put(&self, bytes: &[u8], metadata: ContentMetadata) -> EngineResult<Fingerprint> {
        let fingerprint = Fingerprint::of(bytes);
        if self.touch(&fingerprint) {
            debug!("content {} already cached", fingerprint.short());
            return Ok(fingerprint);
        }

        let header = &bytes[..bytes.len().min(media::SNIFF_LEN)];
        let display_name = media::normalize_name(metadata.display_name.as_deref());
        let media_type = media::resolve(
            metadata.media_type.as_deref(),
            display_name.as_deref(),
            header,
        );
        let display_name = display_name
            .unwrap_or_else(|| media::fallback_name(fingerprint.as_str(), &media_type));

        let path = self.path_for(&fingerprint);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_file_name(format!(
            "{}.tmp-{}",
            fingerprint.as_str(),
            Uuid::new_v4().simple()
        ));
        if let Err(e) = tokio::fs::write(&tmp, bytes).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        tokio::fs::rename(&tmp, &path).await?;

        let now = Instant::now();
        let size_bytes = bytes.len() as u64;
        let mut entries = self.entries.write();
        entries.entry(fingerprint.clone()).or_insert_with(|| {
            self.stored_bytes.fetch_add(size_bytes, Ordering::Relaxed);
            CachedContent {
                fingerprint: fingerprint.clone(),
                path,
                display_name,
                media_type,
                size_bytes,
                created_at: now,
                last_access: now,
                upstream_expires_at: None,
            }
        });
        info!(
            "cached content {} ({} bytes)",
            fingerprint.short(),
            size_bytes
        );
        Ok(fingerprint)
    }

    /// Read cached bytes, verifying they still hash to their fingerprint.
    pub async fn get(&self, fingerprint: &Fingerprint) -> EngineResult<Bytes> {
        let path = self
            .entries
            .read()
            .get(fingerprint)
            .map(|e| e.path.clone())
            .ok_or_else(|| EngineError::ContentNotFound {
                reference: fingerprint.content_name(),
            })?;
        let data = tokio::fs::read(&path).await?;
        if Fingerprint::of(&data) != *fingerprint {
            warn!("cached content {} is corrupt on disk", fingerprint.short());
            return Err(EngineError::ContentIntegrity {
                fingerprint: fingerprint.to_string(),
                detail: "bytes on disk no longer match their fingerprint".to_string(),
            });
        }
        self.touch(fingerprint);
        Ok(Bytes::from(data))
    }

    /// Refresh the access time. Returns false if the content is unknown.
    pub fn touch(&self, fingerprint: &Fingerprint) -> bool {
        match self.entries.write().get_mut(fingerprint) {
            Some(entry) => {
                entry.last_access = Instant::now();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.entries.read().contains_key(fingerprint)
    }

    pub fn metadata(&self, fingerprint: &Fingerprint) -> Option<CachedContent> {
        self.entries.read().get(fingerprint).cloned()
    }

    pub fn info(&self, fingerprint: &Fingerprint) -> Option<ContentInfo> {
        self.entries
            .read()
            .get(fingerprint)
            .map(|e| ContentInfo::from_entry(e, Instant::now()))
    }

    /// Record a fresh remote copy; the upstream expiry estimate restarts.
    pub fn mark_replicated(&self, fingerprint: &Fingerprint) {
        if let Some(entry) = self.entries.write().get_mut(fingerprint) {
            entry.upstream_expires_at = Some(Instant::now() + self.upstream_ttl);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stored_bytes(&self) -> u64 {
        self.stored_bytes.load(Ordering::Relaxed)
    }

    /// Newest first, paged by an opaque offset token.
    pub fn list(&self, page_size: usize, page_token: Option<&str>) -> EngineResult<ContentPage> {
        let offset = match page_token {
            None | Some("") => 0,
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| EngineError::protocol(format!("invalid page token {:?}", token)))?,
        };
        let page_size = page_size.max(1);
        let now = Instant::now();

        let entries = self.entries.read();
        let mut rows: Vec<&CachedContent> = entries.values().collect();
        rows.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.fingerprint.cmp(&b.fingerprint))
        });
        let files: Vec<ContentInfo> = rows
            .iter()
            .skip(offset)
            .take(page_size)
            .map(|e| ContentInfo::from_entry(e, now))
            .collect();
        let next = offset + files.len();
        Ok(ContentPage {
            next_page_token: (next < rows.len()).then(|| next.to_string()),
            files,
        })
    }

    /// Drop one entry and its file. Returns false if it was not cached.
    pub async fn remove(&self, fingerprint: &Fingerprint) -> EngineResult<bool> {
        let Some(entry) = self.entries.write().remove(fingerprint) else {
            return Ok(false);
        };
        self.stored_bytes
            .fetch_sub(entry.size_bytes, Ordering::Relaxed);
        self.grants
            .lock()
            .retain(|_, g| g.fingerprint != *fingerprint);
        match tokio::fs::remove_file(&entry.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        info!("removed cached content {}", fingerprint.short());
        Ok(true)
    }

    /// Evict entries older than the TTL, keeping the `capacity` most recently
    /// used entries regardless of age. Returns the evicted fingerprints.
    pub fn sweep(&self, now: Instant) -> Vec<Fingerprint> {
        let evicted: Vec<CachedContent> = {
            let mut entries = self.entries.write();
            let mut by_recency: Vec<(&Fingerprint, &CachedContent)> = entries.iter().collect();
            by_recency.sort_by(|a, b| b.1.last_access.cmp(&a.1.last_access));
            let expired: Vec<Fingerprint> = by_recency
                .into_iter()
                .skip(self.capacity)
                .filter(|(_, e)| now.saturating_duration_since(e.created_at) > self.ttl)
                .map(|(fp, _)| fp.clone())
                .collect();
            expired
                .iter()
                .filter_map(|fp| entries.remove(fp))
                .collect()
        };

        self.grants.lock().retain(|_, g| g.expires_at > now);

        for entry in &evicted {
            self.stored_bytes
                .fetch_sub(entry.size_bytes, Ordering::Relaxed);
            if let Err(e) = fs::remove_file(&entry.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("failed to delete {}: {}", entry.path.display(), e);
                }
            }
        }
        if !evicted.is_empty() {
            info!("evicted {} cached file(s)", evicted.len());
        }
        evicted.into_iter().map(|e| e.fingerprint).collect()
    }

    /// Issue a one-time download token for `fingerprint`.
    pub fn grant(&self, fingerprint: &Fingerprint) -> String {
        let token = Uuid::new_v4().simple().to_string();
        self.grants.lock().insert(
            token.clone(),
            Grant {
                fingerprint: fingerprint.clone(),
                expires_at: Instant::now() + self.grant_ttl,
            },
        );
        token
    }

    /// Consume a token. Succeeds once, only for the fingerprint it was issued for,
    /// and only before it expires.
    pub fn redeem(&self, fingerprint: &Fingerprint, token: &str) -> bool {
        let mut grants = self.grants.lock();
        match grants.get(token) {
            Some(g) if g.fingerprint == *fingerprint => {
                let live = g.expires_at > Instant::now();
                grants.remove(token);
                live
            }
            _ => false,
        }
    }

    /// Withdraw a token that was never redeemed.
    pub fn revoke(&self, token: &str) {
        self.grants.lock().remove(token);
    }
}
