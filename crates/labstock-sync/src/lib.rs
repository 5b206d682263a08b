//! Reconciliation pipelines and the remote-store adapter.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use labstock_core::{normalize_key_part, InventoryRecord};
use labstock_csv::ImportError;
use labstock_store::{RecordStore, StoreError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tracing::{info, info_span, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "labstock-sync";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: PathBuf,
    pub web_port: u16,
    pub requesters: Vec<String>,
    pub remote: Option<RemoteConfig>,
}

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub object_url: String,
    pub auth_token: Option<String>,
    pub http_timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    db_path: Option<PathBuf>,
    #[serde(default)]
    web_port: Option<u16>,
    #[serde(default)]
    requesters: Vec<String>,
    #[serde(default)]
    remote_url: Option<String>,
    #[serde(default)]
    remote_token: Option<String>,
    #[serde(default)]
    http_timeout_secs: Option<u64>,
}

impl AppConfig {
    /// Reads `labstock.yaml` under the workspace root when present, then
    /// applies `LABSTOCK_*` environment overrides.
    pub fn load(workspace_root: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = workspace_root.as_ref().join("labstock.yaml");
        let file: ConfigFile = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
        } else {
            ConfigFile::default()
        };

        let db_path = std::env::var("LABSTOCK_DB_PATH")
            .map(PathBuf::from)
            .ok()
            .or(file.db_path)
            .unwrap_or_else(|| PathBuf::from("inventory.db"));
        let web_port = std::env::var("LABSTOCK_WEB_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .or(file.web_port)
            .unwrap_or(8000);
        let http_timeout_secs = std::env::var("LABSTOCK_HTTP_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .or(file.http_timeout_secs)
            .unwrap_or(20);
        let object_url = std::env::var("LABSTOCK_REMOTE_URL").ok().or(file.remote_url);
        let auth_token = std::env::var("LABSTOCK_REMOTE_TOKEN")
            .ok()
            .or(file.remote_token);

        Ok(Self {
            db_path,
            web_port,
            requesters: file.requesters,
            remote: object_url.map(|object_url| RemoteConfig {
                object_url,
                auth_token,
                http_timeout_secs,
            }),
        })
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("remote request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("remote returned status {status} for {url}")]
    Status { status: u16, url: String },
    #[error("store file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Contract of the remote object holding the serialized store. Whole-file
/// reads and overwrites only; no conflict detection.
#[async_trait]
pub trait RemoteObjectStore: Send + Sync {
    async fn download(&self) -> Result<Vec<u8>, SyncError>;
    async fn upload(&self, bytes: &[u8]) -> Result<(), SyncError>;
}

/// Authenticated HTTP GET/PUT of a fixed object URL. No retries; a failure
/// is reported once and the user retries the triggering action.
#[derive(Debug)]
pub struct HttpRemote {
    client: reqwest::Client,
    object_url: String,
    auth_token: Option<String>,
}

impl HttpRemote {
    pub fn new(config: &RemoteConfig) -> Result<Self, SyncError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            object_url: config.object_url.clone(),
            auth_token: config.auth_token.clone(),
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl RemoteObjectStore for HttpRemote {
    async fn download(&self) -> Result<Vec<u8>, SyncError> {
        let response = self.authorize(self.client.get(&self.object_url)).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::Status {
                status: status.as_u16(),
                url: response.url().to_string(),
            });
        }
        Ok(response.bytes().await?.to_vec())
    }

    async fn upload(&self, bytes: &[u8]) -> Result<(), SyncError> {
        let response = self
            .authorize(self.client.put(&self.object_url).body(bytes.to_vec()))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::Status {
                status: status.as_u16(),
                url: response.url().to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum FetchOutcome {
    AlreadyValid,
    Downloaded { bytes: u64, sha256: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct PushReceipt {
    pub bytes: u64,
    pub sha256: String,
    pub pushed_at: DateTime<Utc>,
}

/// Keeps the local store file and the remote object in step: fetch before
/// first use, push after every mutation. Push failures are surfaced to the
/// caller as warnings; the local mutation stands.
pub struct RemoteSync {
    remote: Box<dyn RemoteObjectStore>,
}

impl RemoteSync {
    pub fn new(remote: Box<dyn RemoteObjectStore>) -> Self {
        Self { remote }
    }

    pub fn from_config(config: &RemoteConfig) -> Result<Self, SyncError> {
        Ok(Self::new(Box::new(HttpRemote::new(config)?)))
    }

    /// Downloads the remote object when the local copy is missing or fails
    /// validation; otherwise a no-op. Called once at process start.
    pub async fn fetch_if_needed(&self, store: &RecordStore) -> Result<FetchOutcome, SyncError> {
        if store.validate().await {
            return Ok(FetchOutcome::AlreadyValid);
        }
        let span = info_span!("remote_fetch", path = %store.path().display());
        let _guard = span.enter();
        let bytes = self.remote.download().await?;
        write_atomic(store.path(), &bytes)
            .await
            .map_err(|source| SyncError::Io {
                path: store.path().display().to_string(),
                source,
            })?;
        let sha256 = sha256_hex(&bytes);
        info!(bytes = bytes.len(), %sha256, "downloaded store file");
        Ok(FetchOutcome::Downloaded {
            bytes: bytes.len() as u64,
            sha256,
        })
    }

    /// Uploads the current store file wholesale, replacing the remote copy.
    pub async fn push(&self, store: &RecordStore) -> Result<PushReceipt, SyncError> {
        let bytes = fs::read(store.path()).await.map_err(|source| SyncError::Io {
            path: store.path().display().to_string(),
            source,
        })?;
        let sha256 = sha256_hex(&bytes);
        self.remote.upload(&bytes).await?;
        info!(bytes = bytes.len(), %sha256, "pushed store file");
        Ok(PushReceipt {
            bytes: bytes.len() as u64,
            sha256,
            pushed_at: Utc::now(),
        })
    }
}

/// Process-start flow: construct the store handle and remote adapter, run
/// the one-time fetch, then ensure the schema. A failed fetch is downgraded
/// to a warning; the process continues against the local (possibly fresh)
/// store file.
pub async fn open_tracked_store(
    config: &AppConfig,
) -> anyhow::Result<(RecordStore, Option<RemoteSync>)> {
    let store = RecordStore::new(&config.db_path);
    let remote = match &config.remote {
        Some(remote_config) => Some(RemoteSync::from_config(remote_config)?),
        None => None,
    };
    if let Some(remote) = &remote {
        match remote.fetch_if_needed(&store).await {
            Ok(FetchOutcome::AlreadyValid) => {}
            Ok(FetchOutcome::Downloaded { bytes, .. }) => {
                info!(bytes, "restored store file from remote");
            }
            Err(err) => {
                warn!(error = %err, "remote fetch failed; continuing with local store");
            }
        }
    }
    store.ensure_schema().await?;
    Ok((store, remote))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    let temp = path.with_file_name(format!(".{}.tmp", Uuid::new_v4()));
    fs::write(&temp, bytes).await?;
    match fs::rename(&temp, path).await {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = fs::remove_file(&temp).await;
            Err(err)
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ImportOptions {
    /// Also treat keys first seen earlier in the same file as duplicates.
    /// Off by default: the lookup set is built once from existing store
    /// state, so two novel same-key input rows both insert.
    pub dedup_within_file: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ImportOutcome {
    pub inserted: usize,
    pub skipped: usize,
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Import(#[from] ImportError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Ingests CSV bytes: parses every row up front (any conversion failure
/// aborts before a single insert), skips rows whose normalized key already
/// exists, inserts the rest in one transaction.
pub async fn run_import(
    store: &RecordStore,
    bytes: &[u8],
    options: ImportOptions,
) -> Result<ImportOutcome, ReconcileError> {
    let rows = labstock_csv::parse_import(bytes)?;

    let existing = store.list_all().await?;
    let mut known: HashSet<(String, String)> =
        existing.iter().map(InventoryRecord::natural_key).collect();

    let mut novel = Vec::new();
    let mut skipped = 0usize;
    for mut row in rows {
        // Imported rows persist the normalized key halves.
        row.catalog_number = normalize_key_part(&row.catalog_number);
        row.vendor = normalize_key_part(&row.vendor);
        let key = (row.catalog_number.clone(), row.vendor.clone());
        if known.contains(&key) {
            skipped += 1;
            continue;
        }
        if options.dedup_within_file {
            known.insert(key);
        }
        novel.push(row);
    }

    let inserted = store.insert_all(&novel).await?;
    info!(inserted, skipped, "import reconciled");
    Ok(ImportOutcome { inserted, skipped })
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergePlan {
    pub survivor_id: i64,
    pub quantity: i64,
    pub notes: Option<String>,
    pub order_date: Option<String>,
    pub received_date: Option<String>,
    pub remove_ids: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum MergeOutcome {
    NoDuplicates,
    Merged { groups: usize, removed: usize },
}

/// Folds records sharing a normalized composite key into one survivor.
pub struct MergeEngine;

impl MergeEngine {
    /// Pure planning pass over a snapshot of the store. Group members are
    /// ordered order_date desc, then received_date desc, nulls last, stable
    /// on id; the first member survives and takes the aggregates.
    pub fn plan(records: &[InventoryRecord]) -> Vec<MergePlan> {
        let mut groups: BTreeMap<(String, String), Vec<&InventoryRecord>> = BTreeMap::new();
        for record in records {
            groups.entry(record.natural_key()).or_default().push(record);
        }

        let mut plans = Vec::new();
        for (_key, mut members) in groups {
            if members.len() < 2 {
                continue;
            }
            members.sort_by(|a, b| {
                date_desc(&a.order_date, &b.order_date)
                    .then(date_desc(&a.received_date, &b.received_date))
            });

            let quantity: i64 = members.iter().map(|r| r.quantity).sum();
            let notes_set: BTreeSet<String> = members
                .iter()
                .filter_map(|r| r.notes.clone())
                .filter(|n| !n.is_empty())
                .collect();
            let notes = if notes_set.is_empty() {
                None
            } else {
                Some(notes_set.into_iter().collect::<Vec<_>>().join(" | "))
            };
            let order_date = max_date(members.iter().map(|r| &r.order_date));
            let received_date = max_date(members.iter().map(|r| &r.received_date));

            plans.push(MergePlan {
                survivor_id: members[0].id,
                quantity,
                notes,
                order_date,
                received_date,
                remove_ids: members[1..].iter().map(|r| r.id).collect(),
            });
        }
        plans
    }

    /// Applies each plan through the store, one transaction per group.
    /// Performs no writes at all when the store holds no duplicates.
    pub async fn run(store: &RecordStore) -> Result<MergeOutcome, StoreError> {
        let records = store.list_all().await?;
        let plans = Self::plan(&records);
        if plans.is_empty() {
            return Ok(MergeOutcome::NoDuplicates);
        }
        let mut removed = 0usize;
        for plan in &plans {
            store
                .apply_merge(
                    plan.survivor_id,
                    plan.quantity,
                    plan.notes.clone(),
                    plan.order_date.clone(),
                    plan.received_date.clone(),
                    &plan.remove_ids,
                )
                .await?;
            removed += plan.remove_ids.len();
        }
        info!(groups = plans.len(), removed, "merged duplicate records");
        Ok(MergeOutcome::Merged {
            groups: plans.len(),
            removed,
        })
    }
}

// Descending date order with empty-or-null last.
fn date_desc(a: &Option<String>, b: &Option<String>) -> Ordering {
    let a = a.as_deref().filter(|d| !d.is_empty());
    let b = b.as_deref().filter(|d| !d.is_empty());
    match (a, b) {
        (Some(x), Some(y)) => y.cmp(x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn max_date<'a>(dates: impl Iterator<Item = &'a Option<String>>) -> Option<String> {
    dates
        .filter_map(|d| d.as_deref())
        .filter(|d| !d.is_empty())
        .max()
        .map(str::to_string)
}
