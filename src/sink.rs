// Durable write path for observation records.
//
// A record goes to the primary analytical store when one is configured. If
// that insert fails for any reason the record is appended to the local JSON
// file instead, exactly once. The local file is the last line: if it cannot
// be written either, the error reaches the caller.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ClickHouseConfig;
use crate::models::{ObservationRecord, RecordType};

// ============================================================================
// Errors and outcomes
// ============================================================================

#[derive(Debug, Error)]
pub enum PrimaryWriteFailure {
    #[error("Primary store unreachable: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Primary store rejected insert ({status}): {body}")]
    Rejected { status: StatusCode, body: String },
    #[error("Primary store did not answer within {0:?}")]
    Timeout(Duration),
    #[error("Failed to encode row: {0}")]
    Encode(String),
}

#[derive(Debug, Error)]
pub enum LocalStoreFailure {
    #[error("Failed to encode local data: {0}")]
    Encode(String),
    #[error("Local data I/O failed on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug)]
pub enum WriteOutcome {
    /// Stored in the primary backend.
    Primary,
    /// Primary failed; stored in the local file.
    Fallback { cause: PrimaryWriteFailure },
    /// Primary disabled; stored in the local file.
    Local,
}

// ============================================================================
// Primary store
// ============================================================================

pub trait PrimaryStore: Send + Sync {
    fn insert(
        &self,
        record: &ObservationRecord,
    ) -> impl Future<Output = Result<(), PrimaryWriteFailure>> + Send;
}

/// ClickHouse over its HTTP interface, one `JSONEachRow` insert per record.
pub struct ClickHouseStore {
    http: reqwest::Client,
    config: ClickHouseConfig,
}

#[derive(Serialize)]
struct ClickHouseRow<'a> {
    id: &'a str,
    route_id: &'a str,
    stop_id: &'a str,
    stop_name: &'a str,
    latitude: f64,
    longitude: f64,
    timestamp: String,
    #[serde(rename = "type")]
    kind: &'static str,
    user_id: Option<&'a str>,
    device_id: Option<&'a str>,
    device_name: Option<&'a str>,
    app_version: Option<&'a str>,
}

impl<'a> From<&'a ObservationRecord> for ClickHouseRow<'a> {
    fn from(record: &'a ObservationRecord) -> Self {
        ClickHouseRow {
            id: &record.id,
            route_id: &record.route_id,
            stop_id: &record.stop_id,
            stop_name: &record.stop_name,
            latitude: record.latitude,
            longitude: record.longitude,
            timestamp: record.timestamp.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
            kind: record.kind.as_str(),
            user_id: record.user_id.as_deref(),
            device_id: record.device_id.as_deref(),
            device_name: record.device_name.as_deref(),
            app_version: record.app_version.as_deref(),
        }
    }
}

impl ClickHouseStore {
    pub fn new(config: ClickHouseConfig) -> Result<Self, PrimaryWriteFailure> {
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { http, config })
    }

    fn table(&self) -> String {
        format!("{}.{}", self.config.database, self.config.table)
    }

    pub fn create_table_sql(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\
                id String, \
                route_id String, \
                stop_id String, \
                stop_name String, \
                latitude Float64, \
                longitude Float64, \
                timestamp DateTime64(3, 'UTC'), \
                type LowCardinality(String), \
                user_id Nullable(String), \
                device_id Nullable(String), \
                device_name Nullable(String), \
                app_version Nullable(String)\
            ) ENGINE = MergeTree ORDER BY (timestamp, id)",
            self.table()
        )
    }

    pub async fn ensure_table(&self) -> Result<(), PrimaryWriteFailure> {
        self.execute(None, self.create_table_sql()).await
    }

    async fn execute(&self, query: Option<&str>, body: String) -> Result<(), PrimaryWriteFailure> {
        let mut request = self
            .http
            .post(&self.config.url)
            .header("X-ClickHouse-User", &self.config.user)
            .header("X-ClickHouse-Key", &self.config.password)
            .body(body);

        if let Some(query) = query {
            request = request.query(&[("query", query)]);
        }

        let response = request.send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PrimaryWriteFailure::Rejected {
                status,
                body: body.trim().to_string(),
            });
        }

        Ok(())
    }
}

impl PrimaryStore for ClickHouseStore {
    async fn insert(&self, record: &ObservationRecord) -> Result<(), PrimaryWriteFailure> {
        let row = serde_json::to_string(&ClickHouseRow::from(record))
            .map_err(|e| PrimaryWriteFailure::Encode(e.to_string()))?;
        let query = format!("INSERT INTO {} FORMAT JSONEachRow", self.table());

        self.execute(Some(&query), row).await
    }
}

// ============================================================================
// Local store
// ============================================================================

/// On-disk layout of the fallback file. Entries are kept as raw JSON so
/// records written by older builds survive a rewrite untouched.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct LocalData {
    #[serde(default)]
    pub stop_confirmations: Vec<Value>,
    #[serde(default)]
    pub location_updates: Vec<Value>,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

pub struct LocalStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl LocalStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, record: &ObservationRecord) -> Result<(), LocalStoreFailure> {
        let entry =
            serde_json::to_value(record).map_err(|e| LocalStoreFailure::Encode(e.to_string()))?;

        let _guard = self.lock.lock().await;

        let mut data = self.load_unlocked().await?;
        match record.kind {
            RecordType::StopRecord => data.stop_confirmations.push(entry),
            RecordType::LocationRecord => data.location_updates.push(entry),
        }

        self.save_unlocked(&data).await
    }

    pub async fn read(&self) -> Result<LocalData, LocalStoreFailure> {
        let _guard = self.lock.lock().await;
        self.load_unlocked().await
    }

    // Unreadable content is copied aside before the caller overwrites it. Any
    // other I/O error is returned so the existing file is never replaced blind.
    async fn load_unlocked(&self) -> Result<LocalData, LocalStoreFailure> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(LocalData::default()),
            Err(source) => {
                return Err(LocalStoreFailure::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(LocalData::default());
        }

        let reason = match std::str::from_utf8(&bytes) {
            Ok(text) => match serde_json::from_str::<LocalData>(text) {
                Ok(data) => return Ok(data),
                Err(e) => e.to_string(),
            },
            Err(e) => e.to_string(),
        };

        let backup = self.backup_path();
        tokio::fs::write(&backup, &bytes)
            .await
            .map_err(|source| LocalStoreFailure::Io {
                path: backup.clone(),
                source,
            })?;
        error!(
            path = %self.path.display(),
            backup = %backup.display(),
            error = %reason,
            "Local data file is corrupt, kept a copy and starting empty"
        );

        Ok(LocalData::default())
    }

    async fn save_unlocked(&self, data: &LocalData) -> Result<(), LocalStoreFailure> {
        let json = serde_json::to_string_pretty(data)
            .map_err(|e| LocalStoreFailure::Encode(e.to_string()))?;

        let tmp = self.sibling("tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|source| LocalStoreFailure::Io {
                path: tmp.clone(),
                source,
            })?;

        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|source| LocalStoreFailure::Io {
                path: self.path.clone(),
                source,
            })
    }

    fn backup_path(&self) -> PathBuf {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
        let tag = Uuid::new_v4().simple().to_string();
        self.sibling(&format!("corrupt-{stamp}-{}", &tag[..8]))
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".");
        name.push(suffix);
        PathBuf::from(name)
    }
}

// ============================================================================
// Write sink
// ============================================================================

pub struct WriteSink<P> {
    primary: Option<P>,
    primary_timeout: Duration,
    local: LocalStore,
}

impl<P: PrimaryStore> WriteSink<P> {
    pub fn new(primary: Option<P>, primary_timeout: Duration, local: LocalStore) -> Self {
        Self {
            primary,
            primary_timeout,
            local,
        }
    }

    pub fn primary(&self) -> Option<&P> {
        self.primary.as_ref()
    }

    pub fn primary_enabled(&self) -> bool {
        self.primary.is_some()
    }

    pub fn local(&self) -> &LocalStore {
        &self.local
    }

    pub async fn write(&self, record: &ObservationRecord) -> Result<WriteOutcome, LocalStoreFailure> {
        let Some(primary) = &self.primary else {
            self.local.append(record).await?;
            debug!(id = %record.id, kind = record.kind.as_str(), "Record stored locally");
            return Ok(WriteOutcome::Local);
        };

        let cause = match tokio::time::timeout(self.primary_timeout, primary.insert(record)).await {
            Ok(Ok(())) => {
                debug!(id = %record.id, kind = record.kind.as_str(), "Record stored in primary store");
                return Ok(WriteOutcome::Primary);
            }
            Ok(Err(e)) => e,
            Err(_) => PrimaryWriteFailure::Timeout(self.primary_timeout),
        };

        warn!(id = %record.id, error = %cause, "Primary store failed, using local storage");

        self.local.append(record).await.inspect_err(|e| {
            error!(id = %record.id, error = %e, "Local fallback write failed, record lost");
        })?;
        info!(id = %record.id, path = %self.local.path().display(), "Record stored in local fallback");

        Ok(WriteOutcome::Fallback { cause })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{header, method, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn record(kind: RecordType, id: &str) -> ObservationRecord {
        ObservationRecord {
            id: id.to_string(),
            route_id: "r1".to_string(),
            stop_id: "s1".to_string(),
            stop_name: "City Center".to_string(),
            latitude: 12.97,
            longitude: 77.59,
            timestamp: Utc::now(),
            kind,
            device_id: None,
            device_name: None,
            app_version: None,
            user_id: Some("alice".to_string()),
        }
    }

    fn ids(entries: &[Value]) -> Vec<String> {
        entries
            .iter()
            .filter_map(|e| e["id"].as_str().map(str::to_string))
            .collect()
    }

    #[derive(Default)]
    struct FakePrimary {
        fail: bool,
        hang: bool,
        inserts: AtomicUsize,
    }

    impl PrimaryStore for FakePrimary {
        async fn insert(&self, _record: &ObservationRecord) -> Result<(), PrimaryWriteFailure> {
            self.inserts.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                std::future::pending::<()>().await;
            }
            if self.fail {
                return Err(PrimaryWriteFailure::Encode("schema mismatch".to_string()));
            }
            Ok(())
        }
    }

    fn sink(dir: &tempfile::TempDir, primary: Option<FakePrimary>) -> WriteSink<FakePrimary> {
        WriteSink::new(
            primary,
            Duration::from_secs(5),
            LocalStore::new(dir.path().join("local_data.json")),
        )
    }

    #[tokio::test]
    async fn primary_success_leaves_local_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let sink = sink(&dir, Some(FakePrimary::default()));

        let outcome = sink.write(&record(RecordType::StopRecord, "a")).await.unwrap();

        assert!(matches!(outcome, WriteOutcome::Primary));
        assert!(!sink.local().path().exists());
    }

    #[tokio::test]
    async fn primary_failure_falls_back_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let sink = sink(
            &dir,
            Some(FakePrimary {
                fail: true,
                ..Default::default()
            }),
        );

        let outcome = sink.write(&record(RecordType::StopRecord, "a")).await.unwrap();
        assert!(matches!(outcome, WriteOutcome::Fallback { .. }));
        assert_eq!(sink.primary.as_ref().unwrap().inserts.load(Ordering::SeqCst), 1);

        let data = sink.local().read().await.unwrap();
        assert_eq!(ids(&data.stop_confirmations), vec!["a"]);
        assert!(data.location_updates.is_empty());
        assert_eq!(data.stop_confirmations[0]["type"], "STOP_RECORD");
    }

    #[tokio::test(start_paused = true)]
    async fn hung_primary_times_out_into_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let sink = sink(
            &dir,
            Some(FakePrimary {
                hang: true,
                ..Default::default()
            }),
        );

        let outcome = sink.write(&record(RecordType::LocationRecord, "slow")).await.unwrap();
        assert!(matches!(
            outcome,
            WriteOutcome::Fallback {
                cause: PrimaryWriteFailure::Timeout(_)
            }
        ));
        assert_eq!(ids(&sink.local().read().await.unwrap().location_updates), vec!["slow"]);
    }

    #[tokio::test]
    async fn disabled_primary_goes_straight_to_local() {
        let dir = tempfile::tempdir().unwrap();
        let sink = sink(&dir, None);
        assert!(!sink.primary_enabled());

        sink.write(&record(RecordType::StopRecord, "s")).await.unwrap();
        let outcome = sink.write(&record(RecordType::LocationRecord, "l")).await.unwrap();
        assert!(matches!(outcome, WriteOutcome::Local));

        let data = sink.local().read().await.unwrap();
        assert_eq!(ids(&data.stop_confirmations), vec!["s"]);
        assert_eq!(ids(&data.location_updates), vec!["l"]);
    }

    fn backups(dir: &tempfile::TempDir) -> Vec<PathBuf> {
        let mut found: Vec<PathBuf> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with("local_data.json.corrupt-"))
            })
            .collect();
        found.sort();
        found
    }

    #[tokio::test]
    async fn corrupt_file_is_backed_up_and_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path().join("local_data.json"));
        std::fs::write(store.path(), "{\"stop_confirmations\": [").unwrap();

        store.append(&record(RecordType::StopRecord, "fresh")).await.unwrap();

        assert_eq!(ids(&store.read().await.unwrap().stop_confirmations), vec!["fresh"]);
        let saved = backups(&dir);
        assert_eq!(saved.len(), 1);
        assert_eq!(std::fs::read_to_string(&saved[0]).unwrap(), "{\"stop_confirmations\": [");
    }

    #[tokio::test]
    async fn non_utf8_file_is_backed_up_byte_for_byte() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path().join("local_data.json"));
        let original = b"{\"stop_confirmations\":[{\"id\":\"old-1\",\"stop_name\":\"Caf\xE9\"}],\"location_updates\":[]}";
        std::fs::write(store.path(), original).unwrap();

        store.append(&record(RecordType::StopRecord, "new")).await.unwrap();

        assert_eq!(ids(&store.read().await.unwrap().stop_confirmations), vec!["new"]);
        let saved = backups(&dir);
        assert_eq!(saved.len(), 1);
        assert_eq!(std::fs::read(&saved[0]).unwrap(), original.to_vec());
    }

    #[tokio::test]
    async fn repeated_corruption_keeps_every_backup() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path().join("local_data.json"));

        std::fs::write(store.path(), "first garbage").unwrap();
        store.append(&record(RecordType::StopRecord, "a")).await.unwrap();
        std::fs::write(store.path(), "second garbage").unwrap();
        store.append(&record(RecordType::StopRecord, "b")).await.unwrap();

        let mut contents: Vec<String> = backups(&dir)
            .iter()
            .map(|path| std::fs::read_to_string(path).unwrap())
            .collect();
        contents.sort();
        assert_eq!(contents, vec!["first garbage", "second garbage"]);
    }

    #[tokio::test]
    async fn failed_backup_leaves_original_in_place() {
        let dir = tempfile::tempdir().unwrap();
        // Fits NAME_MAX itself, but not once the backup suffix is added.
        let path = dir.path().join(format!("{}.json", "d".repeat(230)));
        std::fs::write(&path, "not json").unwrap();
        let store = LocalStore::new(&path);

        let err = store
            .append(&record(RecordType::StopRecord, "new"))
            .await
            .unwrap_err();

        assert!(matches!(err, LocalStoreFailure::Io { .. }));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "not json");
    }

    #[tokio::test]
    async fn unreadable_path_is_an_error_not_a_reset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("local_data.json");
        std::fs::create_dir(&path).unwrap();
        let store = LocalStore::new(&path);

        let err = store
            .append(&record(RecordType::StopRecord, "new"))
            .await
            .unwrap_err();
        assert!(matches!(err, LocalStoreFailure::Io { .. }));
        assert!(path.is_dir());
        assert!(backups(&dir).is_empty());
    }

    #[tokio::test]
    async fn empty_file_is_an_empty_baseline() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path().join("local_data.json"));
        std::fs::write(store.path(), "  \n").unwrap();

        store.append(&record(RecordType::LocationRecord, "x")).await.unwrap();
        assert_eq!(ids(&store.read().await.unwrap().location_updates), vec!["x"]);
    }

    #[tokio::test]
    async fn existing_entries_and_keys_are_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path().join("local_data.json"));
        std::fs::write(
            store.path(),
            serde_json::json!({
                "stop_confirmations": [{"route_id": "legacy", "latitude": 1.0}],
                "notes": "kept"
            })
            .to_string(),
        )
        .unwrap();

        store.append(&record(RecordType::StopRecord, "new")).await.unwrap();

        let data = store.read().await.unwrap();
        assert_eq!(data.stop_confirmations.len(), 2);
        assert_eq!(data.stop_confirmations[0]["route_id"], "legacy");
        assert_eq!(data.other["notes"], "kept");
        assert!(!dir.path().join("local_data.json.tmp").exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_appends_are_not_lost() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalStore::new(dir.path().join("local_data.json")));

        let handles: Vec<_> = (0..40)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    let kind = if i % 2 == 0 {
                        RecordType::StopRecord
                    } else {
                        RecordType::LocationRecord
                    };
                    store.append(&record(kind, &format!("r{i}"))).await
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let data = store.read().await.unwrap();
        assert_eq!(data.stop_confirmations.len(), 20);
        assert_eq!(data.location_updates.len(), 20);
    }

    #[tokio::test]
    async fn unwritable_location_surfaces_local_failure() {
        let dir = tempfile::tempdir().unwrap();
        let sink: WriteSink<FakePrimary> = WriteSink::new(
            Some(FakePrimary {
                fail: true,
                ..Default::default()
            }),
            Duration::from_secs(5),
            LocalStore::new(dir.path().join("missing-dir").join("local_data.json")),
        );

        let err = sink.write(&record(RecordType::StopRecord, "lost")).await.unwrap_err();
        assert!(matches!(err, LocalStoreFailure::Io { .. }));
    }

    fn clickhouse_for(server: &MockServer) -> ClickHouseStore {
        ClickHouseStore::new(ClickHouseConfig {
            url: server.uri(),
            user: "writer".to_string(),
            password: "pw".to_string(),
            database: "survey".to_string(),
            table: "observations".to_string(),
            timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn clickhouse_insert_posts_json_each_row() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(query_param("query", "INSERT INTO survey.observations FORMAT JSONEachRow"))
            .and(header("X-ClickHouse-User", "writer"))
            .and(header("X-ClickHouse-Key", "pw"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let store = clickhouse_for(&server);
        store.insert(&record(RecordType::StopRecord, "ch-1")).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let row: Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(row["id"], "ch-1");
        assert_eq!(row["type"], "STOP_RECORD");
        assert_eq!(row["user_id"], "alice");
        assert!(row["device_id"].is_null());
    }

    #[tokio::test]
    async fn clickhouse_error_status_falls_back_through_sink() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("Code: 60. Table does not exist"))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let sink = WriteSink::new(
            Some(clickhouse_for(&server)),
            Duration::from_secs(5),
            LocalStore::new(dir.path().join("local_data.json")),
        );

        let outcome = sink.write(&record(RecordType::LocationRecord, "ch-2")).await.unwrap();
        match outcome {
            WriteOutcome::Fallback {
                cause: PrimaryWriteFailure::Rejected { status, body },
            } => {
                assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
                assert!(body.contains("Table does not exist"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(ids(&sink.local().read().await.unwrap().location_updates), vec!["ch-2"]);
    }

    #[test]
    fn create_table_targets_configured_table() {
        let store = ClickHouseStore::new(ClickHouseConfig {
            url: "http://localhost:8123".to_string(),
            user: "default".to_string(),
            password: String::new(),
            database: "survey".to_string(),
            table: "obs".to_string(),
            timeout: Duration::from_secs(1),
        })
        .unwrap();

        let sql = store.create_table_sql();
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS survey.obs ("));
        assert!(sql.contains("ORDER BY (timestamp, id)"));
    }
}
