use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use crate::config::{StoreBackendKind, StoreConfig};
use crate::errors::WriteError;
use crate::http_client::build_client;

const CACHE_DIR: &str = "aoe4_meta_sync";
const JOURNAL_FILE: &str = "seen_keys.json";
const JOURNAL_VERSION: u32 = 1;
const JOURNAL_KEYS_MAX: usize = 8192;

const RETRY_BASE_MS: u64 = 400;
const RETRY_JITTER_MS: u64 = 200;

pub type RecordId = String;

/// Row creation against the external tabular store. Both backends carry the
/// same semantics; transport choice is a configuration detail.
pub trait PersistenceClient: Send + Sync {
    fn create(&self, table: &str, fields: &Value) -> Result<RecordId, WriteError>;

    fn backend_name(&self) -> &'static str;
}

pub fn make_backend(cfg: &StoreConfig) -> Result<Box<dyn PersistenceClient>> {
    match cfg.backend {
        StoreBackendKind::Rest => Ok(Box::new(RestBackend::new(cfg)?)),
        StoreBackendKind::Helper => Ok(Box::new(HelperBackend::new(cfg))),
    }
}

/// Direct writes to the Airtable REST API.
pub struct RestBackend {
    client: Client,
    api_base: String,
    base_id: String,
    token: String,
}

impl RestBackend {
    pub fn new(cfg: &StoreConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(30).context("failed to build store client")?,
            api_base: cfg.api_base.trim_end_matches('/').to_string(),
            base_id: cfg.base_id.clone(),
            token: cfg.token.clone(),
        })
    }

    fn table_url(&self, table: &str) -> String {
        // Table names contain spaces; nothing else needs escaping here.
        format!(
            "{}/{}/{}",
            self.api_base,
            self.base_id,
            table.replace(' ', "%20")
        )
    }
}

impl PersistenceClient for RestBackend {
    fn create(&self, table: &str, fields: &Value) -> Result<RecordId, WriteError> {
        let resp = self
            .client
            .post(self.table_url(table))
            .bearer_auth(&self.token)
            .json(&json!({ "fields": fields }))
            .send()
            .map_err(|err| WriteError::Transport(format!("request failed: {err}")))?;

        let status = resp.status();
        let body = resp
            .text()
            .map_err(|err| WriteError::Transport(format!("failed reading body: {err}")))?;

        if !status.is_success() {
            return Err(classify_write_status(status, &body));
        }

        #[derive(Deserialize)]
        struct CreateResponse {
            id: String,
        }

        let parsed: CreateResponse = serde_json::from_str(&body)
            .map_err(|err| WriteError::Server(format!("unparseable create response: {err}")))?;
        Ok(parsed.id)
    }

    fn backend_name(&self) -> &'static str {
        "rest"
    }
}

fn classify_write_status(status: StatusCode, body: &str) -> WriteError {
    let snippet = body_snippet(body);
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            WriteError::Auth(format!("http {status}: {snippet}"))
        }
        StatusCode::UNPROCESSABLE_ENTITY => {
            WriteError::SchemaMismatch(format!("http {status}: {snippet}"))
        }
        StatusCode::TOO_MANY_REQUESTS => WriteError::RateLimited,
        _ => WriteError::Server(format!("http {status}: {snippet}")),
    }
}

fn body_snippet(body: &str) -> String {
    body.trim()
        .replace('\n', " ")
        .replace('\r', " ")
        .chars()
        .take(220)
        .collect()
}

/// Writes through the trusted helper CLI instead of talking to the store
/// directly; the helper owns the credential exchange.
pub struct HelperBackend {
    program: String,
    base_id: String,
}

impl HelperBackend {
    pub fn new(cfg: &StoreConfig) -> Self {
        Self {
            program: cfg.helper_program.clone(),
            base_id: cfg.base_id.clone(),
        }
    }
}

impl PersistenceClient for HelperBackend {
    fn create(&self, table: &str, fields: &Value) -> Result<RecordId, WriteError> {
        let input = json!({
            "baseId": self.base_id,
            "tableId": table,
            "fields": fields,
        });

        let output = Command::new(&self.program)
            .args([
                "tool",
                "call",
                "create_record",
                "--server",
                "airtable",
                "--input",
                &input.to_string(),
            ])
            .output()
            .map_err(|err| {
                WriteError::Transport(format!("failed to spawn {}: {err}", self.program))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_helper_failure(&stderr));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stdout = stdout.trim();
        if let Ok(value) = serde_json::from_str::<Value>(stdout)
            && let Some(id) = value.get("id").and_then(Value::as_str)
        {
            return Ok(id.to_string());
        }
        if stdout.is_empty() {
            return Err(WriteError::Server("helper returned no record id".to_string()));
        }
        Ok(stdout.to_string())
    }

    fn backend_name(&self) -> &'static str {
        "helper"
    }
}

fn classify_helper_failure(stderr: &str) -> WriteError {
    let lower = stderr.to_ascii_lowercase();
    let snippet = body_snippet(stderr);
    if lower.contains("401") || lower.contains("403") || lower.contains("unauthorized") {
        WriteError::Auth(snippet)
    } else if lower.contains("422") || lower.contains("unknown field") || lower.contains("schema") {
        WriteError::SchemaMismatch(snippet)
    } else if lower.contains("429") || lower.contains("rate limit") {
        WriteError::RateLimited
    } else {
        WriteError::Server(snippet)
    }
}

/// Bounded retries with backoff for retryable subtypes only. Auth and
/// schema failures return immediately.
pub fn create_with_retry(
    client: &dyn PersistenceClient,
    table: &str,
    fields: &Value,
    max_attempts: u32,
) -> Result<RecordId, WriteError> {
    let max_attempts = max_attempts.max(1);
    let mut last_err = None;
    for attempt in 0..max_attempts {
        if attempt > 0 {
            std::thread::sleep(backoff_delay(attempt));
        }
        match client.create(table, fields) {
            Ok(id) => return Ok(id),
            Err(err) if err.is_retryable() && attempt + 1 < max_attempts => {
                log::debug!("write attempt {} to {table} failed: {err}", attempt + 1);
                last_err = Some(err);
            }
            Err(err) => return Err(err),
        }
    }
    Err(last_err.unwrap_or_else(|| WriteError::Server("no write attempts made".to_string())))
}

fn backoff_delay(attempt: u32) -> Duration {
    let base = RETRY_BASE_MS * (1u64 << attempt.min(6));
    let jitter = rand::thread_rng().gen_range(0..RETRY_JITTER_MS);
    Duration::from_millis(base + jitter)
}

/// Stable key for one logical write: same table, entity, patch and capture
/// bucket always hash identically.
pub fn idempotency_key(table: &str, entity_key: &str, patch: &str, bucket: &str) -> String {
    let mut hasher = Sha256::new();
    for part in [table, entity_key, patch, bucket] {
        hasher.update(part.as_bytes());
        hasher.update([0x1f]);
    }
    hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Created,
    /// The key was already written this run or by an earlier run.
    Duplicate,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct JournalFile {
    version: u32,
    keys: Vec<String>,
}

struct SeenKeys {
    order: Vec<String>,
    set: HashSet<String>,
}

/// Wraps a backend with at-most-once semantics per idempotency key. The
/// in-memory set guarantees dedup within a run; the journal file extends it
/// across runs on a best-effort basis (the store itself only offers blind
/// creation).
pub struct IdempotentWriter {
    inner: Box<dyn PersistenceClient>,
    write_attempts: u32,
    seen: Mutex<SeenKeys>,
    journal_path: Option<PathBuf>,
}

impl IdempotentWriter {
    pub fn new(inner: Box<dyn PersistenceClient>, write_attempts: u32) -> Self {
        let journal_path = journal_path();
        let keys = journal_path
            .as_deref()
            .map(load_journal)
            .unwrap_or_default();
        Self::with_journal(inner, write_attempts, keys, journal_path)
    }

    /// No journal file; dedup only lives for this writer's lifetime.
    pub fn without_journal(inner: Box<dyn PersistenceClient>, write_attempts: u32) -> Self {
        Self::with_journal(inner, write_attempts, Vec::new(), None)
    }

    fn with_journal(
        inner: Box<dyn PersistenceClient>,
        write_attempts: u32,
        keys: Vec<String>,
        journal_path: Option<PathBuf>,
    ) -> Self {
        let set = keys.iter().cloned().collect();
        Self {
            inner,
            write_attempts,
            seen: Mutex::new(SeenKeys { order: keys, set }),
            journal_path,
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.inner.backend_name()
    }

    pub fn create(&self, table: &str, fields: &Value, key: &str) -> Result<WriteOutcome, WriteError> {
        {
            let mut seen = self.seen.lock().expect("seen-key lock poisoned");
            if seen.set.contains(key) {
                return Ok(WriteOutcome::Duplicate);
            }
            // Reserve the key before writing so a concurrent worker with the
            // same key cannot double-create.
            seen.set.insert(key.to_string());
            seen.order.push(key.to_string());
        }

        match create_with_retry(&*self.inner, table, fields, self.write_attempts) {
            Ok(_) => {
                self.flush_journal();
                Ok(WriteOutcome::Created)
            }
            Err(err) => {
                // Release the reservation; a later run should retry this key.
                let mut seen = self.seen.lock().expect("seen-key lock poisoned");
                seen.set.remove(key);
                seen.order.retain(|k| k != key);
                Err(err)
            }
        }
    }

    fn flush_journal(&self) {
        let Some(path) = self.journal_path.as_deref() else {
            return;
        };
        let keys = {
            let mut seen = self.seen.lock().expect("seen-key lock poisoned");
            if seen.order.len() > JOURNAL_KEYS_MAX {
                let drop = seen.order.len() - JOURNAL_KEYS_MAX;
                let drained: Vec<String> = seen.order.drain(..drop).collect();
                for key in drained {
                    seen.set.remove(&key);
                }
            }
            seen.order.clone()
        };
        if let Err(err) = save_journal(path, &keys) {
            log::warn!("failed to persist idempotency journal: {err}");
        }
    }
}

fn load_journal(path: &std::path::Path) -> Vec<String> {
    let Ok(raw) = fs::read_to_string(path) else {
        return Vec::new();
    };
    let journal = serde_json::from_str::<JournalFile>(&raw).unwrap_or_default();
    if journal.version != JOURNAL_VERSION {
        return Vec::new();
    }
    journal.keys
}

fn save_journal(path: &std::path::Path, keys: &[String]) -> Result<()> {
    let Some(dir) = path.parent() else {
        return Ok(());
    };
    fs::create_dir_all(dir).ok();
    let journal = JournalFile {
        version: JOURNAL_VERSION,
        keys: keys.to_vec(),
    };
    let json = serde_json::to_string(&journal).context("serialize idempotency journal")?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).context("write idempotency journal")?;
    fs::rename(&tmp, path).context("swap idempotency journal")?;
    Ok(())
}

fn journal_path() -> Option<PathBuf> {
    if let Ok(base) = std::env::var("XDG_CACHE_HOME")
        && !base.trim().is_empty()
    {
        return Some(PathBuf::from(base).join(CACHE_DIR).join(JOURNAL_FILE));
    }
    let home = std::env::var("HOME").ok()?;
    if home.trim().is_empty() {
        return None;
    }
    Some(
        PathBuf::from(home)
            .join(".cache")
            .join(CACHE_DIR)
            .join(JOURNAL_FILE),
    )
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    struct FakeBackend {
        rows: Mutex<Vec<(String, Value)>>,
        fail_with: Mutex<Option<WriteError>>,
    }

    impl FakeBackend {
        fn new() -> Self {
            Self {
                rows: Mutex::new(Vec::new()),
                fail_with: Mutex::new(None),
            }
        }
    }

    impl PersistenceClient for FakeBackend {
        fn create(&self, table: &str, fields: &Value) -> Result<RecordId, WriteError> {
            if let Some(err) = self.fail_with.lock().unwrap().take() {
                return Err(err);
            }
            let mut rows = self.rows.lock().unwrap();
            rows.push((table.to_string(), fields.clone()));
            Ok(format!("rec{}", rows.len()))
        }

        fn backend_name(&self) -> &'static str {
            "fake"
        }
    }

    #[test]
    fn idempotency_key_is_stable_and_bucket_sensitive() {
        let a = idempotency_key("t", "mongols|rm_solo|All Ranks", "12.1", "2026-08-06T14");
        let b = idempotency_key("t", "mongols|rm_solo|All Ranks", "12.1", "2026-08-06T14");
        let c = idempotency_key("t", "mongols|rm_solo|All Ranks", "12.1", "2026-08-06T15");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn key_components_do_not_collide_across_field_boundaries() {
        let a = idempotency_key("t", "ab", "c", "d");
        let b = idempotency_key("t", "a", "bc", "d");
        assert_ne!(a, b);
    }

    #[test]
    fn duplicate_keys_write_once() {
        let writer = IdempotentWriter::without_journal(Box::new(FakeBackend::new()), 1);
        let fields = json!({"civilization": "Mongols"});
        assert_eq!(
            writer.create("t", &fields, "k1").unwrap(),
            WriteOutcome::Created
        );
        assert_eq!(
            writer.create("t", &fields, "k1").unwrap(),
            WriteOutcome::Duplicate
        );
        assert_eq!(
            writer.create("t", &fields, "k2").unwrap(),
            WriteOutcome::Created
        );
    }

    #[test]
    fn failed_write_releases_the_key() {
        let backend = FakeBackend::new();
        *backend.fail_with.lock().unwrap() = Some(WriteError::Server("500".into()));
        let writer = IdempotentWriter::without_journal(Box::new(backend), 1);
        let fields = json!({});
        assert!(writer.create("t", &fields, "k1").is_err());
        // Backend recovers; same key must be attempted again.
        assert_eq!(
            writer.create("t", &fields, "k1").unwrap(),
            WriteOutcome::Created
        );
    }

    #[test]
    fn retry_wrapper_survives_one_transient_failure() {
        let backend = FakeBackend::new();
        *backend.fail_with.lock().unwrap() = Some(WriteError::RateLimited);
        let id = create_with_retry(&backend, "t", &json!({}), 3).unwrap();
        assert_eq!(id, "rec1");
    }

    #[test]
    fn fatal_errors_are_not_retried() {
        let backend = FakeBackend::new();
        *backend.fail_with.lock().unwrap() = Some(WriteError::Auth("401".into()));
        let err = create_with_retry(&backend, "t", &json!({}), 3).unwrap_err();
        assert!(matches!(err, WriteError::Auth(_)));
        assert!(backend.rows.lock().unwrap().is_empty());
    }

    #[test]
    fn rest_status_mapping_matches_the_taxonomy() {
        assert!(matches!(
            classify_write_status(StatusCode::UNAUTHORIZED, ""),
            WriteError::Auth(_)
        ));
        assert!(matches!(
            classify_write_status(StatusCode::FORBIDDEN, ""),
            WriteError::Auth(_)
        ));
        assert!(matches!(
            classify_write_status(StatusCode::UNPROCESSABLE_ENTITY, ""),
            WriteError::SchemaMismatch(_)
        ));
        assert!(matches!(
            classify_write_status(StatusCode::TOO_MANY_REQUESTS, ""),
            WriteError::RateLimited
        ));
        assert!(matches!(
            classify_write_status(StatusCode::INTERNAL_SERVER_ERROR, ""),
            WriteError::Server(_)
        ));
    }

    #[test]
    fn helper_stderr_classification() {
        assert!(matches!(
            classify_helper_failure("error: 401 Unauthorized"),
            WriteError::Auth(_)
        ));
        assert!(matches!(
            classify_helper_failure("Unknown field name: patch"),
            WriteError::SchemaMismatch(_)
        ));
        assert!(matches!(
            classify_helper_failure("429 rate limit exceeded"),
            WriteError::RateLimited
        ));
        assert!(matches!(
            classify_helper_failure("boom"),
            WriteError::Server(_)
        ));
    }
}
