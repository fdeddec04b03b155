//! HMAC-chained audit journal for task transitions
//!
//! Append-only JSON lines. Each entry signs the previous entry's hash, so
//! removing, reordering or editing a line breaks the chain.

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose, Engine as _};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use taskd_common::TaskId;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalEvent {
    Enqueue,
    Dispatch,
    Confirm,
    ConfirmIgnored,
    Reclaim,
    Observation,
}

impl JournalEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            JournalEvent::Enqueue => "ENQUEUE",
            JournalEvent::Dispatch => "DISPATCH",
            JournalEvent::Confirm => "CONFIRM",
            JournalEvent::ConfirmIgnored => "CONFIRM_IGNORED",
            JournalEvent::Reclaim => "RECLAIM",
            JournalEvent::Observation => "OBSERVATION",
        }
    }
}

/// Journal entry with HMAC chain
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct JEntry {
    pub seq: u64,
    pub ts: i64,
    pub event: String,
    pub task_id: u64,
    pub identity: String,
    pub meta: serde_json::Value,
    pub prev: String, // previous entry hash (base64)
    pub hash: String, // this entry hash (base64)
}

struct Head {
    file: File,
    seq: u64,
    last_hash: String,
}

pub struct Journal {
    path: PathBuf,
    key: Vec<u8>,
    head: Mutex<Head>,
}

impl Journal {
    /// Opens or creates the journal, continuing the chain after the last
    /// entry already on disk.
    pub fn open(path: impl AsRef<Path>, key: &[u8]) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating journal directory {}", parent.display()))?;
        }

        let (seq, last_hash) = match last_entry(&path)? {
            Some(entry) => (entry.seq, entry.hash),
            None => (0, String::new()),
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening journal {}", path.display()))?;

        Ok(Self {
            path,
            key: key.to_vec(),
            head: Mutex::new(Head {
                file,
                seq,
                last_hash,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(
        &self,
        event: JournalEvent,
        task_id: TaskId,
        identity: &str,
        meta: serde_json::Value,
    ) -> Result<String> {
        let mut head = self
            .head
            .lock()
            .map_err(|_| anyhow!("journal lock poisoned"))?;

        let mut entry = JEntry {
            seq: head.seq + 1,
            ts: chrono::Utc::now().timestamp(),
            event: event.as_str().to_string(),
            task_id: task_id.0,
            identity: identity.to_string(),
            meta,
            prev: head.last_hash.clone(),
            hash: String::new(),
        };
        entry.hash = sign(&self.key, &entry)?;

        let line = serde_json::to_string(&entry)? + "\n";
        head.file.write_all(line.as_bytes())?;
        head.file.sync_data()?;

        head.seq = entry.seq;
        head.last_hash = entry.hash.clone();
        Ok(entry.hash)
    }

    pub fn current_seq(&self) -> u64 {
        self.head.lock().map(|head| head.seq).unwrap_or_default()
    }
}

/// Journal verification utility
pub struct JournalVerifier {
    key: Vec<u8>,
}

impl JournalVerifier {
    pub fn new(key: &[u8]) -> Self {
        Self { key: key.to_vec() }
    }

    /// Returns `Ok(false)` on the first broken link; I/O failures are errors.
    pub fn verify_file(&self, path: impl AsRef<Path>) -> Result<bool> {
        let reader = BufReader::new(File::open(path.as_ref())?);

        let mut prev_hash = String::new();
        let mut expected_seq = 1u64;

        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }

            let Ok(entry) = serde_json::from_str::<JEntry>(&line) else {
                return Ok(false);
            };
            if entry.seq != expected_seq || entry.prev != prev_hash {
                return Ok(false);
            }
            if entry.hash != sign(&self.key, &entry)? {
                return Ok(false);
            }

            prev_hash = entry.hash;
            expected_seq += 1;
        }

        Ok(true)
    }
}

/// HMAC(key, prev || canonical || meta)
fn sign(key: &[u8], entry: &JEntry) -> Result<String> {
    let canonical = format!(
        "{}|{}|{}|{}|{}",
        entry.seq, entry.ts, entry.event, entry.task_id, entry.identity
    );

    let mut mac = HmacSha256::new_from_slice(key)?;
    mac.update(entry.prev.as_bytes());
    mac.update(canonical.as_bytes());
    mac.update(serde_json::to_string(&entry.meta)?.as_bytes());
    Ok(general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
}

fn last_entry(path: &Path) -> Result<Option<JEntry>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };

    let mut last = None;
    for line in BufReader::new(file).lines() {
        let line = line?;
        if !line.trim().is_empty() {
            last = Some(line);
        }
    }

    match last {
        Some(line) => {
            let entry = serde_json::from_str(&line)
                .with_context(|| format!("corrupt journal tail in {}", path.display()))?;
            Ok(Some(entry))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    const KEY: &[u8] = b"test-key-123";

    #[test]
    fn test_journal_basic() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("audit.jsonl");
        let journal = Journal::open(&path, KEY)?;

        let hash1 = journal.append(
            JournalEvent::Dispatch,
            TaskId(42),
            "HOST1",
            json!({"type": "message"}),
        )?;
        let hash2 = journal.append(
            JournalEvent::Confirm,
            TaskId(42),
            "HOST1",
            json!({"status": "success"}),
        )?;

        assert_ne!(hash1, hash2);
        assert_eq!(journal.current_seq(), 2);
        assert!(JournalVerifier::new(KEY).verify_file(&path)?);
        assert!(!JournalVerifier::new(b"other-key").verify_file(&path)?);
        Ok(())
    }

    #[test]
    fn test_journal_reopen_continues_chain() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("nested").join("audit.jsonl");

        {
            let journal = Journal::open(&path, KEY)?;
            journal.append(JournalEvent::Enqueue, TaskId(1), "admin", json!({}))?;
            journal.append(JournalEvent::Dispatch, TaskId(1), "HOST1", json!({}))?;
        }

        let journal = Journal::open(&path, KEY)?;
        assert_eq!(journal.current_seq(), 2);
        journal.append(JournalEvent::Reclaim, TaskId(1), "HOST1", json!({}))?;
        assert_eq!(journal.current_seq(), 3);
        assert!(JournalVerifier::new(KEY).verify_file(&path)?);
        Ok(())
    }

    #[test]
    fn test_journal_tamper_detection() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("audit.jsonl");
        let journal = Journal::open(&path, KEY)?;
        journal.append(
            JournalEvent::Confirm,
            TaskId(43),
            "HOST1",
            json!({"status": "error"}),
        )?;
        journal.append(JournalEvent::Dispatch, TaskId(44), "HOST1", json!({}))?;

        let pristine = std::fs::read_to_string(&path)?;
        let edited = pristine.replacen("\"error\"", "\"success\"", 1);
        assert_ne!(pristine, edited);
        std::fs::write(&path, edited)?;
        assert!(!JournalVerifier::new(KEY).verify_file(&path)?);

        // Dropping the first line breaks sequence and chain as well.
        let truncated: String = pristine.lines().skip(1).map(|l| format!("{l}\n")).collect();
        std::fs::write(&path, truncated)?;
        assert!(!JournalVerifier::new(KEY).verify_file(&path)?);

        std::fs::write(&path, format!("{pristine}{{\"seq\":3,\"hash\":\"invalid\"}}\n"))?;
        assert!(!JournalVerifier::new(KEY).verify_file(&path)?);
        Ok(())
    }
}
