use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use thiserror::Error;

use landcase_core::{CaseRecord, CaseStatus};

use crate::sites::SiteLink;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("case not found: {0}")]
    NotFound(String),
    #[error("case already exists: {0}")]
    Conflict(String),
    #[error("illegal status transition for {id}: {from} -> {to}")]
    IllegalTransition {
        id: String,
        from: CaseStatus,
        to: CaseStatus,
    },
    #[error("io error: {0}")]
    Io(String),
    #[error("serialize error: {0}")]
    Serialize(String),
}

/// Keyed persistence of case records and site links. Implementations must
/// make `insert_new` atomic and unique on id: exactly one of two racing
/// creators wins, the loser sees `Conflict` and re-reads.
pub trait CaseStore: Send + Sync {
    fn insert_new(&self, record: &CaseRecord) -> Result<(), StoreError>;
    fn get(&self, id: &str) -> Result<Option<CaseRecord>, StoreError>;
    fn list(&self) -> Result<Vec<CaseRecord>, StoreError>;
    /// Persist a lifecycle advance; rejects backward transitions.
    fn update_status(&self, id: &str, status: CaseStatus) -> Result<CaseRecord, StoreError>;
    fn set_create_task(&self, id: &str, task_id: &str) -> Result<CaseRecord, StoreError>;
    fn set_run_task(&self, id: &str, task_id: &str) -> Result<CaseRecord, StoreError>;
    fn remove(&self, id: &str) -> Result<Option<CaseRecord>, StoreError>;
    fn link_site(&self, link: &SiteLink) -> Result<(), StoreError>;
    fn remove_link(&self, link: &SiteLink) -> Result<(), StoreError>;
    fn unlink_case(&self, case_id: &str) -> Result<(), StoreError>;
    fn site_links(&self) -> Result<Vec<SiteLink>, StoreError>;
}

/// Filesystem-backed store: one JSON document per case under a root
/// directory, plus a single site-links document. Mutations take a per-case
/// lock file with stale takeover; writes are temp-file + rename.
#[derive(Clone, Debug)]
pub struct FsCaseStore {
    root: PathBuf,
}

const SITE_LINKS_FILE: &str = "site_links.json";
const SITE_LINKS_LOCK: &str = ".site_links.lock";

impl FsCaseStore {
    const LOCK_WAIT_TIMEOUT: Duration = Duration::from_secs(2);
    const LOCK_RETRY_DELAY: Duration = Duration::from_millis(5);
    const LOCK_STALE_AFTER: Duration = Duration::from_secs(30);

    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{id}.json"))
    }

    fn lock_path(&self, id: &str) -> PathBuf {
        self.root.join(format!(".{id}.lock"))
    }

    fn with_lock<T>(
        &self,
        lock_path: PathBuf,
        f: impl FnOnce() -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let lock = self.acquire_lock(lock_path)?;
        let result = f();
        drop(lock);
        result
    }

    fn acquire_lock(&self, lock_path: PathBuf) -> Result<StoreLock, StoreError> {
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| StoreError::Io(format!("create lock dir failed: {err}")))?;
        }

        let started = Instant::now();
        loop {
            match fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&lock_path)
            {
                Ok(mut file) => {
                    write_lock_metadata(&mut file)?;
                    return Ok(StoreLock {
                        path: lock_path,
                        file,
                    });
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    if lock_is_stale(&lock_path) {
                        match fs::remove_file(&lock_path) {
                            Ok(()) => continue,
                            Err(remove_err) if remove_err.kind() == ErrorKind::NotFound => continue,
                            Err(_) => {}
                        }
                    }
                    if started.elapsed() >= Self::LOCK_WAIT_TIMEOUT {
                        return Err(StoreError::Io(format!(
                            "store lock timed out: {}",
                            lock_path.to_string_lossy()
                        )));
                    }
                    thread::sleep(Self::LOCK_RETRY_DELAY);
                }
                Err(err) => {
                    return Err(StoreError::Io(format!(
                        "store lock failed at {}: {err}",
                        lock_path.to_string_lossy()
                    )))
                }
            }
        }
    }

    fn read_record(&self, id: &str) -> Result<Option<CaseRecord>, StoreError> {
        let path = self.record_path(id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StoreError::Io(format!("read case record failed: {err}"))),
        };
        serde_json::from_slice::<CaseRecord>(&bytes)
            .map(Some)
            .map_err(|err| StoreError::Serialize(format!("parse case record failed: {err}")))
    }

    /// Read, mutate, and atomically rewrite one record under its lock.
    fn mutate(
        &self,
        id: &str,
        f: impl FnOnce(&mut CaseRecord) -> Result<(), StoreError>,
    ) -> Result<CaseRecord, StoreError> {
        self.with_lock(self.lock_path(id), || {
            let mut record = self
                .read_record(id)?
                .ok_or_else(|| StoreError::NotFound(id.to_owned()))?;
            f(&mut record)?;
            let bytes = serde_json::to_vec(&record)
                .map_err(|err| StoreError::Serialize(format!("serialize case failed: {err}")))?;
            write_atomic_bytes(&self.record_path(id), &bytes)?;
            Ok(record)
        })
    }

    fn read_links(&self) -> Result<Vec<SiteLink>, StoreError> {
        let path = self.root.join(SITE_LINKS_FILE);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StoreError::Io(format!("read site links failed: {err}"))),
        };
        serde_json::from_slice(&bytes)
            .map_err(|err| StoreError::Serialize(format!("parse site links failed: {err}")))
    }

    fn write_links(&self, links: &[SiteLink]) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(links)
            .map_err(|err| StoreError::Serialize(format!("serialize site links failed: {err}")))?;
        write_atomic_bytes(&self.root.join(SITE_LINKS_FILE), &bytes)
    }

    fn mutate_links(
        &self,
        f: impl FnOnce(Vec<SiteLink>) -> Vec<SiteLink>,
    ) -> Result<(), StoreError> {
        self.with_lock(self.root.join(SITE_LINKS_LOCK), || {
            let links = self.read_links()?;
            self.write_links(&f(links))
        })
    }
}

impl CaseStore for FsCaseStore {
    /// Atomic insert-or-conflict: `create_new` makes the filesystem the
    /// arbiter of the dedup race, so two concurrent creators cannot both
    /// persist the same id.
    fn insert_new(&self, record: &CaseRecord) -> Result<(), StoreError> {
        fs::create_dir_all(&self.root)
            .map_err(|err| StoreError::Io(format!("create store root failed: {err}")))?;
        let bytes = serde_json::to_vec(record)
            .map_err(|err| StoreError::Serialize(format!("serialize case failed: {err}")))?;
        let mut file = match fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(self.record_path(&record.id))
        {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                return Err(StoreError::Conflict(record.id.clone()))
            }
            Err(err) => return Err(StoreError::Io(format!("insert case failed: {err}"))),
        };
        file.write_all(&bytes)
            .map_err(|err| StoreError::Io(format!("write case record failed: {err}")))?;
        file.sync_all()
            .map_err(|err| StoreError::Io(format!("sync case record failed: {err}")))
    }

    fn get(&self, id: &str) -> Result<Option<CaseRecord>, StoreError> {
        self.read_record(id)
    }

    fn list(&self) -> Result<Vec<CaseRecord>, StoreError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StoreError::Io(format!("list store root failed: {err}"))),
        };
        let mut records = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| StoreError::Io(format!("read dir entry failed: {err}")))?;
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(id) = name.strip_suffix(".json") else {
                continue;
            };
            if id == "site_links" {
                continue;
            }
            if let Some(record) = self.read_record(id)? {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.created_at_unix_ms.cmp(&b.created_at_unix_ms));
        Ok(records)
    }

    fn update_status(&self, id: &str, status: CaseStatus) -> Result<CaseRecord, StoreError> {
        self.mutate(id, |record| {
            if !record.status.can_advance_to(status) {
                return Err(StoreError::IllegalTransition {
                    id: record.id.clone(),
                    from: record.status,
                    to: status,
                });
            }
            record.status = status;
            Ok(())
        })
    }

    fn set_create_task(&self, id: &str, task_id: &str) -> Result<CaseRecord, StoreError> {
        self.mutate(id, |record| {
            record.create_task_id = Some(task_id.to_owned());
            Ok(())
        })
    }

    fn set_run_task(&self, id: &str, task_id: &str) -> Result<CaseRecord, StoreError> {
        self.mutate(id, |record| {
            record.run_task_id = Some(task_id.to_owned());
            Ok(())
        })
    }

    fn remove(&self, id: &str) -> Result<Option<CaseRecord>, StoreError> {
        self.with_lock(self.lock_path(id), || {
            let Some(record) = self.read_record(id)? else {
                return Ok(None);
            };
            fs::remove_file(self.record_path(id))
                .map_err(|err| StoreError::Io(format!("remove case record failed: {err}")))?;
            Ok(Some(record))
        })
    }

    fn link_site(&self, link: &SiteLink) -> Result<(), StoreError> {
        let link = link.clone();
        self.mutate_links(move |mut links| {
            links.retain(|existing| existing != &link);
            links.push(link);
            links
        })
    }

    fn remove_link(&self, link: &SiteLink) -> Result<(), StoreError> {
        let link = link.clone();
        self.mutate_links(move |mut links| {
            links.retain(|existing| existing != &link);
            links
        })
    }

    fn unlink_case(&self, case_id: &str) -> Result<(), StoreError> {
        let case_id = case_id.to_owned();
        self.mutate_links(move |mut links| {
            links.retain(|existing| existing.case_id != case_id);
            links
        })
    }

    fn site_links(&self) -> Result<Vec<SiteLink>, StoreError> {
        self.read_links()
    }
}

struct StoreLock {
    path: PathBuf,
    file: fs::File,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = self.file.sync_all();
        let _ = fs::remove_file(&self.path);
    }
}

fn write_lock_metadata(file: &mut fs::File) -> Result<(), StoreError> {
    let pid = std::process::id();
    let created_unix_ms = now_unix_millis();
    let payload = format!("{pid}:{created_unix_ms}\n");
    file.write_all(payload.as_bytes())
        .map_err(|err| StoreError::Io(format!("write lock metadata failed: {err}")))?;
    file.sync_all()
        .map_err(|err| StoreError::Io(format!("sync lock metadata failed: {err}")))?;
    Ok(())
}

fn lock_is_stale(path: &Path) -> bool {
    let now = now_unix_millis();
    let stale_window_ms = FsCaseStore::LOCK_STALE_AFTER.as_millis() as u64;

    if let Ok(raw) = fs::read_to_string(path) {
        if let Some(created_unix_ms) = parse_lock_created_unix_ms(&raw) {
            if now.saturating_sub(created_unix_ms) >= stale_window_ms {
                return true;
            }
        }
    }

    if let Ok(metadata) = fs::metadata(path) {
        if let Ok(modified_at) = metadata.modified() {
            if let Ok(elapsed) = modified_at.elapsed() {
                return elapsed >= FsCaseStore::LOCK_STALE_AFTER;
            }
        }
    }

    false
}

fn parse_lock_created_unix_ms(raw: &str) -> Option<u64> {
    let (_, ts) = raw.trim().split_once(':')?;
    ts.parse::<u64>().ok()
}

pub(crate) fn now_unix_millis() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis() as u64,
        Err(_) => 0,
    }
}

fn write_atomic_bytes(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let temp_path = temp_path_for(path);
    fs::write(&temp_path, bytes).map_err(|err| {
        StoreError::Io(format!(
            "write temp file failed at {}: {err}",
            temp_path.to_string_lossy()
        ))
    })?;
    if let Err(err) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(StoreError::Io(format!(
            "atomic rename failed {} -> {}: {err}",
            temp_path.to_string_lossy(),
            path.to_string_lossy()
        )));
    }
    Ok(())
}

fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("tmp");
    path.with_file_name(format!("{name}.tmp-{}", std::process::id()))
}
