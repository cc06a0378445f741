//! Exclusive locks over sets of repository paths.
//!
//! Leases are always tracked in memory. A manager built with
//! [`PathLockManager::persistent`] also records each lease as a locked file
//! under a shared directory, so deployers in different processes exclude
//! each other too. A lease file whose owner died is unlocked by the OS and
//! reclaimed by the next scan.

use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::budget::Backoff;
use crate::error::{Error, Result};

const REGISTRY_FILE: &str = ".registry.lock";
const LEASE_EXT: &str = "lease";

#[derive(Debug, Default)]
struct LockTable {
    held: Mutex<Vec<(u64, BTreeSet<String>)>>,
    next_id: AtomicU64,
    released: Notify,
    /// Lease directory shared with other processes, if any.
    dir: Option<PathBuf>,
}

/// Two paths conflict when they are equal or one is inside the other.
fn overlaps(a: &str, b: &str) -> bool {
    a == b
        || b.strip_prefix(a).is_some_and(|rest| rest.starts_with('/'))
        || a.strip_prefix(b).is_some_and(|rest| rest.starts_with('/'))
}

#[derive(Debug, Serialize, Deserialize)]
struct LeaseRecord {
    pid: u32,
    paths: BTreeSet<String>,
}

/// A lease file, locked for as long as it exists.
#[derive(Debug)]
struct DiskLease {
    path: PathBuf,
    file: File,
}

impl Drop for DiskLease {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                tracing::warn!(path = ?self.path, error = %e, "failed to remove lease file");
            }
        }
        let _ = FileExt::unlock(&self.file);
    }
}

/// Claims `paths` in the lease directory, or returns the paths other
/// processes hold that overlap them.
fn claim_on_disk(dir: &Path, paths: &BTreeSet<String>) -> Result<std::result::Result<DiskLease, Vec<String>>> {
    std::fs::create_dir_all(dir)?;
    let registry = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(dir.join(REGISTRY_FILE))?;
    // Held only for the scan below
    FileExt::lock_exclusive(&registry)?;

    let mut conflicts = BTreeSet::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().map_or(true, |ext| ext != LEASE_EXT) {
            continue;
        }
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        match FileExt::try_lock_shared(&file) {
            Ok(()) => {
                let _ = FileExt::unlock(&file);
                match std::fs::remove_file(&path) {
                    Ok(()) => tracing::info!(path = ?path, "reclaimed stale lease"),
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                let content = std::fs::read_to_string(&path)?;
                let record: LeaseRecord = serde_json::from_str(&content)
                    .map_err(|e| Error::Store(format!("corrupt lease file {}: {}", path.display(), e)))?;
                conflicts.extend(
                    record
                        .paths
                        .into_iter()
                        .filter(|held| paths.iter().any(|p| overlaps(p, held))),
                );
            }
            Err(e) => return Err(e.into()),
        }
    }

    if !conflicts.is_empty() {
        let _ = FileExt::unlock(&registry);
        return Ok(Err(conflicts.into_iter().collect()));
    }

    let path = dir.join(format!("{}.{}", uuid::Uuid::new_v4(), LEASE_EXT));
    let mut file = OpenOptions::new().create_new(true).read(true).write(true).open(&path)?;
    FileExt::lock_exclusive(&file)?;
    let record = LeaseRecord {
        pid: std::process::id(),
        paths: paths.clone(),
    };
    let json = serde_json::to_vec(&record)
        .map_err(|e| Error::Store(format!("failed to serialize lease: {}", e)))?;
    file.write_all(&json)?;
    file.flush()?;
    let _ = FileExt::unlock(&registry);

    Ok(Ok(DiskLease { path, file }))
}

/// Grants leases on path sets; overlapping sets are never held at once.
#[derive(Debug, Clone, Default)]
pub struct PathLockManager {
    table: Arc<LockTable>,
}

/// A held lock. Released on drop.
#[derive(Debug)]
pub struct PathLease {
    id: u64,
    paths: BTreeSet<String>,
    table: Arc<LockTable>,
    disk: Option<DiskLease>,
}

impl PathLease {
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.paths.iter().map(String::as_str)
    }
}

impl Drop for PathLease {
    fn drop(&mut self) {
        // Free the file first so woken waiters find the paths clear
        drop(self.disk.take());
        let mut held = self.table.held.lock().unwrap_or_else(|e| e.into_inner());
        held.retain(|(id, _)| *id != self.id);
        drop(held);
        self.table.released.notify_waiters();
        tracing::debug!(lease = self.id, paths = self.paths.len(), "released path lease");
    }
}

impl PathLockManager {
    /// A lock table private to this process.
    pub fn new() -> Self {
        Self::default()
    }

    /// A lock table that also excludes other processes using `dir`.
    pub fn persistent(dir: impl Into<PathBuf>) -> Self {
        Self {
            table: Arc::new(LockTable {
                dir: Some(dir.into()),
                ..LockTable::default()
            }),
        }
    }

    /// Takes the lease if no held lease overlaps, else returns the held
    /// paths that conflict.
    fn try_lock(&self, paths: &BTreeSet<String>) -> Result<std::result::Result<PathLease, Vec<String>>> {
        let mut held = self.table.held.lock().unwrap_or_else(|e| e.into_inner());
        let conflicts: BTreeSet<String> = held
            .iter()
            .flat_map(|(_, set)| set.iter())
            .filter(|h| paths.iter().any(|p| overlaps(p, h)))
            .cloned()
            .collect();
        if !conflicts.is_empty() {
            return Ok(Err(conflicts.into_iter().collect()));
        }

        let disk = match &self.table.dir {
            Some(dir) => match claim_on_disk(dir, paths)? {
                Ok(lease) => Some(lease),
                Err(conflicts) => return Ok(Err(conflicts)),
            },
            None => None,
        };

        let id = self.table.next_id.fetch_add(1, Ordering::Relaxed);
        held.push((id, paths.clone()));
        Ok(Ok(PathLease {
            id,
            paths: paths.clone(),
            table: Arc::clone(&self.table),
            disk,
        }))
    }

    pub fn try_acquire(&self, paths: &[String]) -> Option<PathLease> {
        match self.try_lock(&paths.iter().cloned().collect()) {
            Ok(lease) => lease.ok(),
            Err(e) => {
                tracing::warn!(error = %e, "failed to check lease directory");
                None
            }
        }
    }

    /// Waits up to `max_wait` for the paths to become free.
    ///
    /// Retries whenever a lease is released and at least every backoff
    /// interval. Returns [`Error::LockConflict`] naming the blocking paths
    /// when the wait runs out.
    pub async fn acquire(&self, paths: &[String], max_wait: Duration, mut backoff: Backoff) -> Result<PathLease> {
        let wanted: BTreeSet<String> = paths.iter().cloned().collect();
        let deadline = Instant::now() + max_wait;

        loop {
            let released = self.table.released.notified();
            tokio::pin!(released);
            // Register before checking so a release in between is not missed
            released.as_mut().enable();

            let conflicts = match self.try_lock(&wanted)? {
                Ok(lease) => return Ok(lease),
                Err(conflicts) => conflicts,
            };

            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(paths = ?wanted, conflicts = ?conflicts, "gave up waiting for path lock");
                return Err(Error::LockConflict { paths: conflicts });
            }

            let delay = backoff.next_delay().min(deadline - now);
            tracing::debug!(conflicts = ?conflicts, delay_ms = delay.as_millis() as u64, "path lock busy, deferring");
            tokio::select! {
                _ = &mut released => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Number of leases currently held.
    pub fn held(&self) -> usize {
        self.table.held.lock().map(|h| h.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicUsize;

    fn paths(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn backoff() -> Backoff {
        Backoff::new(Duration::from_millis(5), Duration::from_millis(20))
    }

    fn lease_files(dir: &Path) -> usize {
        std::fs::read_dir(dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter(|e| e.path().extension().is_some_and(|ext| ext == LEASE_EXT))
                    .count()
            })
            .unwrap_or(0)
    }

    #[test]
    fn overlap_rules() {
        assert!(overlaps("src/a.rs", "src/a.rs"));
        assert!(overlaps("src", "src/a.rs"));
        assert!(!overlaps("src/a.rs", "src/a.rs.bak"));
        assert!(!overlaps("src/a.rs", "src/b.rs"));
    }

    #[test]
    fn overlapping_sets_are_exclusive() {
        let locks = PathLockManager::new();
        let first = locks.try_acquire(&paths(&["a.py", "b.py"])).unwrap();
        assert!(locks.try_acquire(&paths(&["b.py", "c.py"])).is_none());
        assert!(locks.try_acquire(&paths(&["c.py"])).is_some());

        drop(first);
        assert!(locks.try_acquire(&paths(&["b.py", "c.py"])).is_some());
        assert_eq!(locks.held(), 0);
    }

    #[tokio::test]
    async fn waiter_proceeds_after_release() {
        let locks = PathLockManager::new();
        let first = locks.try_acquire(&paths(&["a.py"])).unwrap();

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                locks
                    .acquire(&paths(&["a.py"]), Duration::from_secs(5), backoff())
                    .await
                    .map(|lease| lease.paths().count())
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        drop(first);

        assert_eq!(waiter.await.unwrap().unwrap(), 1);
    }

    #[tokio::test]
    async fn wait_is_bounded() {
        let locks = PathLockManager::new();
        let _held = locks.try_acquire(&paths(&["a.py"])).unwrap();

        let err = locks
            .acquire(&paths(&["a.py", "z.py"]), Duration::from_millis(40), backoff())
            .await
            .unwrap_err();
        match err {
            Error::LockConflict { paths } => assert_eq!(paths, vec!["a.py".to_string()]),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn persistent_managers_exclude_each_other() {
        let dir = tempfile::TempDir::new().unwrap();
        let ours = PathLockManager::persistent(dir.path());
        let theirs = PathLockManager::persistent(dir.path());

        let lease = ours.try_acquire(&paths(&["src/a.py"])).unwrap();
        assert_eq!(lease_files(dir.path()), 1);
        assert!(theirs.try_acquire(&paths(&["src"])).is_none());
        assert!(theirs.try_acquire(&paths(&["src/b.py"])).is_some());

        drop(lease);
        assert_eq!(lease_files(dir.path()), 0);
        assert!(theirs.try_acquire(&paths(&["src/a.py"])).is_some());
    }

    #[tokio::test]
    async fn persistent_wait_reports_foreign_holder() {
        let dir = tempfile::TempDir::new().unwrap();
        let _held = PathLockManager::persistent(dir.path())
            .try_acquire(&paths(&["a.py"]))
            .unwrap();

        let err = PathLockManager::persistent(dir.path())
            .acquire(&paths(&["a.py"]), Duration::from_millis(40), backoff())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LockConflict { paths } if paths == vec!["a.py".to_string()]));
    }

    #[test]
    fn abandoned_lease_file_is_reclaimed() {
        let dir = tempfile::TempDir::new().unwrap();
        // Left behind by a process that died: present but unlocked
        let record = LeaseRecord {
            pid: 0,
            paths: ["a.py".to_string()].into_iter().collect(),
        };
        std::fs::write(
            dir.path().join(format!("dead.{}", LEASE_EXT)),
            serde_json::to_vec(&record).unwrap(),
        )
        .unwrap();

        let locks = PathLockManager::persistent(dir.path());
        let _lease = locks.try_acquire(&paths(&["a.py"])).unwrap();
        assert!(!dir.path().join(format!("dead.{}", LEASE_EXT)).exists());
        assert_eq!(lease_files(dir.path()), 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn concurrent_leases_never_overlap(
            sets in prop::collection::vec(prop::collection::btree_set(0u8..6, 1..3), 2..8)
        ) {
            let locks = PathLockManager::new();
            let active: Arc<Mutex<Vec<BTreeSet<String>>>> = Arc::default();
            let acquired = Arc::new(AtomicUsize::new(0));

            std::thread::scope(|scope| {
                for set in &sets {
                    let wanted: Vec<String> = set.iter().map(|n| format!("src/f{}.rs", n)).collect();
                    let locks = locks.clone();
                    let active = Arc::clone(&active);
                    let acquired = Arc::clone(&acquired);
                    scope.spawn(move || {
                        let rt = tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap();
                        let lease = rt
                            .block_on(locks.acquire(&wanted, Duration::from_secs(10), backoff()))
                            .unwrap();
                        let mine: BTreeSet<String> = lease.paths().map(str::to_string).collect();
                        {
                            let mut active = active.lock().unwrap();
                            assert!(active.iter().all(|other| other.is_disjoint(&mine)));
                            active.push(mine.clone());
                        }
                        std::thread::sleep(Duration::from_millis(2));
                        active.lock().unwrap().retain(|other| *other != mine);
                        acquired.fetch_add(1, Ordering::SeqCst);
                        drop(lease);
                    });
                }
            });

            prop_assert_eq!(acquired.load(Ordering::SeqCst), sets.len());
            prop_assert_eq!(locks.held(), 0);
        }
    }
}
