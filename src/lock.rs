//! Single-writer locking of pyramid construction.
//!
//! A lock is held at two levels: an in-process registry keyed by image id,
//! which lets threads wait on a condition variable, and a lock file holding
//! the owner's PID, which excludes other processes. A lock file whose owner
//! is gone is reclaimed, so a crashed builder never wedges an image.
//!
//! The second line of a lock file is a tag unique to one acquisition.
//! Reclaiming renames the stale file to a private tombstone and checks that
//! the tombstone still holds what was judged stale, so two reclaimers never
//! both win. A token only deletes a lock file that still carries its tag.

use std::{
    collections::HashSet,
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{
        Arc, Condvar, Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
    thread,
    time::{Duration, Instant, SystemTime},
};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::{Error, Result, shard::ensure_parent_dirs};

static ACQUISITIONS: AtomicU64 = AtomicU64::new(0);

/// Contents of a lock file written by this process: PID, then a unique tag.
fn owner_contents() -> String {
    let pid = std::process::id();
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos());
    let seq = ACQUISITIONS.fetch_add(1, Ordering::Relaxed);
    format!("{pid}\n{pid}-{nanos}-{seq}")
}

#[derive(Debug)]
struct LockState {
    held: Mutex<HashSet<u64>>,
    released: Condvar,
    poll_interval: Duration,
    stale_after: Option<Duration>,
}

impl LockState {
    fn held(&self) -> MutexGuard<'_, HashSet<u64>> {
        // the set stays consistent even if a holder panicked
        self.held.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn release(&self, image_id: u64) {
        self.held().remove(&image_id);
        self.released.notify_all();
    }
}

/// Registry of pyramid build locks. Clones share the same registry.
#[derive(Debug, Clone)]
pub struct PyramidLocks {
    state: Arc<LockState>,
}

impl Default for PyramidLocks {
    fn default() -> Self {
        Self::new(Duration::from_millis(50), None)
    }
}

impl PyramidLocks {
    /// `poll_interval` bounds how often a foreign lock file is re-checked;
    /// `stale_after` additionally expires lock files older than that age.
    pub fn new(poll_interval: Duration, stale_after: Option<Duration>) -> Self {
        Self {
            state: Arc::new(LockState {
                held: Mutex::new(HashSet::new()),
                released: Condvar::new(),
                poll_interval,
                stale_after,
            }),
        }
    }

    /// Whether a thread of this process holds the lock for `image_id`.
    pub fn is_held(&self, image_id: u64) -> bool {
        self.state.held().contains(&image_id)
    }

    /// Acquire the lock for `image_id`, backed by the file at `lock_path`.
    ///
    /// Blocks for at most `timeout`, then fails with [Error::LockTimeout].
    pub fn acquire(&self, image_id: u64, lock_path: &Path, timeout: Duration) -> Result<LockToken> {
        let started = Instant::now();
        let deadline = started + timeout;

        {
            let mut held = self.state.held();
            while held.contains(&image_id) {
                let now = Instant::now();
                if now >= deadline {
                    return Err(Error::LockTimeout {
                        image_id,
                        waited: started.elapsed(),
                    });
                }
                held = self
                    .state
                    .released
                    .wait_timeout(held, deadline - now)
                    .unwrap_or_else(|e| e.into_inner())
                    .0;
            }
            held.insert(image_id);
        }

        match self.acquire_file(image_id, lock_path, started, deadline) {
            Ok(contents) => {
                debug!("acquired pyramid lock for pixels {image_id}");
                Ok(LockToken {
                    image_id,
                    path: lock_path.to_path_buf(),
                    contents,
                    state: self.state.clone(),
                })
            }
            Err(e) => {
                self.state.release(image_id);
                Err(e)
            }
        }
    }

    /// Create the lock file, returning the contents written to it.
    fn acquire_file(
        &self,
        image_id: u64,
        lock_path: &Path,
        started: Instant,
        deadline: Instant,
    ) -> Result<String> {
        ensure_parent_dirs(lock_path)
            .map_err(|e| Error::resource(image_id, "create lock directory", lock_path, e))?;
        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(lock_path)
            {
                Ok(mut file) => {
                    let contents = owner_contents();
                    file.write_all(contents.as_bytes())
                        .and_then(|()| file.sync_all())
                        .map_err(|e| Error::resource(image_id, "write lock file", lock_path, e))?;
                    // a reclaimer that misjudged us may have moved the file away
                    match fs::read_to_string(lock_path) {
                        Ok(current) if current == contents => return Ok(contents),
                        Ok(_) => {}
                        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                        Err(e) => {
                            return Err(Error::resource(image_id, "read lock file", lock_path, e));
                        }
                    }
                    debug!("pyramid lock file for pixels {image_id} was replaced, retrying");
                    continue;
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if let Some(observed) = self.stale_contents(lock_path) {
                        warn!(
                            "reclaiming stale pyramid lock for pixels {image_id} at {}",
                            lock_path.display()
                        );
                        self.reclaim(image_id, lock_path, &observed)?;
                        continue;
                    }
                }
                Err(e) => {
                    return Err(Error::resource(image_id, "create lock file", lock_path, e));
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::LockTimeout {
                    image_id,
                    waited: started.elapsed(),
                });
            }
            thread::sleep(self.state.poll_interval.min(deadline - now));
        }
    }

    /// Move a stale lock file out of the way.
    ///
    /// If the moved file is not the one judged stale, another reclaimer got
    /// there first and the file belongs to a live owner; it is linked back.
    fn reclaim(&self, image_id: u64, lock_path: &Path, observed: &str) -> Result<()> {
        let tombstone = tombstone_path(lock_path);
        match fs::rename(lock_path, &tombstone) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(Error::resource(
                    image_id,
                    "reclaim stale lock file",
                    lock_path,
                    e,
                ));
            }
        }
        let moved = fs::read_to_string(&tombstone).unwrap_or_default();
        if moved != observed {
            debug!("pyramid lock for pixels {image_id} was reclaimed by another owner");
            if let Err(e) = fs::hard_link(&tombstone, lock_path) {
                warn!(
                    "could not restore pyramid lock file {}: {e}",
                    lock_path.display()
                );
            }
        }
        if let Err(e) = fs::remove_file(&tombstone) {
            warn!(
                "could not remove reclaimed lock file {}: {e}",
                tombstone.display()
            );
        }
        Ok(())
    }

    /// Contents of the lock file if it is stale.
    fn stale_contents(&self, lock_path: &Path) -> Option<String> {
        // gone in the meantime; the next create attempt decides
        let contents = fs::read_to_string(lock_path).ok()?;
        if let Some(stale_after) = self.state.stale_after
            && let Ok(modified) = fs::metadata(lock_path).and_then(|m| m.modified())
            && SystemTime::now()
                .duration_since(modified)
                .is_ok_and(|age| age > stale_after)
        {
            return Some(contents);
        }
        let pid = contents.lines().next()?.trim().parse::<u32>().ok()?;
        (!process_alive(pid)).then_some(contents)
    }
}

/// A name next to the lock file that no other reclaimer will pick.
fn tombstone_path(lock_path: &Path) -> PathBuf {
    let mut name = lock_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(
        ".{}-{}.stale",
        std::process::id(),
        ACQUISITIONS.fetch_add(1, Ordering::Relaxed)
    ));
    lock_path.with_file_name(name)
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    true
}

/// Proof of holding a pyramid lock. Dropping it releases the lock.
#[derive(Debug)]
pub struct LockToken {
    image_id: u64,
    path: PathBuf,
    contents: String,
    state: Arc<LockState>,
}

impl LockToken {
    pub fn image_id(&self) -> u64 {
        self.image_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockToken {
    fn drop(&mut self) {
        match fs::read_to_string(&self.path) {
            Ok(contents) if contents == self.contents => {
                if let Err(e) = fs::remove_file(&self.path)
                    && e.kind() != io::ErrorKind::NotFound
                {
                    warn!(
                        "could not remove pyramid lock file {}: {e}",
                        self.path.display()
                    );
                }
            }
            Ok(_) => warn!(
                "pyramid lock file {} was taken over, leaving it in place",
                self.path.display()
            ),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                "could not read pyramid lock file {}: {e}",
                self.path.display()
            ),
        }
        self.state.release(self.image_id);
        debug!("released pyramid lock for pixels {}", self.image_id);
    }
}

/// Deterministic, linearly growing wait between retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SimpleBackOff {
    pub scaling_factor_ms: u64,
    pub warm_up_factor_ms: u64,
    pub max_retries: u32,
}

impl Default for SimpleBackOff {
    fn default() -> Self {
        Self {
            scaling_factor_ms: 1000,
            warm_up_factor_ms: 200,
            max_retries: 3,
        }
    }
}

impl SimpleBackOff {
    /// Wait before the `count`-th retry:
    /// `count * scaling_factor + count * warm_up_factor`.
    pub fn wait_for(&self, count: u32) -> Duration {
        let count = count as u64;
        Duration::from_millis(count * self.scaling_factor_ms + count * self.warm_up_factor_ms)
    }

    pub fn back_off(&self, count: u32) -> Duration {
        let wait = self.wait_for(count);
        thread::sleep(wait);
        wait
    }
}
