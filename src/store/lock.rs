use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};

use crate::error::{CoordError, Result};

const LOCK_SUFFIX: &str = "lock";
const RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Path of the advisory lock file guarding `target`.
///
/// The target itself is replaced by rename on every write, so the lock lives
/// on a sibling that is never renamed.
pub fn lock_path_for(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(LOCK_SUFFIX);
    target.with_file_name(name)
}

/// Exclusive flock held for as long as the guard lives.
///
/// The kernel drops the lock when the descriptor closes, including when the
/// owning process dies, so a crashed holder can never wedge other workers.
pub struct LockGuard {
    _flock: Flock<File>,
    path: PathBuf,
    acquired_at: Instant,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard").field("path", &self.path).finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        log::debug!(
            "🔓 Released {} after {:?}",
            self.path.display(),
            self.acquired_at.elapsed()
        );
    }
}

/// Block the calling thread until the lock for `target` is held or `timeout` elapses.
pub fn acquire(target: &Path, timeout: Duration) -> Result<LockGuard> {
    let path = lock_path_for(target);
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .mode(0o644)
        .open(&path)?;

    let started = Instant::now();
    loop {
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(flock) => {
                log::debug!("🔒 Acquired {} in {:?}", path.display(), started.elapsed());
                return Ok(LockGuard {
                    _flock: flock,
                    path,
                    acquired_at: Instant::now(),
                });
            }
            Err((returned, Errno::EAGAIN)) | Err((returned, Errno::EINTR)) => {
                let waited = started.elapsed();
                if waited >= timeout {
                    log::warn!("⏳ Lock timeout on {} after {:?}", path.display(), waited);
                    return Err(CoordError::LockTimeout { path, waited });
                }
                file = returned;
                std::thread::sleep(RETRY_INTERVAL.min(timeout - waited));
            }
            Err((_returned, errno)) => {
                return Err(CoordError::Io(std::io::Error::from(errno)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_path_is_sibling() {
        let p = lock_path_for(Path::new("/var/data/processing_manifest.json"));
        assert_eq!(p, PathBuf::from("/var/data/processing_manifest.json.lock"));
    }

    #[test]
    fn test_exclusive_lock_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("manifest.json");

        let first = acquire(&target, Duration::from_millis(100)).expect("first lock");

        let second = acquire(&target, Duration::from_millis(50));
        match second {
            Err(CoordError::LockTimeout { waited, .. }) => {
                assert!(waited >= Duration::from_millis(50));
            }
            other => panic!("expected LockTimeout, got {:?}", other),
        }

        drop(first);
        let third = acquire(&target, Duration::ZERO).expect("lock free after release");
        drop(third);
    }

    #[test]
    fn test_waiter_gets_lock_once_released() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("manifest.json");

        let held = acquire(&target, Duration::from_millis(100)).unwrap();
        let t = target.clone();
        let waiter = std::thread::spawn(move || acquire(&t, Duration::from_secs(5)).map(|_| ()));

        std::thread::sleep(Duration::from_millis(50));
        drop(held);

        waiter.join().unwrap().expect("waiter should acquire");
    }
}
