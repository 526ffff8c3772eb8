use std::fs::Permissions;
use std::io::Write;
use std::marker::PhantomData;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};

use super::lock::{self, LockGuard};
use crate::error::{CoordError, Result, StateKind};

/// Shared state files stay readable by operator tooling running as another user.
const STATE_FILE_MODE: u32 = 0o644;

/// A structured JSON file shared between processes.
///
/// Every access goes through [`LockedStore::acquire`]; the returned [`Locked`]
/// handle is the only way to write, so a write without the lock does not compile.
#[derive(Debug, Clone)]
pub struct LockedStore<T> {
    path: PathBuf,
    timeout: Duration,
    kind: StateKind,
    _marker: PhantomData<fn() -> T>,
}

/// Proof that the caller holds the store's lock. Dropping it releases the lock.
#[derive(Debug)]
pub struct Locked<'a, T> {
    store: &'a LockedStore<T>,
    _guard: LockGuard,
}

impl<T> LockedStore<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    pub fn new(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            timeout,
            kind: StateKind::Document,
            _marker: PhantomData,
        }
    }

    /// Tag corruption errors from this store with `kind`.
    pub fn with_kind(mut self, kind: StateKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn kind(&self) -> StateKind {
        self.kind
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn acquire(&self) -> Result<Locked<'_, T>> {
        let guard = lock::acquire(&self.path, self.timeout)?;
        Ok(Locked {
            store: self,
            _guard: guard,
        })
    }

    /// Read the current contents under the lock.
    pub fn load(&self) -> Result<T> {
        self.acquire()?.read()
    }

    /// Read-modify-write under a single lock acquisition.
    ///
    /// Nothing is written when `f` fails, so a rejected operation leaves the
    /// file exactly as it was.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> Result<R>) -> Result<R> {
        let locked = self.acquire()?;
        let mut value = locked.read()?;
        let out = f(&mut value)?;
        locked.write(&value)?;
        Ok(out)
    }

    /// Raw bytes of the file as of now, read under the lock.
    pub fn snapshot_bytes(&self) -> Result<Vec<u8>> {
        let _locked = self.acquire()?;
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
}

impl<T> Locked<'_, T>
where
    T: Serialize + DeserializeOwned + Default,
{
    /// Decode the file. A missing or empty file is the default value; anything
    /// unparseable is surfaced as `CorruptState` and left on disk untouched.
    pub fn read(&self) -> Result<T> {
        let path = &self.store.path;
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
            Err(e) => return Err(e.into()),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(T::default());
        }
        serde_json::from_slice(&bytes).map_err(|e| {
            log::error!("❌ Corrupt {} {}: {}", self.store.kind, path.display(), e);
            CoordError::corrupt(self.store.kind, path.clone(), e)
        })
    }

    /// Write to a temporary sibling and rename it over the target.
    pub fn write(&self, value: &T) -> Result<()> {
        let path = &self.store.path;
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(parent)?;

        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        serde_json::to_writer_pretty(tmp.as_file_mut(), value)?;
        tmp.as_file_mut().write_all(b"\n")?;
        tmp.as_file_mut().flush()?;
        tmp.as_file().set_permissions(Permissions::from_mode(STATE_FILE_MODE))?;
        tmp.as_file_mut().sync_all()?;
        tmp.persist(path).map_err(|e| CoordError::Io(e.error))?;
        Ok(())
    }
}
