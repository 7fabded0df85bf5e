//! Advisory file locks that the holding thread may take again without deadlocking.
//!
//! Across processes exclusion comes from `flock(2)` on a `<path>.lock` sibling.
//! Within this process a registry tracks which thread holds each path, so a
//! nested acquisition only bumps a depth counter instead of opening the lock
//! file a second time (which `flock` would treat as a competing holder).
//!
//! Reentrancy is per thread, not per process: two workers of one process
//! still exclude each other. A [`FileLock`] is `!Send`, so it cannot be held
//! across an `.await` in a spawned task; async callers take locks only inside
//! [`crate::store::blocking`].

use std::collections::HashMap;
use std::marker::PhantomData;
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::{Condvar, LazyLock, Mutex};
use std::thread::{self, ThreadId};

use crate::error::StoreError;

struct Holder {
    thread: ThreadId,
    depth: usize,
    file: Option<File>,
}

struct Registry {
    held: Mutex<HashMap<PathBuf, Holder>>,
    released: Condvar,
}

static REGISTRY: LazyLock<Registry> = LazyLock::new(|| Registry {
    held: Mutex::new(HashMap::new()),
    released: Condvar::new(),
});

/// Held lock on one path. Releases on drop.
#[derive(Debug)]
pub struct FileLock {
    key: PathBuf,
    // Released by the thread that took it.
    _thread_bound: PhantomData<*const ()>,
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".lock");
    PathBuf::from(name)
}

impl FileLock {
    /// Blocks until the lock for `path` is held by the calling thread.
    pub fn acquire(path: &Path) -> Result<Self, StoreError> {
        let key = lock_path(path);
        let me = thread::current().id();

        let mut held = REGISTRY.held.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            match held.get_mut(&key) {
                Some(holder) if holder.thread == me => {
                    holder.depth += 1;
                    return Ok(Self::held(key));
                }
                Some(_) => {
                    held = REGISTRY
                        .released
                        .wait(held)
                        .unwrap_or_else(|e| e.into_inner());
                }
                None => break,
            }
        }
        // Reserve the path before blocking on flock so other threads wait here.
        held.insert(
            key.clone(),
            Holder {
                thread: me,
                depth: 1,
                file: None,
            },
        );
        drop(held);

        match open_and_flock(&key) {
            Ok(file) => {
                let mut held = REGISTRY.held.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(holder) = held.get_mut(&key) {
                    holder.file = Some(file);
                }
                Ok(Self::held(key))
            }
            Err(e) => {
                let mut held = REGISTRY.held.lock().unwrap_or_else(|e| e.into_inner());
                held.remove(&key);
                REGISTRY.released.notify_all();
                Err(e)
            }
        }
    }
}

impl FileLock {
    fn held(key: PathBuf) -> Self {
        Self {
            key,
            _thread_bound: PhantomData,
        }
    }
}

fn open_and_flock(key: &Path) -> Result<File, StoreError> {
    if let Some(parent) = key.parent() {
        std::fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(key)
        .map_err(|e| StoreError::io(key, e))?;
    // SAFETY: the descriptor is owned by `file` and stays open while locked.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
    if rc != 0 {
        return Err(StoreError::Lock(format!(
            "flock {} failed: {}",
            key.display(),
            std::io::Error::last_os_error()
        )));
    }
    Ok(file)
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let mut held = REGISTRY.held.lock().unwrap_or_else(|e| e.into_inner());
        let release = match held.get_mut(&self.key) {
            Some(holder) => {
                holder.depth -= 1;
                holder.depth == 0
            }
            None => false,
        };
        if release {
            // Closing the descriptor drops the flock.
            held.remove(&self.key);
            REGISTRY.released.notify_all();
        }
    }
}
