//! Download cache shared by concurrently running instances.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex, PoisonError, Weak};

use fs4::fs_std::FileExt;
use tokio::sync::OnceCell;

const COMPLETE_MARKER: &str = ".complete";

/// Live caches of this process, by root.
static CACHES: LazyLock<Mutex<HashMap<PathBuf, Weak<SharedCache>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Keyed directory cache with at-most-once population per key.
///
/// Concurrent callers for the same key wait on one population; a failed
/// population leaves the key empty so a later caller can try again. A
/// `.complete` marker lets later processes reuse finished entries, and an
/// exclusive `<key>.lock` file serializes population across processes.
#[derive(Debug)]
pub struct SharedCache {
    root: PathBuf,
    cells: Mutex<HashMap<String, Arc<OnceCell<PathBuf>>>>,
}

impl SharedCache {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cells: Mutex::new(HashMap::new()),
        }
    }

    /// The process-wide cache for `root`, created on first use.
    #[must_use]
    pub fn for_root(root: impl Into<PathBuf>) -> Arc<Self> {
        let root = root.into();
        let mut caches = CACHES.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(cache) = caches.get(&root).and_then(Weak::upgrade) {
            return cache;
        }
        caches.retain(|_, cache| cache.strong_count() > 0);
        let cache = Arc::new(Self::new(root.clone()));
        caches.insert(root, Arc::downgrade(&cache));
        cache
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn cell(&self, key: &str) -> Arc<OnceCell<PathBuf>> {
        let mut cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(cells.entry(key.to_string()).or_default())
    }

    /// Return the directory for `key`, running `populate` into it first if
    /// no finished entry exists.
    ///
    /// # Errors
    ///
    /// Returns whatever `populate` fails with, or an I/O error preparing
    /// the directory.
    pub async fn get_or_populate<F, Fut, E>(&self, key: &str, populate: F) -> Result<PathBuf, E>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: From<std::io::Error>,
    {
        let dir = self.root.join(key);
        let cell = self.cell(key);
        let path = cell
            .get_or_try_init(|| async {
                std::fs::create_dir_all(&self.root)?;
                let _lock = lock_entry(self.root.join(format!("{key}.lock"))).await?;
                if dir.join(COMPLETE_MARKER).is_file() {
                    tracing::debug!(key, "Reusing completed cache entry");
                    return Ok::<_, E>(dir.clone());
                }
                if dir.exists() {
                    std::fs::remove_dir_all(&dir)?;
                }
                std::fs::create_dir_all(&dir)?;
                populate(dir.clone()).await?;
                std::fs::write(dir.join(COMPLETE_MARKER), key)?;
                tracing::info!(key, path = %dir.display(), "Populated shared cache entry");
                Ok(dir.clone())
            })
            .await?;
        Ok(path.clone())
    }
}

/// Block (off the runtime) until this process holds the entry's lock.
/// The lock is released when the returned file is dropped.
async fn lock_entry(path: PathBuf) -> std::io::Result<File> {
    tokio::task::spawn_blocking(move || {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        FileExt::lock_exclusive(&file)?;
        Ok(file)
    })
    .await
    .map_err(std::io::Error::other)?
}
