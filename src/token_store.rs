//! Durable, append-only store of pending update signals.
//!
//! The receiver appends one sanitized token per request; the reconciler
//! takes a [`Snapshot`] at the start of a pass and consumes it afterwards,
//! re-queueing whatever signals still need another attempt.
//!
//! The receiver and the reconciler usually live in different processes, so
//! every operation runs under an exclusive `flock` on a sidecar
//! `<store>.lock` file.  Consuming writes the remainder to `<store>.tmp` and
//! renames it over the store, so a crash mid-consume leaves either the old
//! or the new contents, never a truncated file.

use std::collections::BTreeSet;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use log::debug;

pub const MAX_TOKEN_LEN: usize = 128;

/// Keeps only `[A-Za-z0-9\-_:./]` and truncates to [`MAX_TOKEN_LEN`].
pub fn sanitize(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ':' | '.' | '/'))
        .take(MAX_TOKEN_LEN)
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub tokens: BTreeSet<String>,
    len: u64,
}

pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, token: &str) -> io::Result<()> {
        let path = self.path.clone();
        let line = format!("\n{token}");
        blocking(move || {
            let _lock = lock_exclusive(&path)?;
            let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
            file.write_all(line.as_bytes())?;
            file.sync_data()
        })
        .await
    }

    /// Deduplicated non-empty lines currently in the store.
    pub async fn snapshot(&self) -> io::Result<Snapshot> {
        let path = self.path.clone();
        blocking(move || {
            let _lock = lock_exclusive(&path)?;
            let bytes = read_or_empty(&path)?;
            let tokens = String::from_utf8_lossy(&bytes)
                .lines()
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect();
            Ok(Snapshot {
                tokens,
                len: bytes.len() as u64,
            })
        })
        .await
    }

    /// Drops the bytes covered by `snapshot`, keeping anything appended
    /// after it was taken, and re-queues `retained`.
    pub async fn consume(&self, snapshot: &Snapshot, retained: &BTreeSet<String>) -> io::Result<()> {
        let path = self.path.clone();
        let cut = snapshot.len as usize;
        let retained = retained.clone();
        blocking(move || {
            let _lock = lock_exclusive(&path)?;
            let bytes = read_or_empty(&path)?;
            let cut = cut.min(bytes.len());
            let mut rest = bytes[cut..].to_vec();
            for token in &retained {
                rest.extend_from_slice(format!("\n{token}").as_bytes());
            }
            debug!(
                "Consuming {} bytes of {}, re-queueing {} signal(s)",
                cut,
                path.display(),
                retained.len()
            );

            let tmp = sibling(&path, ".tmp");
            let mut file = File::create(&tmp)?;
            file.write_all(&rest)?;
            file.sync_all()?;
            fs::rename(&tmp, &path)
        })
        .await
    }
}

async fn blocking<T: Send + 'static>(
    f: impl FnOnce() -> io::Result<T> + Send + 'static,
) -> io::Result<T> {
    tokio::task::spawn_blocking(f).await.map_err(io::Error::other)?
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

fn read_or_empty(path: &Path) -> io::Result<Vec<u8>> {
    match fs::read(path) {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

/// Opens (creating parents as needed) the store's lock file and blocks
/// until it holds an exclusive `flock`.  Released when the file is dropped.
fn lock_exclusive(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(sibling(path, ".lock"))?;
    flock_exclusive(&file)?;
    Ok(file)
}

fn flock_exclusive(file: &File) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        loop {
            // SAFETY: flock is a standard POSIX call. fd is a valid file
            // descriptor owned by `file` for the duration of the call.
            #[allow(unsafe_code)]
            let result = unsafe { libc::flock(fd, libc::LOCK_EX) };
            if result == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = file;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn sanitize_strips_disallowed_characters_in_order() {
        assert_eq!(sanitize("app:v2<script>"), "app:v2script");
        assert_eq!(sanitize("registry.local/team/app-1_x:tag"), "registry.local/team/app-1_x:tag");
        assert_eq!(sanitize("äpp\n v2;"), "ppv2");
        assert_eq!(sanitize("<>\"'"), "");
    }

    #[test]
    fn sanitize_truncates_and_is_idempotent() {
        let long = "a".repeat(200) + "<b>";
        let once = sanitize(&long);
        assert_eq!(once.len(), MAX_TOKEN_LEN);
        assert_eq!(sanitize(&once), once);

        for raw in ["app:v2<script>", "x y z", "ok/already_clean:1.0"] {
            let clean = sanitize(raw);
            assert_eq!(sanitize(&clean), clean);
        }
    }

    #[tokio::test]
    async fn append_creates_directory_and_dedups_on_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path().join("data").join("data.txt"));

        assert!(store.snapshot().await.unwrap().tokens.is_empty());

        for token in ["app:v2", "db:v1", "app:v2", ""] {
            store.append(token).await.unwrap();
        }
        let raw = std::fs::read_to_string(store.path()).unwrap();
        assert_eq!(raw, "\napp:v2\ndb:v1\napp:v2\n");

        let snapshot = store.snapshot().await.unwrap();
        assert_eq!(snapshot.tokens, set(&["app:v2", "db:v1"]));
    }

    #[tokio::test]
    async fn consume_keeps_tokens_appended_later() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path().join("data.txt"));

        store.append("app:v2").await.unwrap();
        let snapshot = store.snapshot().await.unwrap();
        store.append("db:v1").await.unwrap();
        store.consume(&snapshot, &BTreeSet::new()).await.unwrap();

        let left = store.snapshot().await.unwrap();
        assert_eq!(left.tokens, set(&["db:v1"]));

        store.consume(&left, &BTreeSet::new()).await.unwrap();
        assert!(store.snapshot().await.unwrap().tokens.is_empty());
        assert!(!sibling(store.path(), ".tmp").exists());
    }

    #[tokio::test]
    async fn consume_requeues_retained_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path().join("data.txt"));

        store.append("app:v2").await.unwrap();
        store.append("worker:v3").await.unwrap();
        let snapshot = store.snapshot().await.unwrap();
        store.append("db:v1").await.unwrap();
        store.consume(&snapshot, &set(&["worker:v3"])).await.unwrap();

        assert_eq!(
            store.snapshot().await.unwrap().tokens,
            set(&["db:v1", "worker:v3"])
        );
    }

    #[tokio::test]
    async fn appends_from_a_second_handle_survive_consume() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.txt");
        let reconciler_side = std::sync::Arc::new(TokenStore::new(&path));
        let receiver_side = std::sync::Arc::new(TokenStore::new(&path));

        reconciler_side.append("seed").await.unwrap();
        let snapshot = reconciler_side.snapshot().await.unwrap();

        let writer = {
            let receiver_side = std::sync::Arc::clone(&receiver_side);
            tokio::spawn(async move {
                for i in 0..50 {
                    receiver_side.append(&format!("t{i}")).await.unwrap();
                }
            })
        };
        reconciler_side
            .consume(&snapshot, &BTreeSet::new())
            .await
            .unwrap();
        writer.await.unwrap();

        let left = reconciler_side.snapshot().await.unwrap().tokens;
        assert_eq!(left.len(), 50);
        assert!(!left.contains("seed"));
    }
}
