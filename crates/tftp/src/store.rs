//! Byte Store
//!
//! Sessions read and write file content through the [`ByteStore`] trait and
//! never interpret names beyond the outcomes the store reports.
//!
//! Writes are staged: the resource keeps its previous content until
//! [`ByteStore::commit`] publishes the new one, and [`ByteStore::discard`]
//! only ever drops the staged copy.
//!
//! - [`DirStore`] serves files below a root directory and refuses any name
//!   that would escape it.
//! - [`MemoryStore`] keeps resources in memory and counts open handles, which
//!   makes leaks observable.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::error::{StoreError, TransferError};

/// Sequential read/write access to named resources
pub trait ByteStore: Send + Sync + 'static {
    type Reader: AsyncRead + Unpin + Send + 'static;
    type Writer: AsyncWrite + Unpin + Send + 'static;

    /// Canonical form of `name`. Two names with the same key denote the same resource.
    fn resource_key(&self, name: &str) -> Result<String, StoreError> {
        if name.is_empty() {
            return Err(StoreError::InvalidName(name.to_string()));
        }
        Ok(name.to_string())
    }

    /// Open an existing resource for sequential reading
    fn open_for_read(&self, name: &str) -> impl Future<Output = Result<Self::Reader, StoreError>> + Send;

    /// Start a staged write of `name`; the resource itself is untouched until [`commit`](Self::commit)
    fn open_for_write(&self, name: &str) -> impl Future<Output = Result<Self::Writer, StoreError>> + Send;

    /// Replace the resource with the staged content written for it
    fn commit(&self, name: &str) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Drop the staged content of `name`. Discarding when nothing is staged is not an error.
    fn discard(&self, name: &str) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// Close a staged writer and settle it according to the transfer outcome
///
/// A successful transfer is committed; anything else, including a failed
/// close or commit, leaves the previous content of `name` in place.
pub(crate) async fn settle_write<S, T>(
    store: &S,
    name: &str,
    mut writer: S::Writer,
    outcome: Result<T, TransferError>,
) -> Result<T, TransferError>
where
    S: ByteStore + ?Sized,
{
    let outcome = match outcome {
        Ok(value) => writer.shutdown().await.map(|()| value).map_err(TransferError::Storage),
        Err(e) => Err(e),
    };
    drop(writer);

    let outcome = match outcome {
        Ok(value) => store
            .commit(name)
            .await
            .map(|()| value)
            .map_err(|e| TransferError::FileAccess {
                name: name.to_string(),
                reason: e.to_string(),
            }),
        Err(e) => Err(e),
    };

    if outcome.is_err() {
        match store.discard(name).await {
            Ok(()) => tracing::debug!("Discarded staged content of '{}'", name),
            Err(e) => tracing::warn!("Failed to discard staged content of '{}': {}", name, e),
        }
    }
    outcome
}

/// Read up to `max` bytes, stopping early only at end of input
pub async fn read_chunk<R>(reader: &mut R, max: usize) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut chunk = Vec::with_capacity(max);
    let mut limited = (&mut *reader).take(max as u64);
    limited.read_to_end(&mut chunk).await?;
    Ok(chunk)
}

/// Files below a root directory
#[derive(Debug, Clone)]
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The plain relative components of `name`, refusing anything else
    fn components<'a>(&self, name: &'a str) -> Result<Vec<&'a str>, StoreError> {
        let invalid = || StoreError::InvalidName(name.to_string());

        let mut parts = Vec::new();
        for component in Path::new(name).components() {
            match component {
                Component::CurDir => {}
                Component::Normal(part) => parts.push(part.to_str().ok_or_else(invalid)?),
                _ => return Err(invalid()),
            }
        }
        if parts.is_empty() {
            return Err(invalid());
        }
        Ok(parts)
    }

    /// Join a resource name onto the root
    fn resolve(&self, name: &str) -> Result<PathBuf, StoreError> {
        let mut path = self.root.clone();
        path.extend(self.components(name)?);
        Ok(path)
    }

    /// Sibling file a write is staged in until it is committed
    fn staging_path(path: &Path) -> PathBuf {
        let file_name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
        path.with_file_name(format!(".{}.part", file_name))
    }

    /// Ensure an existing path does not leave the root through a symlink
    async fn confine(&self, name: &str, path: &Path) -> Result<PathBuf, StoreError> {
        let root_canon = tokio::fs::canonicalize(&self.root).await?;
        let path_canon = tokio::fs::canonicalize(path).await.map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => StoreError::NotFound(name.to_string()),
            _ => StoreError::Io(e),
        })?;

        if !path_canon.starts_with(&root_canon) {
            tracing::warn!("Path traversal attempt detected for '{}'", name);
            return Err(StoreError::InvalidName(name.to_string()));
        }

        Ok(path_canon)
    }
}

fn open_error(name: &str, err: io::Error) -> StoreError {
    match err.kind() {
        io::ErrorKind::NotFound => StoreError::NotFound(name.to_string()),
        io::ErrorKind::PermissionDenied => StoreError::AccessDenied {
            name: name.to_string(),
            reason: err.to_string(),
        },
        _ => StoreError::Io(err),
    }
}

impl ByteStore for DirStore {
    type Reader = File;
    type Writer = File;

    fn resource_key(&self, name: &str) -> Result<String, StoreError> {
        Ok(self.components(name)?.join("/"))
    }

    async fn open_for_read(&self, name: &str) -> Result<File, StoreError> {
        let path = self.resolve(name)?;
        let path = self.confine(name, &path).await?;

        let metadata = tokio::fs::metadata(&path).await.map_err(|e| open_error(name, e))?;
        if !metadata.is_file() {
            return Err(StoreError::AccessDenied {
                name: name.to_string(),
                reason: "not a regular file".to_string(),
            });
        }

        File::open(&path).await.map_err(|e| open_error(name, e))
    }

    async fn open_for_write(&self, name: &str) -> Result<File, StoreError> {
        let path = self.resolve(name)?;

        // The parent must exist and stay inside the root; so must the target if it already exists.
        let parent = path.parent().unwrap_or(&self.root).to_path_buf();
        self.confine(name, &parent).await.map_err(|e| match e {
            StoreError::NotFound(_) => StoreError::AccessDenied {
                name: name.to_string(),
                reason: "directory does not exist".to_string(),
            },
            other => other,
        })?;
        if tokio::fs::symlink_metadata(&path).await.is_ok() {
            let target = self.confine(name, &path).await?;
            if tokio::fs::metadata(&target).await?.is_dir() {
                return Err(StoreError::AccessDenied {
                    name: name.to_string(),
                    reason: "is a directory".to_string(),
                });
            }
        }

        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(Self::staging_path(&path))
            .await
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => StoreError::AccessDenied {
                    name: name.to_string(),
                    reason: e.to_string(),
                },
                _ => open_error(name, e),
            })
    }

    async fn commit(&self, name: &str) -> Result<(), StoreError> {
        let path = self.resolve(name)?;
        tokio::fs::rename(Self::staging_path(&path), &path)
            .await
            .map_err(|e| open_error(name, e))
    }

    async fn discard(&self, name: &str) -> Result<(), StoreError> {
        let path = self.resolve(name)?;
        match tokio::fs::remove_file(Self::staging_path(&path)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(e)),
        }
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    files: Mutex<HashMap<String, Vec<u8>>>,
    staged: Mutex<HashMap<String, Vec<u8>>>,
    open_handles: AtomicUsize,
    read_only: AtomicBool,
}

impl MemoryInner {
    fn files(&self) -> MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.files.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn staged(&self) -> MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.staged.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Counts one open handle for as long as it lives
#[derive(Debug)]
struct HandleGuard(Arc<MemoryInner>);

impl HandleGuard {
    fn new(inner: &Arc<MemoryInner>) -> Self {
        inner.open_handles.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(inner))
    }
}

impl Drop for HandleGuard {
    fn drop(&mut self) {
        self.0.open_handles.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-memory resources shared by every clone of the store
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: impl Into<String>, data: impl Into<Vec<u8>>) {
        self.inner.files().insert(name.into(), data.into());
    }

    pub fn get(&self, name: &str) -> Option<Vec<u8>> {
        self.inner.files().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.files().contains_key(name)
    }

    /// Number of readers and writers currently alive
    pub fn open_handles(&self) -> usize {
        self.inner.open_handles.load(Ordering::SeqCst)
    }

    /// Refuse every subsequent open for writing
    pub fn set_read_only(&self, read_only: bool) {
        self.inner.read_only.store(read_only, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct MemoryReader {
    data: io::Cursor<Vec<u8>>,
    _handle: HandleGuard,
}

impl AsyncRead for MemoryReader {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.data).poll_read(cx, buf)
    }
}

/// Appends to the staged copy of its resource
#[derive(Debug)]
pub struct MemoryWriter {
    name: String,
    handle: HandleGuard,
}

impl AsyncWrite for MemoryWriter {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.handle
            .0
            .staged()
            .entry(self.name.clone())
            .or_default()
            .extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl ByteStore for MemoryStore {
    type Reader = MemoryReader;
    type Writer = MemoryWriter;

    async fn open_for_read(&self, name: &str) -> Result<MemoryReader, StoreError> {
        let data = self.get(name).ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        Ok(MemoryReader {
            data: io::Cursor::new(data),
            _handle: HandleGuard::new(&self.inner),
        })
    }

    async fn open_for_write(&self, name: &str) -> Result<MemoryWriter, StoreError> {
        if name.is_empty() {
            return Err(StoreError::InvalidName(name.to_string()));
        }
        if self.inner.read_only.load(Ordering::SeqCst) {
            return Err(StoreError::AccessDenied {
                name: name.to_string(),
                reason: "store is read-only".to_string(),
            });
        }

        self.inner.staged().insert(name.to_string(), Vec::new());
        Ok(MemoryWriter {
            name: name.to_string(),
            handle: HandleGuard::new(&self.inner),
        })
    }

    async fn commit(&self, name: &str) -> Result<(), StoreError> {
        let data = self
            .inner
            .staged()
            .remove(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        self.inner.files().insert(name.to_string(), data);
        Ok(())
    }

    async fn discard(&self, name: &str) -> Result<(), StoreError> {
        self.inner.staged().remove(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[tokio::test]
    async fn test_dir_store_read() {
        let temp_dir = tempdir().unwrap();
        std::fs::write(temp_dir.path().join("test.txt"), b"test content").unwrap();
        let store = DirStore::new(temp_dir.path());

        let mut reader = store.open_for_read("test.txt").await.unwrap();
        assert_eq!(read_chunk(&mut reader, 4).await.unwrap(), b"test");
        assert_eq!(read_chunk(&mut reader, 512).await.unwrap(), b" content");
        assert!(read_chunk(&mut reader, 512).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dir_store_rejects_traversal() {
        let temp_dir = tempdir().unwrap();
        let root = temp_dir.path().join("root");
        std::fs::create_dir(&root).unwrap();
        std::fs::write(temp_dir.path().join("secret"), b"x").unwrap();
        let store = DirStore::new(&root);

        assert!(matches!(
            store.open_for_read("../secret").await,
            Err(StoreError::InvalidName(_))
        ));
        assert!(matches!(
            store.open_for_read("/etc/passwd").await,
            Err(StoreError::InvalidName(_))
        ));
        assert!(matches!(
            store.open_for_write("../escape").await,
            Err(StoreError::InvalidName(_))
        ));
        assert!(matches!(store.open_for_read("").await, Err(StoreError::InvalidName(_))));
        assert!(!temp_dir.path().join("escape").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dir_store_rejects_symlink_escape() {
        let temp_dir = tempdir().unwrap();
        let root = temp_dir.path().join("root");
        std::fs::create_dir(&root).unwrap();
        std::fs::write(temp_dir.path().join("secret"), b"x").unwrap();
        std::os::unix::fs::symlink(temp_dir.path().join("secret"), root.join("link")).unwrap();
        let store = DirStore::new(&root);

        assert!(matches!(store.open_for_read("link").await, Err(StoreError::InvalidName(_))));
        assert!(matches!(store.open_for_write("link").await, Err(StoreError::InvalidName(_))));
    }

    #[tokio::test]
    async fn test_dir_store_missing_file() {
        let temp_dir = tempdir().unwrap();
        let store = DirStore::new(temp_dir.path());

        assert!(matches!(
            store.open_for_read("missing.bin").await,
            Err(StoreError::NotFound(name)) if name == "missing.bin"
        ));
        assert!(matches!(
            store.open_for_write("no/such/dir.bin").await,
            Err(StoreError::AccessDenied { .. })
        ));
        assert!(matches!(store.open_for_read(".").await, Err(StoreError::AccessDenied { .. })));
    }

    #[tokio::test]
    async fn test_dir_store_write_commit_and_discard() {
        let temp_dir = tempdir().unwrap();
        let store = DirStore::new(temp_dir.path());
        let target = temp_dir.path().join("out.bin");

        let mut writer = store.open_for_write("out.bin").await.unwrap();
        writer.write_all(&[0, 1, 0, 2]).await.unwrap();
        writer.shutdown().await.unwrap();
        drop(writer);
        assert!(!target.exists());

        store.commit("out.bin").await.unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), vec![0, 1, 0, 2]);

        // A discarded rewrite leaves the committed content alone
        let mut writer = store.open_for_write("./out.bin").await.unwrap();
        writer.write_all(b"replacement").await.unwrap();
        drop(writer);
        store.discard("out.bin").await.unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), vec![0, 1, 0, 2]);
        assert_eq!(std::fs::read_dir(temp_dir.path()).unwrap().count(), 1);
        store.discard("out.bin").await.unwrap();
    }

    #[tokio::test]
    async fn test_dir_store_refuses_to_write_over_directory() {
        let temp_dir = tempdir().unwrap();
        std::fs::create_dir(temp_dir.path().join("sub")).unwrap();
        let store = DirStore::new(temp_dir.path());

        assert!(matches!(
            store.open_for_write("sub").await,
            Err(StoreError::AccessDenied { .. })
        ));
    }

    #[test]
    fn test_dir_store_resource_key() {
        let store = DirStore::new("/srv/tftp");

        assert_eq!(store.resource_key("same.bin").unwrap(), "same.bin");
        assert_eq!(store.resource_key("./same.bin").unwrap(), "same.bin");
        assert_eq!(store.resource_key("a/./b//c.bin").unwrap(), "a/b/c.bin");
        assert!(matches!(store.resource_key("../x"), Err(StoreError::InvalidName(_))));
        assert!(matches!(store.resource_key("/etc/passwd"), Err(StoreError::InvalidName(_))));
        assert!(matches!(store.resource_key("."), Err(StoreError::InvalidName(_))));
        assert!(matches!(store.resource_key(""), Err(StoreError::InvalidName(_))));
    }

    #[tokio::test]
    async fn test_memory_store_handles() {
        let store = MemoryStore::new();
        store.insert("a", vec![7u8; 600]);
        assert_eq!(store.open_handles(), 0);

        let mut reader = store.open_for_read("a").await.unwrap();
        let mut writer = store.open_for_write("b").await.unwrap();
        assert_eq!(store.open_handles(), 2);

        let chunk = read_chunk(&mut reader, 512).await.unwrap();
        writer.write_all(&chunk).await.unwrap();
        assert!(!store.contains("b"));

        drop(reader);
        drop(writer);
        assert_eq!(store.open_handles(), 0);

        store.commit("b").await.unwrap();
        assert_eq!(store.get("b").unwrap().len(), 512);
        assert!(matches!(store.commit("b").await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_memory_store_discard_keeps_previous_content() {
        let store = MemoryStore::new();
        store.insert("a", b"previous".to_vec());

        let mut writer = store.open_for_write("a").await.unwrap();
        writer.write_all(b"partial").await.unwrap();
        drop(writer);
        store.discard("a").await.unwrap();

        assert_eq!(store.get("a").unwrap(), b"previous");
    }

    #[tokio::test]
    async fn test_settle_write_commits_only_on_success() {
        let store = MemoryStore::new();

        let writer = store.open_for_write("ok").await.unwrap();
        assert_eq!(settle_write(&store, "ok", writer, Ok(7)).await.unwrap(), 7);
        assert!(store.contains("ok"));

        let mut writer = store.open_for_write("bad").await.unwrap();
        writer.write_all(b"half").await.unwrap();
        let failed: Result<(), TransferError> = Err(TransferError::ProtocolViolation("gap".to_string()));
        assert!(settle_write(&store, "bad", writer, failed).await.is_err());
        assert!(!store.contains("bad"));
        assert_eq!(store.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_memory_store_read_only() {
        let store = MemoryStore::new();
        store.set_read_only(true);
        assert!(matches!(
            store.open_for_write("x").await,
            Err(StoreError::AccessDenied { .. })
        ));
        assert!(!store.contains("x"));
    }
}
