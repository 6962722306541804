//! Drive store: a keypair-owned file tree on the local filesystem, plus the
//! read-only remote handle used to pull another identity's drive over an RPC
//! channel. The drive path layout is defined in `segpool_core::paths`.

use std::path::{Path, PathBuf};

use segpool_core::identity::{Keypair, PublicKey};
use segpool_core::paths;
use segpool_core::protocol::{verbs, StoreGetRequest, StoreListReply, StoreListRequest};
use tokio::io::AsyncWriteExt;

use crate::rpc::{RpcClient, RpcError};

const IDENTITY_FILE: &str = "identity.key";
const FILES_DIR: &str = "files";

/// A local drive: file tree under `<storage_root>/<id>/files`, identified by
/// an X25519 keypair persisted beside it. The same id always reopens the
/// same drive with the same key.
pub struct Store {
    id: String,
    files: PathBuf,
    keypair: Keypair,
}

impl Store {
    /// Open or create a drive. Idempotent: generates and persists a keypair
    /// on first open, loads it afterwards.
    pub async fn open(storage_root: &Path, id: &str) -> Result<Self, StoreError> {
        let mut root = storage_root.to_path_buf();
        for part in id.split('/') {
            if part.is_empty() || part == "." || part == ".." {
                return Err(StoreError::InvalidId(id.to_string()));
            }
            root.push(part);
        }
        let files = root.join(FILES_DIR);
        tokio::fs::create_dir_all(&files).await?;

        let key_path = root.join(IDENTITY_FILE);
        let keypair = match tokio::fs::read(&key_path).await {
            Ok(bytes) => {
                let secret: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| StoreError::CorruptIdentity(key_path.display().to_string()))?;
                Keypair::from_secret_bytes(secret)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let keypair = Keypair::generate();
                let mut f = tokio::fs::File::create(&key_path).await?;
                f.write_all(&keypair.secret_bytes()).await?;
                f.flush().await?;
                keypair
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Store {
            id: id.to_string(),
            files,
            keypair,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn key(&self) -> &PublicKey {
        self.keypair.public_key()
    }

    pub fn key_hex(&self) -> String {
        self.keypair.public_key().to_hex()
    }

    /// Map a drive path to a filesystem path. Rejects traversal components.
    fn fs_path(&self, drive_path: &str) -> Result<PathBuf, StoreError> {
        let mut out = self.files.clone();
        for part in drive_path.split('/') {
            if part.is_empty() {
                continue;
            }
            if part == "." || part == ".." {
                return Err(StoreError::InvalidPath(drive_path.to_string()));
            }
            out.push(part);
        }
        if out == self.files {
            return Err(StoreError::InvalidPath(drive_path.to_string()));
        }
        Ok(out)
    }

    pub async fn get(&self, drive_path: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.fs_path(drive_path)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(drive_path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn put(&self, drive_path: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.fs_path(drive_path)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut f = tokio::fs::File::create(&path).await?;
        f.write_all(bytes).await?;
        f.flush().await?;
        Ok(())
    }

    pub async fn del(&self, drive_path: &str) -> Result<(), StoreError> {
        let path = self.fs_path(drive_path)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(drive_path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn exists(&self, drive_path: &str) -> Result<bool, StoreError> {
        let path = self.fs_path(drive_path)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    /// Entry names directly under a drive directory, sorted. A missing
    /// directory lists as empty rather than erroring: directories are
    /// implicit and exist only when files exist under them.
    pub async fn list(&self, drive_dir: &str) -> Result<Vec<String>, StoreError> {
        let path = self.fs_path(drive_dir)?;
        let mut entries = Vec::new();
        let mut rd = match tokio::fs::read_dir(&path).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = rd.next_entry().await? {
            if entry.file_type().await?.is_file() {
                entries.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        entries.sort();
        Ok(entries)
    }

    /// Write the profile marker ("pool" or "work"), once at creation.
    pub async fn write_profile(&self, profile: &str) -> Result<(), StoreError> {
        self.put(paths::PROFILE, profile.as_bytes()).await
    }
}

/// Import a local file or directory into a drive under a prefix. Returns the
/// drive paths written.
pub async fn import(
    store: &Store,
    local: &Path,
    prefix: &str,
) -> Result<Vec<String>, StoreError> {
    let meta = tokio::fs::metadata(local).await?;
    let mut written = Vec::new();
    if meta.is_dir() {
        let mut rd = tokio::fs::read_dir(local).await?;
        while let Some(entry) = rd.next_entry().await? {
            if entry.file_type().await?.is_file() {
                written.push(import_file(store, &entry.path(), prefix).await?);
            }
        }
        written.sort();
    } else {
        written.push(import_file(store, local, prefix).await?);
    }
    Ok(written)
}

async fn import_file(store: &Store, local: &Path, prefix: &str) -> Result<String, StoreError> {
    let name = local
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| StoreError::InvalidPath(local.display().to_string()))?;
    let drive_path = if prefix.is_empty() {
        format!("/{name}")
    } else {
        format!("/{}/{}", prefix.trim_matches('/'), name)
    };
    let bytes = tokio::fs::read(local).await?;
    store.put(&drive_path, &bytes).await?;
    Ok(drive_path)
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid drive id: {0}")]
    InvalidId(String),
    #[error("invalid drive path: {0}")]
    InvalidPath(String),
    #[error("corrupt identity file: {0}")]
    CorruptIdentity(String),
}

/// Replication contract the pool and peers need from a remote drive: an
/// explicit fetch-and-wait barrier plus by-path reads. Implemented by
/// `RemoteStore` over a live channel and by scripted fakes in tests.
pub trait Replicator: Send + Sync {
    fn sync(&self) -> impl std::future::Future<Output = Result<(), RpcError>> + Send;
    fn fetch(
        &self,
        path: &str,
    ) -> impl std::future::Future<Output = Result<Vec<u8>, RpcError>> + Send;
    fn list(
        &self,
        dir: &str,
    ) -> impl std::future::Future<Output = Result<Vec<String>, RpcError>> + Send;
}

/// Read-only handle on another identity's drive, pulling through the RPC
/// channel's `store-*` verbs.
pub struct RemoteStore {
    key: PublicKey,
    client: RpcClient,
}

impl RemoteStore {
    pub fn new(key: PublicKey, client: RpcClient) -> Self {
        RemoteStore { key, client }
    }

    pub fn key(&self) -> &PublicKey {
        &self.key
    }
}

impl Replicator for RemoteStore {
    /// Barrier: returns once the remote side has answered, i.e. its current
    /// state is observable. Skipping this before reading an assigned segment
    /// risks a partial or stale view.
    async fn sync(&self) -> Result<(), RpcError> {
        self.client.request(verbs::STORE_SYNC, Vec::new()).await?;
        Ok(())
    }

    async fn fetch(&self, path: &str) -> Result<Vec<u8>, RpcError> {
        let body = serde_json::to_vec(&StoreGetRequest {
            path: path.to_string(),
        })?;
        self.client.request(verbs::STORE_GET, body).await
    }

    async fn list(&self, dir: &str) -> Result<Vec<String>, RpcError> {
        let body = serde_json::to_vec(&StoreListRequest {
            dir: dir.to_string(),
        })?;
        let reply = self.client.request(verbs::STORE_LIST, body).await?;
        let reply: StoreListReply = serde_json::from_slice(&reply)?;
        Ok(reply.entries)
    }
}

/// Serve one `store-*` verb against a local drive. Returns `None` for verbs
/// that are not store verbs so callers can dispatch their own.
pub async fn serve_store_verb(
    store: &Store,
    verb: &str,
    body: &[u8],
) -> Option<Result<Vec<u8>, String>> {
    match verb {
        verbs::STORE_SYNC => Some(Ok(Vec::new())),
        verbs::STORE_GET => Some(serve_get(store, body).await),
        verbs::STORE_LIST => Some(serve_list(store, body).await),
        _ => None,
    }
}

async fn serve_get(store: &Store, body: &[u8]) -> Result<Vec<u8>, String> {
    let req: StoreGetRequest = serde_json::from_slice(body).map_err(|e| e.to_string())?;
    store.get(&req.path).await.map_err(|e| e.to_string())
}

async fn serve_list(store: &Store, body: &[u8]) -> Result<Vec<u8>, String> {
    let req: StoreListRequest = serde_json::from_slice(body).map_err(|e| e.to_string())?;
    let entries = store.list(&req.dir).await.map_err(|e| e.to_string())?;
    serde_json::to_vec(&StoreListReply { entries }).map_err(|e| e.to_string())
}
