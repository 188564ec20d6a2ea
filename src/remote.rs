use async_trait::async_trait;
use ssh2::{Session, Sftp};
use std::collections::HashSet;
use std::fs;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub inbound_dir: String,
    pub outbound_dir: String,
    /// Name of the archive sub-container under `inbound_dir`.
    pub archive_dir: String,
}

impl RemoteConfig {
    pub fn from_env() -> eyre::Result<Self> {
        Ok(Self {
            host: require("REMOTE_HOST")?,
            port: std::env::var("REMOTE_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(22),
            username: require("REMOTE_USERNAME")?,
            password: require("REMOTE_PASSWORD")?,
            inbound_dir: std::env::var("REMOTE_INBOUND_DIR").unwrap_or_else(|_| "inbound".into()),
            outbound_dir: std::env::var("REMOTE_OUTBOUND_DIR")
                .unwrap_or_else(|_| "outbound".into()),
            archive_dir: std::env::var("REMOTE_ARCHIVE_DIR").unwrap_or_else(|_| "archive".into()),
        })
    }
}

fn require(key: &str) -> eyre::Result<String> {
    std::env::var(key).map_err(|_| eyre::eyre!("{key} is not set"))
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("unable to open session to `{host}`: {message}")]
    Connection { host: String, message: String },
    #[error("transfer failed for `{key}`: {message}")]
    Transfer { key: String, message: String },
    #[error("background transfer task failed: {0}")]
    Task(String),
}

/// A remote object, addressed by its path relative to the endpoint root,
/// e.g. `inbound/20250812/80416852.json`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteKey {
    pub path: String,
}

impl RemoteKey {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    pub fn basename(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

#[derive(Debug, Default)]
pub struct PublishReport {
    pub uploaded: usize,
    pub archived: usize,
    /// Basenames that could not be archived and were left in place for
    /// manual recovery.
    pub archive_failures: Vec<String>,
}

/// Scheduler-facing seam over the remote endpoint. Each method covers one
/// connect/operate/close phase of a cycle.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// POLLING: list up to `max_items` inbound items and download them into
    /// `inbox`. Returns the keys actually pulled; a key whose download fails
    /// is skipped, not fatal.
    async fn pull_batch(&self, inbox: &Path, max_items: usize)
    -> Result<Vec<RemoteKey>, RemoteError>;

    /// PUBLISHING: upload every result file in `outbox` to the outbound
    /// container, then archive the `processed` originals server-side.
    async fn publish_results(
        &self,
        outbox: &Path,
        processed: &[RemoteKey],
    ) -> Result<PublishReport, RemoteError>;
}

/// SFTP-backed store. The blocking `ssh2` session runs on the blocking pool;
/// one session is opened and closed per phase, matching the remote side's
/// expectation of short-lived connections.
pub struct SftpStore {
    config: RemoteConfig,
}

impl SftpStore {
    pub fn new(config: RemoteConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl RemoteStore for SftpStore {
    async fn pull_batch(
        &self,
        inbox: &Path,
        max_items: usize,
    ) -> Result<Vec<RemoteKey>, RemoteError> {
        let config = self.config.clone();
        let inbox = inbox.to_path_buf();
        tokio::task::spawn_blocking(move || pull_batch_blocking(&config, &inbox, max_items))
            .await
            .map_err(|err| RemoteError::Task(err.to_string()))?
    }

    async fn publish_results(
        &self,
        outbox: &Path,
        processed: &[RemoteKey],
    ) -> Result<PublishReport, RemoteError> {
        let config = self.config.clone();
        let outbox = outbox.to_path_buf();
        let processed = processed.to_vec();
        tokio::task::spawn_blocking(move || publish_results_blocking(&config, &outbox, &processed))
            .await
            .map_err(|err| RemoteError::Task(err.to_string()))?
    }
}

fn pull_batch_blocking(
    config: &RemoteConfig,
    inbox: &Path,
    max_items: usize,
) -> Result<Vec<RemoteKey>, RemoteError> {
    let session = SftpSession::connect(config)?;
    let keys = session.list_batch(&config.inbound_dir, &config.archive_dir, max_items)?;

    if let Err(err) = fs::create_dir_all(inbox) {
        return Err(RemoteError::Transfer {
            key: inbox.display().to_string(),
            message: err.to_string(),
        });
    }

    let mut pulled = Vec::new();
    for key in keys {
        match session.fetch(&key) {
            Ok(bytes) => {
                let local = inbox.join(key.basename());
                match fs::write(&local, &bytes) {
                    Ok(()) => {
                        info!(target: "attrib.remote", key = %key.path, local = %local.display(), "downloaded");
                        pulled.push(key);
                    }
                    Err(err) => {
                        error!(target: "attrib.remote", key = %key.path, error = %err, "could not save locally, skipping")
                    }
                }
            }
            Err(err) => {
                error!(target: "attrib.remote", key = %key.path, error = %err, "download failed, skipping")
            }
        }
    }
    session.close();
    Ok(pulled)
}

fn publish_results_blocking(
    config: &RemoteConfig,
    outbox: &Path,
    processed: &[RemoteKey],
) -> Result<PublishReport, RemoteError> {
    let session = SftpSession::connect(config)?;

    let mut uploaded = 0;
    let entries = fs::read_dir(outbox).map_err(|err| RemoteError::Transfer {
        key: outbox.display().to_string(),
        message: err.to_string(),
    })?;
    let mut names: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file() && path.extension().is_some_and(|ext| ext == "json")
        })
        .collect();
    names.sort();
    for path in names {
        session.upload(&path, &config.outbound_dir)?;
        uploaded += 1;
    }
    info!(target: "attrib.remote", uploaded, "uploaded result files");

    let archive_failures = session.archive(&config.inbound_dir, &config.archive_dir, processed);
    let archived = processed.len() - archive_failures.len();
    session.close();
    Ok(PublishReport {
        uploaded,
        archived,
        archive_failures,
    })
}

/// One authenticated SFTP session. Dropping the session disconnects, so every
/// early-return path releases the connection.
struct SftpSession {
    session: Session,
    sftp: Sftp,
}

impl SftpSession {
    fn connect(config: &RemoteConfig) -> Result<Self, RemoteError> {
        info!(target: "attrib.remote", host = %config.host, user = %config.username, "connecting");
        let connection = || -> Result<(Session, Sftp), String> {
            let tcp = TcpStream::connect((config.host.as_str(), config.port))
                .map_err(|err| err.to_string())?;
            let mut session = Session::new().map_err(|err| err.to_string())?;
            session.set_tcp_stream(tcp);
            session.handshake().map_err(|err| err.to_string())?;
            session
                .userauth_password(&config.username, &config.password)
                .map_err(|err| err.to_string())?;
            let sftp = session.sftp().map_err(|err| err.to_string())?;
            Ok((session, sftp))
        };
        match connection() {
            Ok((session, sftp)) => Ok(Self { session, sftp }),
            Err(message) => {
                error!(target: "attrib.remote", host = %config.host, error = %message, "unable to open sftp session");
                Err(RemoteError::Connection {
                    host: config.host.clone(),
                    message,
                })
            }
        }
    }

    /// List up to `max_items` `.json` objects under `container`, descending
    /// one level into date-stamped (`YYYYMMDD`) subfolders. The archive
    /// subfolder is never listed, and a key never appears twice (duplicate
    /// basenames across subfolders are skipped).
    fn list_batch(
        &self,
        container: &str,
        archive_dir: &str,
        max_items: usize,
    ) -> Result<Vec<RemoteKey>, RemoteError> {
        let entries = self
            .sftp
            .readdir(Path::new(container))
            .map_err(|err| RemoteError::Transfer {
                key: container.to_string(),
                message: err.to_string(),
            })?;

        let mut keys = Vec::new();
        for (path, stat) in entries {
            let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            if stat.is_file() {
                if name.ends_with(".json") {
                    keys.push(RemoteKey::new(path.to_string_lossy().into_owned()));
                } else {
                    warn!(target: "attrib.remote", file = %name, "skipping non-json object");
                }
            } else if stat.is_dir() && name != archive_dir && is_date_folder(&name) {
                let sub = self
                    .sftp
                    .readdir(&path)
                    .map_err(|err| RemoteError::Transfer {
                        key: path.to_string_lossy().into_owned(),
                        message: err.to_string(),
                    })?;
                for (sub_path, sub_stat) in sub {
                    let is_json = sub_path
                        .file_name()
                        .map(|n| n.to_string_lossy().ends_with(".json"))
                        .unwrap_or(false);
                    if sub_stat.is_file() && is_json {
                        keys.push(RemoteKey::new(sub_path.to_string_lossy().into_owned()));
                    }
                }
            }
        }

        let mut seen = HashSet::new();
        keys.retain(|key| {
            let fresh = seen.insert(key.basename().to_string());
            if !fresh {
                warn!(target: "attrib.remote", key = %key.path, "duplicate basename in batch, skipping");
            }
            fresh
        });
        keys.sort_by(|a, b| a.path.cmp(&b.path));
        keys.truncate(max_items);
        info!(target: "attrib.remote", container, found = keys.len(), "listed inbound batch");
        Ok(keys)
    }

    fn fetch(&self, key: &RemoteKey) -> Result<Vec<u8>, RemoteError> {
        let mut remote = self
            .sftp
            .open(Path::new(&key.path))
            .map_err(|err| RemoteError::Transfer {
                key: key.path.clone(),
                message: err.to_string(),
            })?;
        let mut bytes = Vec::new();
        remote
            .read_to_end(&mut bytes)
            .map_err(|err| RemoteError::Transfer {
                key: key.path.clone(),
                message: err.to_string(),
            })?;
        Ok(bytes)
    }

    /// Push one local file into `container`, overwriting any existing object
    /// of the same name.
    fn upload(&self, local_path: &Path, container: &str) -> Result<(), RemoteError> {
        let name = local_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let remote_path = format!("{}/{name}", container.trim_end_matches('/'));
        info!(target: "attrib.remote", file = %name, remote = %remote_path, "uploading");

        let bytes = fs::read(local_path).map_err(|err| RemoteError::Transfer {
            key: name.clone(),
            message: err.to_string(),
        })?;
        let mut remote =
            self.sftp
                .create(Path::new(&remote_path))
                .map_err(|err| RemoteError::Transfer {
                    key: remote_path.clone(),
                    message: err.to_string(),
                })?;
        remote
            .write_all(&bytes)
            .map_err(|err| RemoteError::Transfer {
                key: remote_path,
                message: err.to_string(),
            })
    }

    /// Server-side rename of each key into `container/archive_dir`. See
    /// [`archive_keys`] for the per-key collision policy.
    fn archive(&self, container: &str, archive_dir: &str, keys: &[RemoteKey]) -> Vec<String> {
        let archive_root = format!("{}/{archive_dir}", container.trim_end_matches('/'));
        if let Err(err) = self.ensure_dir(&archive_root) {
            error!(target: "attrib.remote", dir = %archive_root, error = %err, "archive directory unavailable, leaving batch in place");
            return keys.iter().map(|k| k.basename().to_string()).collect();
        }
        archive_keys(self, &archive_root, keys)
    }

    fn ensure_dir(&self, dir: &str) -> Result<(), ssh2::Error> {
        let path = Path::new(dir);
        match self.sftp.stat(path) {
            Ok(stat) if stat.is_dir() => Ok(()),
            _ => self.sftp.mkdir(path, 0o755),
        }
    }

    fn close(self) {
        info!(target: "attrib.remote", "closing sftp session");
        // Drop disconnects.
    }
}

/// Rename/stat/unlink subset of the endpoint used by the archive step.
trait ArchiveOps {
    fn rename(&self, src: &Path, dst: &Path) -> Result<(), String>;
    fn exists(&self, path: &Path) -> bool;
    fn unlink(&self, path: &Path) -> Result<(), String>;
}

impl ArchiveOps for SftpSession {
    fn rename(&self, src: &Path, dst: &Path) -> Result<(), String> {
        self.sftp.rename(src, dst, None).map_err(|err| err.to_string())
    }

    fn exists(&self, path: &Path) -> bool {
        self.sftp.stat(path).is_ok()
    }

    fn unlink(&self, path: &Path) -> Result<(), String> {
        self.sftp.unlink(path).map_err(|err| err.to_string())
    }
}

/// Per-key archive policy. A rename onto an existing archive entry (stale
/// leftover from an earlier partial run) removes that entry and retries once.
/// A key whose source is already gone while the archive entry exists was
/// consumed by an earlier run and counts as archived; the surviving entry is
/// never unlinked. Any other failure leaves the key in place. Returns the
/// basenames that could not be archived.
fn archive_keys(ops: &impl ArchiveOps, archive_root: &str, keys: &[RemoteKey]) -> Vec<String> {
    let mut failures = Vec::new();
    for key in keys {
        let src = Path::new(&key.path);
        let dst_path = format!("{archive_root}/{}", key.basename());
        let dst = Path::new(&dst_path);
        for attempt in 0..2 {
            match ops.rename(src, dst) {
                Ok(()) => {
                    info!(target: "attrib.remote", from = %key.path, to = %dst_path, "archived");
                    break;
                }
                Err(_) if !ops.exists(src) && ops.exists(dst) => {
                    info!(target: "attrib.remote", key = %key.path, "already archived by an earlier run");
                    break;
                }
                Err(err) if attempt == 0 && ops.exists(dst) => {
                    warn!(
                        target: "attrib.remote",
                        key = %key.path,
                        error = %err,
                        "archive target already exists, removing stale entry and retrying"
                    );
                    if let Err(unlink_err) = ops.unlink(dst) {
                        warn!(target: "attrib.remote", target_file = %dst_path, error = %unlink_err, "could not remove stale archive entry");
                    }
                }
                Err(err) => {
                    error!(target: "attrib.remote", key = %key.path, error = %err, "could not archive, leaving key in place");
                    failures.push(key.basename().to_string());
                    break;
                }
            }
        }
    }
    failures
}

impl Drop for SftpSession {
    fn drop(&mut self) {
        let _ = self
            .session
            .disconnect(None, "attribute worker done", None);
    }
}

fn is_date_folder(name: &str) -> bool {
    name.len() == 8 && name.bytes().all(|b| b.is_ascii_digit())
}
