use crate::models::ItemId;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Append-only side channel recording items whose media could not be used,
/// as `product_id,colour_id,url` lines. Entries are de-duplicated against the
/// existing file before appending so repeated runs do not pile up noise.
pub struct FailureLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FailureLog {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    pub fn from_env() -> Self {
        let path = std::env::var("FAILED_MEDIA_LOG")
            .unwrap_or_else(|_| "data/failed_media/failed_media.txt".into());
        Self::new(PathBuf::from(path))
    }

    pub async fn record(&self, product_id: &ItemId, colour_id: Option<&ItemId>, url: &str) {
        let colour = colour_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "None".into());
        let line = format!("{product_id},{colour},{url}\n");
        let _guard = self.lock.lock().await;

        if let Ok(existing) = fs::read_to_string(&self.path)
            && existing.lines().any(|entry| entry == line.trim_end())
        {
            return;
        }

        if let Some(parent) = self.path.parent()
            && let Err(err) = fs::create_dir_all(parent)
        {
            warn!(target: "attrib.failures", error = %err, "could not create failure log directory");
            return;
        }

        info!(target: "attrib.failures", product_id = %product_id, url, "recording failed media reference");
        let appended = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| file.write_all(line.as_bytes()));
        if let Err(err) = appended {
            warn!(target: "attrib.failures", error = %err, "could not append to failure log");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn appends_and_deduplicates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = FailureLog::new(dir.path().join("failed.txt"));
        let id = ItemId::Number(80416852);
        let colour = ItemId::Text("F123".into());

        log.record(&id, Some(&colour), "https://img.example.com/a.jpg")
            .await;
        log.record(&id, Some(&colour), "https://img.example.com/a.jpg")
            .await;
        log.record(&id, None, "-").await;

        let contents = fs::read_to_string(dir.path().join("failed.txt")).expect("read log");
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(
            lines,
            vec![
                "80416852,F123,https://img.example.com/a.jpg",
                "80416852,None,-",
            ]
        );
    }
}
