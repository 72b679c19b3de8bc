//! Manifest change notification: a trait seam over "tell me when the
//! manifest changed" plus a polling default that content-hashes the file
//! on a fixed interval.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use sha1::{Digest, Sha1};
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[async_trait]
pub trait ConfigWatcher: Send + Sync {
    /// Returns a receiver that yields one `()` per observed, debounced
    /// change to the watched manifest.
    fn watch(&self) -> mpsc::Receiver<()>;
}

/// Polls the manifest file's content hash on a fixed interval. A change
/// in hash is reported at most once per interval (the interval itself is
/// the debounce window).
pub struct PollWatcher {
    path: PathBuf,
    interval: Duration,
}

impl PollWatcher {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            interval: Duration::from_secs(2),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    fn content_hash(&self) -> Option<String> {
        let contents = std::fs::read(&self.path).ok()?;
        let mut hasher = Sha1::new();
        hasher.update(&contents);
        Some(hex::encode(hasher.finalize()))
    }
}

#[async_trait]
impl ConfigWatcher for PollWatcher {
    fn watch(&self) -> mpsc::Receiver<()> {
        let (tx, rx) = mpsc::channel(4);
        let path = self.path.clone();
        let interval = self.interval;
        let mut last_hash = self.content_hash();

        tokio::spawn(async move {
            let watcher = PollWatcher { path, interval };
            loop {
                tokio::time::sleep(interval).await;
                let hash = watcher.content_hash();
                if hash != last_hash {
                    debug!("manifest change detected");
                    if tx.send(()).await.is_err() {
                        return;
                    }
                    last_hash = hash;
                } else if hash.is_none() {
                    warn!("manifest file unreadable");
                }
            }
        });

        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn detects_content_change() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{{}}").unwrap();

        let watcher = PollWatcher::new(file.path().to_path_buf())
            .with_interval(Duration::from_millis(20));
        let mut rx = watcher.watch();

        writeln!(file, "{{\"Services\":{{}}}}").unwrap();
        file.flush().unwrap();

        let notified = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await;
        assert!(notified.is_ok());
    }
}
