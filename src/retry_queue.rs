use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::webhooks::hmac;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RetryEntry {
    url: String,
    action: String,
    payload: serde_json::Value,
    retries: u32,
}

/// File-backed at-least-once queue (§4.8): a single append-only JSON-lines
/// file scoped to a known directory. Enqueue is a single atomic append;
/// drain rewrites the file via tempfile+rename so a crash mid-drain never
/// leaves a half-written file. Holds an advisory exclusive lock on a
/// sibling `.lock` file for the duration of a drain so concurrent
/// producers/drainers cooperate (§4.8, §5's "multi-producer requires an
/// advisory lock in the file's parent directory").
pub struct RetryQueue {
    path: PathBuf,
    http: reqwest::Client,
    max_retries: u32,
    signing_secret: Option<String>,
}

impl RetryQueue {
    pub fn new(path: PathBuf, max_retries: u32, signing_secret: Option<String>, timeout: Duration) -> Self {
        Self {
            path,
            http: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .expect("reqwest client"),
            max_retries,
            signing_secret,
        }
    }

    fn lock_path(&self) -> PathBuf {
        self.path.with_extension("lock")
    }

    /// Writes one line with `retries=0`. Appending a short line is atomic on
    /// mainstream filesystems, so no lock is taken here.
    pub fn enqueue(&self, url: &str, action: &str, payload: serde_json::Value) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let entry = RetryEntry {
            url: url.to_string(),
            action: action.to_string(),
            payload,
            retries: 0,
        };
        let line = serde_json::to_string(&entry).expect("RetryEntry serializes") + "\n";

        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.write_all(line.as_bytes())
    }

    /// Retries every surviving entry, increments `retries` on failure, drops
    /// entries at/above `max_retries`, and writes survivors back. Removes
    /// the file entirely once it's empty rather than leaving a zero-byte
    /// file behind.
    pub async fn drain(&self) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let lock_file = OpenOptions::new().create(true).write(true).open(self.lock_path())?;
        lock_file.lock_exclusive()?;
        let result = self.drain_locked().await;
        FileExt::unlock(&lock_file).ok();
        result
    }

    async fn drain_locked(&self) -> io::Result<()> {
        let entries = match File::open(&self.path) {
            Ok(file) => BufReader::new(file)
                .lines()
                .map_while(Result::ok)
                .filter(|line| !line.trim().is_empty())
                .filter_map(|line| serde_json::from_str::<RetryEntry>(&line).ok())
                .collect::<Vec<_>>(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };

        let mut survivors = Vec::new();
        for mut entry in entries {
            match self.attempt(&entry).await {
                Ok(()) => info!(url = %entry.url, "retry queue entry delivered"),
                Err(e) => {
                    entry.retries += 1;
                    if entry.retries >= self.max_retries {
                        warn!(url = %entry.url, retries = entry.retries, "retry queue entry dropped after exceeding max retries: {e}");
                    } else {
                        warn!(url = %entry.url, retries = entry.retries, "retry queue entry failed, will retry: {e}");
                        survivors.push(entry);
                    }
                }
            }
        }

        self.write_survivors(&survivors)
    }

    async fn attempt(&self, entry: &RetryEntry) -> Result<(), String> {
        let body = serde_json::to_vec(&entry.payload).map_err(|e| e.to_string())?;
        let mut request = self
            .http
            .post(&entry.url)
            .header("X-Webhook-Action", &entry.action)
            .header("Content-Type", "application/json");

        if let Some(secret) = &self.signing_secret {
            request = request.header("X-Webhook-Signature", format!("sha256={}", hmac::sign(secret, &body)));
        }

        let response = request.body(body).send().await.map_err(|e| e.to_string())?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("downstream returned {}", response.status()))
        }
    }

    fn write_survivors(&self, survivors: &[RetryEntry]) -> io::Result<()> {
        if survivors.is_empty() {
            return match fs::remove_file(&self.path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e),
            };
        }

        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        for entry in survivors {
            let line = serde_json::to_string(entry).expect("RetryEntry serializes") + "\n";
            tmp.write_all(line.as_bytes())?;
        }
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Spawns a TCP listener that answers every connection with the next
    /// status code from `responses` (cycling through, repeating the last
    /// entry once exhausted) and returns its local address.
    async fn spawn_status_server(responses: Vec<u16>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;

                let i = counter.fetch_add(1, Ordering::SeqCst);
                let status = responses.get(i).copied().unwrap_or(*responses.last().unwrap());
                let reason = if status == 200 { "OK" } else { "Internal Server Error" };
                let response = format!("HTTP/1.1 {status} {reason}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });

        format!("http://{addr}")
    }

    #[test]
    fn enqueue_then_drain_file_removed_on_empty_survivors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("retry_queue.jsonl");
        let queue = RetryQueue::new(path.clone(), 10, None, Duration::from_secs(5));

        queue.enqueue("http://example.invalid", "bounce", json!({"a": 1})).unwrap();
        assert!(path.exists());

        queue.write_survivors(&[]).unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn drain_retries_failures_then_drops_at_max_retries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("retry_queue.jsonl");
        let queue = RetryQueue::new(path.clone(), 10, None, Duration::from_secs(5));

        for _ in 0..3 {
            queue.enqueue("PLACEHOLDER", "bounce", json!({"ok": true})).unwrap();
        }

        // Rewrite the placeholder urls to point at a server that always 500s.
        let server = spawn_status_server(vec![500, 500, 500, 500, 500, 500]).await;
        let contents = fs::read_to_string(&path).unwrap();
        fs::write(&path, contents.replace("PLACEHOLDER", &server)).unwrap();

        queue.drain().await.unwrap();
        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        for line in &lines {
            let entry: RetryEntry = serde_json::from_str(line).unwrap();
            assert_eq!(entry.retries, 1);
        }

        // One retries=9 entry: a single more failed drain drops it.
        fs::write(&path, "").unwrap();
        let mut near_limit = RetryEntry {
            url: server.clone(),
            action: "bounce".to_string(),
            payload: json!({}),
            retries: 9,
        };
        near_limit.retries = 9;
        let line = serde_json::to_string(&near_limit).unwrap() + "\n";
        fs::write(&path, line).unwrap();

        queue.drain().await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn drain_clears_queue_once_downstream_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("retry_queue.jsonl");
        let queue = RetryQueue::new(path.clone(), 10, None, Duration::from_secs(5));

        let server = spawn_status_server(vec![200]).await;
        queue.enqueue(&server, "delivery", json!({"domain": "example.com"})).unwrap();

        queue.drain().await.unwrap();
        assert!(!path.exists());
    }
}
