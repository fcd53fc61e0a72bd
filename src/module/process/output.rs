//! Module output capture
//!
//! A module's stderr is read line by line into a bounded in-memory buffer
//! and, unless output is private, appended to `<logs_dir>/<name>.log`.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub struct OutputLog {
    lines: Mutex<VecDeque<String>>,
    capacity: usize,
    file: Option<PathBuf>,
}

impl OutputLog {
    pub fn new(capacity: usize, file: Option<PathBuf>) -> Self {
        Self {
            lines: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
            file,
        }
    }

    pub fn file(&self) -> Option<&PathBuf> {
        self.file.as_ref()
    }

    pub async fn push(&self, line: String) {
        let mut lines = self.lines.lock().await;
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Buffered lines joined with newlines
    pub async fn text(&self) -> String {
        let lines = self.lines.lock().await;
        let mut text = String::new();
        for line in lines.iter() {
            text.push_str(line);
            text.push('\n');
        }
        text
    }
}

/// Spawn the task that drains `stream` into `log`
pub fn spawn_capture<R>(name: String, stream: R, log: Arc<OutputLog>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut file = match log.file() {
            Some(path) => open_log(path).await,
            None => None,
        };

        // Raw reads: a line that is not UTF-8 must not stop the drain
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = decode_line(&buf);
                    if let Some(handle) = file.as_mut() {
                        let mut record = line.clone();
                        record.push('\n');
                        if let Err(e) = handle.write_all(record.as_bytes()).await {
                            warn!("Module {} log write failed, disabling file output: {}", name, e);
                            file = None;
                        }
                    }
                    log.push(line).await;
                }
                Err(e) => {
                    debug!("Module {} output stream error: {}", name, e);
                    break;
                }
            }
        }
        if let Some(mut handle) = file {
            let _ = handle.flush().await;
        }
    })
}

/// Strip the line terminator and replace invalid UTF-8
fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

async fn open_log(path: &PathBuf) -> Option<tokio::fs::File> {
    if let Some(parent) = path.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            warn!("Cannot create log directory {}: {}", parent.display(), e);
            return None;
        }
    }
    match tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
    {
        Ok(file) => Some(file),
        Err(e) => {
            warn!("Cannot open module log {}: {}", path.display(), e);
            None
        }
    }
}
