//! Request access log
//!
//! Writes one line per completed request in nginx-compatible combined
//! format to `logs/access.log`, and serves the tail of that file to the
//! admin API.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Local;
use tracing::{error, info};

/// One completed request
#[derive(Debug, Clone)]
pub struct AccessLogEntry {
    pub client_ip: IpAddr,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub body_bytes: u64,
    pub host: String,
}

pub struct AccessLog {
    file: Mutex<Option<File>>,
    path: PathBuf,
}

impl AccessLog {
    /// Open (or create) the log file; a failed open disables logging
    /// rather than failing startup.
    pub fn open(path: impl Into<PathBuf>) -> Arc<Self> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let file = match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(f) => {
                info!(path = %path.display(), "Access log enabled");
                Some(f)
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "Failed to open access log");
                None
            }
        };

        Arc::new(Self {
            file: Mutex::new(file),
            path,
        })
    }

    pub fn log(&self, entry: &AccessLogEntry) {
        let timestamp = Local::now().format("%d/%b/%Y:%H:%M:%S %z");
        let line = format!(
            "{} - - [{}] \"{} {} HTTP/1.1\" {} {} \"{}\"\n",
            entry.client_ip,
            timestamp,
            entry.method,
            entry.path,
            entry.status,
            entry.body_bytes,
            entry.host,
        );

        let mut guard = self.file.lock().unwrap();
        if let Some(file) = guard.as_mut() {
            if let Err(e) = file.write_all(line.as_bytes()) {
                error!(error = %e, "Failed to write access log line");
            }
        }
    }

    /// Last `lines` lines of the log file, oldest first
    pub fn tail(&self, lines: usize) -> Vec<String> {
        tail_file(&self.path, lines)
    }
}

fn tail_file(path: &Path, lines: usize) -> Vec<String> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => return Vec::new(),
    };
    let all: Vec<&str> = content.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].iter().map(|s| s.to_string()).collect()
}
