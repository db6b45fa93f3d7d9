//! Per-request access logging.
//!
//! Records travel over an unbounded channel to a single writer task, so
//! a slow disk never blocks a dispatch. The line format follows the
//! Common Log Format with the upstream host first and the referer and
//! user agent quoted at the end:
//!
//! ```text
//! www.example.com 203.0.113.9:51123 - - [01/08/2026:11:02:47 +0000] "GET /x HTTP/1.1" 200 5 "" "curl/8.5"
//! ```

use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use crate::error::{Error, Result};

const TIMESTAMP_FORMAT: &str = "%d/%m/%Y:%H:%M:%S %z";

/// One access-log record.
#[derive(Debug, Clone)]
pub struct Record {
    /// Virtual host the request addressed.
    pub host: String,
    /// Client address as seen by the listener.
    pub remote: String,
    /// When the request began, in UTC.
    pub timestamp: DateTime<Utc>,
    /// Request method.
    pub method: String,
    /// Request-URI as received.
    pub uri: String,
    /// Protocol, e.g. `HTTP/1.1`.
    pub protocol: String,
    /// Response status code.
    pub status: u16,
    /// Response content length; −1 when unknown.
    pub content_length: i64,
    /// `Referer` header, empty when absent.
    pub referer: String,
    /// `User-Agent` header, empty when absent.
    pub user_agent: String,
}

impl Record {
    /// Renders the record as one log line (without a trailing newline).
    pub fn format_line(&self) -> String {
        format!(
            "{} {} - - [{}] \"{} {} {}\" {} {} \"{}\" \"{}\"",
            self.host,
            self.remote,
            self.timestamp.format(TIMESTAMP_FORMAT),
            self.method,
            self.uri,
            self.protocol,
            self.status,
            self.content_length,
            self.referer,
            self.user_agent,
        )
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.format_line())
    }
}

/// Cloneable handle to the access-log sink.
#[derive(Debug, Clone)]
pub struct AccessLog {
    tx: mpsc::UnboundedSender<Record>,
}

impl AccessLog {
    /// Opens the access log, appending to `path` when one is configured
    /// and falling back to stderr otherwise.
    pub async fn open(path: Option<&Path>) -> Result<AccessLog> {
        let (tx, rx) = mpsc::unbounded_channel();

        match path {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await
                    .map_err(Error::config)?;
                tokio::spawn(write_loop(file, rx));
            }
            None => {
                tokio::spawn(stderr_loop(rx));
            }
        }

        Ok(AccessLog { tx })
    }

    /// Queues one record. Never blocks; a closed sink drops the record.
    pub fn log(&self, record: Record) {
        let _ = self.tx.send(record);
    }
}

async fn write_loop(mut file: tokio::fs::File, mut rx: mpsc::UnboundedReceiver<Record>) {
    while let Some(record) = rx.recv().await {
        let mut line = record.format_line();
        line.push('\n');
        if let Err(e) = file.write_all(line.as_bytes()).await {
            log::error!("writing access log failed: {e}");
        }
    }
}

async fn stderr_loop(mut rx: mpsc::UnboundedReceiver<Record>) {
    while let Some(record) = rx.recv().await {
        eprintln!("{record}");
    }
}
