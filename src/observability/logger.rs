//! Access logging.
//!
//! One Apache-compatible line per completed exchange, covering the token
//! set `%v %h %l %u %t %r %>s %b %{Referer}i %{User-agent}i`. Lines go to
//! stdout and, when configured, an append-only log file.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{error, info};

use crate::config::LogsConfig;

/// One completed exchange, as the access log sees it.
#[derive(Debug, Clone)]
pub struct AccessRecord {
    pub vhost: String,
    pub client_ip: String,
    /// Authenticated user from the canonical URL, when present.
    pub user: Option<String>,
    /// `METHOD /path?query HTTP/1.1`
    pub request_line: String,
    pub status: u16,
    pub bytes_sent: Option<u64>,
    pub referer: Option<String>,
    pub user_agent: Option<String>,
    pub timestamp: DateTime<Utc>,
}

pub struct AccessLogger {
    stdout: bool,
    time_format: String,
    writer: Option<Arc<RwLock<tokio::fs::File>>>,
}

impl AccessLogger {
    pub fn new(config: &LogsConfig) -> Result<Self> {
        let writer = match &config.file {
            Some(path) => match Self::create_writer(path) {
                Ok(file) => Some(Arc::new(RwLock::new(file))),
                Err(e) => {
                    error!(path = %path.display(), error = %e, "access log file unavailable");
                    None
                }
            },
            None => None,
        };

        Ok(Self {
            stdout: config.stdout,
            time_format: config.time.clone(),
            writer,
        })
    }

    fn create_writer(path: &std::path::Path) -> Result<tokio::fs::File> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(tokio::fs::File::from_std(file))
    }

    pub async fn log(&self, record: &AccessRecord) {
        let line = self.format(record);

        if self.stdout {
            println!("{}", line);
        } else {
            info!(target: "access", "{}", line);
        }

        if let Some(writer) = &self.writer {
            let mut file = writer.write().await;
            if let Err(e) = file.write_all(format!("{}\n", line).as_bytes()).await {
                error!(error = %e, "access log write failed");
            } else if let Err(e) = file.flush().await {
                error!(error = %e, "access log flush failed");
            }
        }
    }

    fn format(&self, r: &AccessRecord) -> String {
        format!(
            "{} {} - {} [{}] \"{}\" {} {} \"{}\" \"{}\"",
            r.vhost,
            r.client_ip,
            r.user.as_deref().unwrap_or("-"),
            r.timestamp.format(&self.time_format),
            r.request_line,
            r.status,
            r.bytes_sent
                .map(|b| b.to_string())
                .unwrap_or_else(|| "-".to_string()),
            r.referer.as_deref().unwrap_or("-"),
            r.user_agent.as_deref().unwrap_or("-"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> AccessRecord {
        AccessRecord {
            vhost: "main".to_string(),
            client_ip: "192.168.1.9".to_string(),
            user: None,
            request_line: "GET /index.htm HTTP/1.1".to_string(),
            status: 200,
            bytes_sent: Some(5),
            referer: None,
            user_agent: Some("curl/8.0".to_string()),
            timestamp: DateTime::parse_from_rfc3339("2024-01-02T03:04:05Z")
                .unwrap()
                .with_timezone(&Utc),
        }
    }

    #[test]
    fn line_carries_every_token() {
        let logger = AccessLogger::new(&LogsConfig::default()).unwrap();
        let line = logger.format(&record());
        assert!(line.starts_with("main 192.168.1.9 - - ["));
        assert!(line.contains("\"GET /index.htm HTTP/1.1\" 200 5"));
        assert!(line.ends_with("\"-\" \"curl/8.0\""));
    }

    #[test]
    fn missing_fields_render_as_dashes() {
        let logger = AccessLogger::new(&LogsConfig::default()).unwrap();
        let mut r = record();
        r.bytes_sent = None;
        r.user_agent = None;
        let line = logger.format(&r);
        assert!(line.contains(" 200 - "));
        assert!(line.ends_with("\"-\" \"-\""));
    }

    #[test]
    fn authenticated_user_is_logged() {
        let logger = AccessLogger::new(&LogsConfig::default()).unwrap();
        let mut r = record();
        r.user = Some("jane".to_string());
        let line = logger.format(&r);
        assert!(line.contains("- jane ["));
    }

    #[tokio::test]
    async fn file_writer_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        let config = LogsConfig {
            stdout: false,
            file: Some(path.clone()),
            ..LogsConfig::default()
        };
        let logger = AccessLogger::new(&config).unwrap();
        logger.log(&record()).await;

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("GET /index.htm"));
    }
}
