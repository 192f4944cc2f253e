use anyhow::{Context, Result};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::protocol::{encode_line, Request, Response};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Blocking one-request-per-connection client for the daemon socket.
#[derive(Debug, Clone)]
pub struct DaemonClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl DaemonClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        DaemonClient {
            socket_path: socket_path.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn send(&self, request: &Request) -> Result<Response> {
        let mut stream = UnixStream::connect(&self.socket_path).with_context(|| {
            format!(
                "Unable to reach the daemon at {}. Is it running?",
                self.socket_path.display()
            )
        })?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;

        stream.write_all(&encode_line(request)?)?;
        stream.flush()?;

        let mut line = String::new();
        BufReader::new(&stream)
            .read_line(&mut line)
            .context("Reading daemon response")?;
        if line.trim().is_empty() {
            anyhow::bail!("Daemon closed the connection without responding");
        }
        serde_json::from_str(line.trim_end()).context("Malformed daemon response")
    }

    pub fn is_running(&self) -> bool {
        self.send(&Request::Ping).is_ok()
    }
}
