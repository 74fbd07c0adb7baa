// sitesnap/src/storage/ftp.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use suppaftp::native_tls::TlsConnector;
use suppaftp::types::FileType;
use suppaftp::{NativeTlsConnector, NativeTlsFtpStream};
use tracing::{debug, info};

use super::{Disk, remote_join, remote_parents};

fn default_ftp_port() -> u16 {
    21
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FtpDiskConfig {
    pub host: String,
    #[serde(default = "default_ftp_port")]
    pub port: u16,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub root: Option<String>,
    /// Explicit FTPS (`AUTH TLS`) after connecting.
    #[serde(default)]
    pub ssl: bool,
}

pub struct FtpDisk {
    name: String,
    cfg: FtpDiskConfig,
}

impl FtpDisk {
    pub fn new(name: &str, cfg: FtpDiskConfig) -> Self {
        FtpDisk {
            name: name.to_string(),
            cfg,
        }
    }

    /// Runs `op` on a logged-in binary-mode session on the blocking pool.
    async fn with_session<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut NativeTlsFtpStream) -> Result<T> + Send + 'static,
    {
        let cfg = self.cfg.clone();
        tokio::task::spawn_blocking(move || {
            let addr = format!("{}:{}", cfg.host, cfg.port);
            let mut ftp = NativeTlsFtpStream::connect(&addr)
                .with_context(|| format!("Failed to connect to FTP server {}", addr))?;
            if cfg.ssl {
                let connector = TlsConnector::new().context("Failed to build TLS connector")?;
                ftp = ftp
                    .into_secure(NativeTlsConnector::from(connector), &cfg.host)
                    .with_context(|| format!("Failed to switch FTP session with {} to TLS", addr))?;
            }
            ftp.login(&cfg.username, &cfg.password)
                .with_context(|| format!("FTP login to {} failed", addr))?;
            ftp.transfer_type(FileType::Binary)
                .context("Failed to switch FTP session to binary mode")?;

            let result = op(&mut ftp);
            let _ = ftp.quit();
            result
        })
        .await
        .context("FTP task panicked")?
    }

    fn path(&self, remote_path: &str) -> String {
        remote_join(self.cfg.root.as_deref(), remote_path)
    }
}

#[async_trait]
impl Disk for FtpDisk {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put_file(&self, remote_path: &str, source: &Path) -> Result<()> {
        let target = self.path(remote_path);
        let source: PathBuf = source.to_path_buf();
        let name = self.name.clone();
        self.with_session(move |ftp| {
            for dir in remote_parents(&target) {
                // Already existing folders make MKD fail; the upload reports real problems.
                if ftp.mkdir(&dir).is_err() {
                    debug!(disk = %name, dir = %dir, "FTP folder exists or could not be created");
                }
            }
            let file = File::open(&source)
                .with_context(|| format!("Failed to open {}", source.display()))?;
            let bytes = ftp
                .put_file(&target, &mut BufReader::new(file))
                .with_context(|| format!("Failed to upload {} to FTP path {}", source.display(), target))?;
            info!(disk = %name, path = %target, bytes, "Uploaded to FTP");
            Ok(())
        })
        .await
    }

    async fn get_file(&self, remote_path: &str, dest: &Path) -> Result<()> {
        let target = self.path(remote_path);
        let dest: PathBuf = dest.to_path_buf();
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }
        self.with_session(move |ftp| {
            let mut stream = ftp
                .retr_as_stream(&target)
                .with_context(|| format!("Failed to download FTP path {}", target))?;
            let mut out = BufWriter::new(
                File::create(&dest).with_context(|| format!("Failed to create {}", dest.display()))?,
            );
            io::copy(&mut stream, &mut out)
                .with_context(|| format!("Failed to write {}", dest.display()))?;
            out.flush()?;
            ftp.finalize_retr_stream(stream)
                .with_context(|| format!("FTP transfer of {} did not complete", target))?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, remote_path: &str) -> Result<()> {
        let target = self.path(remote_path);
        self.with_session(move |ftp| {
            ftp.rm(&target)
                .with_context(|| format!("Failed to delete FTP path {}", target))?;
            Ok(())
        })
        .await
    }
}
