// sitesnap/src/storage/sftp.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use ssh2::{Session, Sftp};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::{Disk, remote_join, remote_parents};

fn default_sftp_port() -> u16 {
    22
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SftpDiskConfig {
    pub host: String,
    #[serde(default = "default_sftp_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    /// PEM private key contents, used instead of the password when present.
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub passphrase: Option<String>,
    #[serde(default)]
    pub root: Option<String>,
}

pub struct SftpDisk {
    name: String,
    cfg: SftpDiskConfig,
}

impl SftpDisk {
    pub fn new(name: &str, cfg: SftpDiskConfig) -> Self {
        SftpDisk {
            name: name.to_string(),
            cfg,
        }
    }

    async fn with_sftp<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Sftp) -> Result<T> + Send + 'static,
    {
        let cfg = self.cfg.clone();
        tokio::task::spawn_blocking(move || {
            let addr = format!("{}:{}", cfg.host, cfg.port);
            let tcp = TcpStream::connect(&addr)
                .with_context(|| format!("Failed to connect to SFTP server {}", addr))?;
            let mut session = Session::new().context("Failed to create SSH session")?;
            session.set_tcp_stream(tcp);
            session
                .handshake()
                .with_context(|| format!("SSH handshake with {} failed", addr))?;

            match (&cfg.private_key, &cfg.password) {
                (Some(key), _) => session
                    .userauth_pubkey_memory(&cfg.username, None, key, cfg.passphrase.as_deref())
                    .with_context(|| format!("SSH key authentication for {} failed", cfg.username))?,
                (None, Some(password)) => session
                    .userauth_password(&cfg.username, password)
                    .with_context(|| format!("SSH password authentication for {} failed", cfg.username))?,
                (None, None) => anyhow::bail!("SFTP disk needs a password or a private_key"),
            }

            let sftp = session.sftp().context("Failed to open SFTP channel")?;
            op(&sftp)
        })
        .await
        .context("SFTP task panicked")?
    }

    fn path(&self, remote_path: &str) -> String {
        remote_join(self.cfg.root.as_deref(), remote_path)
    }
}

#[async_trait]
impl Disk for SftpDisk {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put_file(&self, remote_path: &str, source: &Path) -> Result<()> {
        let target = self.path(remote_path);
        let source: PathBuf = source.to_path_buf();
        let name = self.name.clone();
        self.with_sftp(move |sftp| {
            for dir in remote_parents(&target) {
                if sftp.mkdir(Path::new(&dir), 0o755).is_err() {
                    debug!(disk = %name, dir = %dir, "SFTP folder exists or could not be created");
                }
            }
            let mut reader = BufReader::new(
                File::open(&source).with_context(|| format!("Failed to open {}", source.display()))?,
            );
            let mut remote = sftp
                .create(Path::new(&target))
                .with_context(|| format!("Failed to create SFTP file {}", target))?;
            let bytes = io::copy(&mut reader, &mut remote)
                .with_context(|| format!("Failed to upload {} to SFTP path {}", source.display(), target))?;
            info!(disk = %name, path = %target, bytes, "Uploaded to SFTP");
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
        self.with_sftp(move |sftp| {
            let mut remote = sftp
                .open(Path::new(&target))
                .with_context(|| format!("Failed to open SFTP file {}", target))?;
            let mut out = BufWriter::new(
                File::create(&dest).with_context(|| format!("Failed to create {}", dest.display()))?,
            );
            io::copy(&mut remote, &mut out)
                .with_context(|| format!("Failed to download SFTP file {}", target))?;
            out.flush()?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, remote_path: &str) -> Result<()> {
        let target = self.path(remote_path);
        self.with_sftp(move |sftp| {
            sftp.unlink(Path::new(&target))
                .with_context(|| format!("Failed to delete SFTP file {}", target))?;
            Ok(())
        })
        .await
    }
}
