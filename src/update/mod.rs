// sitesnap/src/update/mod.rs
//! Self-update process: fetch the release feed, download the newest package
//! and overlay it onto the application while maintenance mode is held.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::app::AppContext;
use crate::backup::archive;
use crate::engine::state::ProcessState;
use crate::engine::{LockAttempt, Process, ProcessKind, StepContext, StepOutcome, step_sequence};
use crate::errors::AppError;
use crate::restore::files::overlay_tree;
use crate::settings::APP_VERSION;
use crate::utils::{human_size, run_command};

step_sequence! {
    pub enum UpdateStep {
        Start => "start",
        CheckVersion => "check_version",
        Download => "download",
        Extract => "extract",
        Migrate => "migrate",
        Clean => "clean",
        Finished => "finished",
    }
}

const PACKAGE_FILE: &str = "update.zip";

// Payload keys
const WORK_DIR: &str = "work_dir";
const TARGET_VERSION: &str = "target_version";
const PACKAGE_URL: &str = "package_url";
const PACKAGE_PATH: &str = "package_path";

/// One published release.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseManifest {
    pub version: String,
    /// Package location, absolute or relative to the feed URL.
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub released_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub logs: Vec<String>,
}

/// The feed is either the latest release alone or a list of releases.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ReleaseFeed {
    Many(Vec<ReleaseManifest>),
    One(ReleaseManifest),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionReport {
    pub current_version: String,
    pub latest_version: Option<String>,
    pub is_updated: bool,
    pub versions: Vec<ReleaseManifest>,
}

fn parse_version(raw: &str) -> Result<semver::Version> {
    semver::Version::parse(raw.trim().trim_start_matches('v'))
        .with_context(|| format!("Invalid version '{}'", raw))
}

/// Whether `candidate` is a strictly newer release than `current`.
pub fn is_newer(candidate: &str, current: &str) -> Result<bool> {
    Ok(parse_version(candidate)? > parse_version(current)?)
}

fn http_client(app: &AppContext) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(app.config.update.download_timeout)
        .build()
        .context("Failed to build HTTP client")
}

fn manifest_url(app: &AppContext) -> Result<url::Url> {
    let raw = app.config.update.manifest_url.as_deref().ok_or_else(|| {
        AppError::Config("update.manifest_url is not set in config.json".to_string())
    })?;
    url::Url::parse(raw).with_context(|| format!("Invalid update manifest URL '{}'", raw))
}

/// Releases from the feed, newest first. Entries with an unparsable
/// version are dropped.
pub async fn fetch_releases(app: &AppContext) -> Result<(url::Url, Vec<ReleaseManifest>)> {
    let feed_url = manifest_url(app)?;
    let feed: ReleaseFeed = http_client(app)?
        .get(feed_url.clone())
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .with_context(|| format!("Failed to fetch update manifest from {}", feed_url))?
        .json()
        .await
        .context("Update manifest is not valid JSON")?;

    let mut releases: Vec<(semver::Version, ReleaseManifest)> = match feed {
        ReleaseFeed::Many(list) => list,
        ReleaseFeed::One(single) => vec![single],
    }
    .into_iter()
    .filter_map(|release| match parse_version(&release.version) {
        Ok(version) => Some((version, release)),
        Err(e) => {
            warn!(error = %e, "Skipping release with invalid version");
            None
        }
    })
    .collect();
    releases.sort_by(|a, b| b.0.cmp(&a.0));
    Ok((feed_url, releases.into_iter().map(|(_, r)| r).collect()))
}

/// Current vs. published versions.
pub async fn versions(app: &AppContext) -> Result<VersionReport> {
    let current_version = app.settings.app_version()?;
    let (_, versions) = fetch_releases(app).await?;
    let latest_version = versions.first().map(|r| r.version.clone());
    let is_updated = match &latest_version {
        Some(latest) => !is_newer(latest, &current_version)?,
        None => true,
    };
    Ok(VersionReport {
        current_version,
        latest_version,
        is_updated,
        versions,
    })
}

pub struct UpdateProcess {
    app: Arc<AppContext>,
}

impl UpdateProcess {
    pub fn new(app: Arc<AppContext>) -> Self {
        UpdateProcess { app }
    }

    fn work_dir(&self, actor: &str) -> PathBuf {
        self.app.config.updates_dir().join(actor)
    }

    async fn start(&self, ctx: &mut StepContext<'_>) -> Result<StepOutcome<UpdateStep>> {
        if self.app.config.update.manifest_url.is_none() {
            return Ok(StepOutcome::reject(
                "No update source configured (update.manifest_url)",
            ));
        }
        if let LockAttempt::Busy(held) = ctx.acquire_lock()? {
            return Ok(StepOutcome::reject(held.busy_message()));
        }

        let work_dir = self.work_dir(ctx.actor());
        if work_dir.exists() {
            fs::remove_dir_all(&work_dir)
                .with_context(|| format!("Failed to clear {}", work_dir.display()))?;
        }
        fs::create_dir_all(&work_dir)
            .with_context(|| format!("Failed to create {}", work_dir.display()))?;
        ctx.state.set(WORK_DIR, &work_dir)?;

        info!(actor = ctx.actor(), "Update started, maintenance mode on");
        Ok(StepOutcome::advance(UpdateStep::CheckVersion, "Update started"))
    }

    async fn check_version(&self, ctx: &mut StepContext<'_>) -> Result<StepOutcome<UpdateStep>> {
        let current = self.app.settings.app_version()?;
        let (feed_url, releases) = fetch_releases(&self.app).await?;
        let latest = releases
            .into_iter()
            .next()
            .ok_or_else(|| AppError::Precondition("The update feed lists no releases".to_string()))?;

        if !is_newer(&latest.version, &current)? {
            return Err(AppError::Precondition(format!(
                "Version {} is already the latest version",
                current
            ))
            .into());
        }

        let package_url = feed_url
            .join(&latest.url)
            .with_context(|| format!("Invalid package URL '{}'", latest.url))?;
        ctx.state.set(TARGET_VERSION, &latest.version)?;
        ctx.state.set(PACKAGE_URL, package_url.as_str())?;
        Ok(StepOutcome::advance(
            UpdateStep::Download,
            format!("Updating from {} to {}", current, latest.version),
        ))
    }

    async fn download(&self, ctx: &mut StepContext<'_>) -> Result<StepOutcome<UpdateStep>> {
        let work_dir: PathBuf = ctx.state.require(WORK_DIR)?;
        let package_url: String = ctx.state.require(PACKAGE_URL)?;
        let package_path = work_dir.join(PACKAGE_FILE);

        let mut response = http_client(&self.app)?
            .get(&package_url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .with_context(|| format!("Failed to download update package from {}", package_url))?;

        let mut out = tokio::fs::File::create(&package_path)
            .await
            .with_context(|| format!("Failed to create {}", package_path.display()))?;
        let mut written = 0u64;
        while let Some(chunk) = response
            .chunk()
            .await
            .context("Update package download was interrupted")?
        {
            out.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        out.flush().await?;

        ctx.state.set(PACKAGE_PATH, &package_path)?;
        Ok(StepOutcome::advance(
            UpdateStep::Extract,
            format!("Update package downloaded ({})", human_size(written)),
        ))
    }

    async fn extract(&self, ctx: &mut StepContext<'_>) -> Result<StepOutcome<UpdateStep>> {
        let work_dir: PathBuf = ctx.state.require(WORK_DIR)?;
        let package_path: PathBuf = ctx.state.require(PACKAGE_PATH)?;
        if !package_path.is_file() {
            return Err(AppError::Integrity(format!(
                "update package {} is missing",
                package_path.display()
            ))
            .into());
        }

        let unzipped = work_dir.join("unzipped");
        archive::extract_archive(&package_path, &unzipped)?;
        let copied = overlay_tree(&unzipped, &self.app.config.app_root)?;
        Ok(StepOutcome::advance(
            UpdateStep::Migrate,
            format!("{} file(s) updated", copied),
        ))
    }

    async fn migrate(&self) -> Result<StepOutcome<UpdateStep>> {
        let config = &self.app.config;
        let Some(command) = &config.update.migrate_command else {
            return Ok(StepOutcome::advance(
                UpdateStep::Clean,
                "No migration command configured",
            ));
        };
        run_command(command, &config.app_root)
            .await
            .context("Database migration failed")?;
        Ok(StepOutcome::advance(UpdateStep::Clean, "Database migrated"))
    }

    async fn clean(&self, ctx: &mut StepContext<'_>) -> Result<StepOutcome<UpdateStep>> {
        let work_dir: PathBuf = ctx.state.require(WORK_DIR)?;
        remove_dir(&work_dir)?;
        Ok(StepOutcome::advance(UpdateStep::Finished, "Temporary files removed"))
    }

    async fn finished(&self, ctx: &mut StepContext<'_>) -> Result<StepOutcome<UpdateStep>> {
        let target: String = ctx.state.require(TARGET_VERSION)?;
        let config = &self.app.config;
        if let Some(command) = &config.restore.cache_clear_command {
            if let Err(e) = run_command(command, &config.app_root).await {
                warn!(error = %format!("{e:#}"), "Cache clear after update failed");
            }
        }
        self.app.settings.set(APP_VERSION, &target)?;
        Ok(StepOutcome::finish(format!(
            "Update to {} completed, maintenance mode off",
            target
        )))
    }
}

fn remove_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir).with_context(|| format!("Failed to remove {}", dir.display()))?;
    }
    Ok(())
}

#[async_trait]
impl Process for UpdateProcess {
    type Step = UpdateStep;
    const KIND: ProcessKind = ProcessKind::Update;

    async fn run_step(
        &self,
        step: UpdateStep,
        ctx: &mut StepContext<'_>,
    ) -> Result<StepOutcome<UpdateStep>> {
        match step {
            UpdateStep::Start => self.start(ctx).await,
            UpdateStep::CheckVersion => self.check_version(ctx).await,
            UpdateStep::Download => self.download(ctx).await,
            UpdateStep::Extract => self.extract(ctx).await,
            UpdateStep::Migrate => self.migrate().await,
            UpdateStep::Clean => self.clean(ctx).await,
            UpdateStep::Finished => self.finished(ctx).await,
        }
    }

    async fn cleanup(&self, state: &ProcessState) {
        let work_dir = state
            .get::<PathBuf>(WORK_DIR)
            .unwrap_or_else(|| self.work_dir(&state.actor));
        if let Err(e) = remove_dir(&work_dir) {
            warn!(error = %format!("{e:#}"), "Failed to remove update work directory");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{testing, update_engine};
    use mockito::{Mock, Server, ServerGuard};
    use serde_json::json;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::ZipWriter;
    use zip::write::FileOptions;

    /// Release feed plus package endpoints. Mocks stay registered while this lives.
    struct FeedServer {
        server: ServerGuard,
        mocks: Vec<Mock>,
    }

    impl FeedServer {
        async fn start(feed: serde_json::Value) -> Self {
            let mut server = Server::new_async().await;
            let feed_mock = server
                .mock("GET", "/releases.json")
                .with_status(200)
                .with_header("content-type", "application/json")
                .with_body(feed.to_string())
                .create_async()
                .await;
            let package_mock = server
                .mock("GET", "/packages/2.0.0.zip")
                .with_status(200)
                .with_header("content-type", "application/zip")
                .with_body(package(&[("app/Version.php", "2.0.0")]))
                .create_async()
                .await;
            FeedServer {
                server,
                mocks: vec![feed_mock, package_mock],
            }
        }

        async fn missing(&mut self, path: &str) -> Mock {
            self.server
                .mock("GET", path)
                .with_status(404)
                .with_body("not found")
                .create_async()
                .await
        }

        fn feed_url(&self) -> String {
            format!("{}/releases.json", self.server.url())
        }
    }

    fn package(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut zip = ZipWriter::new(std::io::Cursor::new(Vec::new()));
        for (path, body) in entries {
            zip.start_file(*path, FileOptions::default()).unwrap();
            zip.write_all(body.as_bytes()).unwrap();
        }
        zip.finish().unwrap().into_inner()
    }

    async fn app_with_feed(dir: &TempDir, feed: serde_json::Value) -> (FeedServer, Arc<AppContext>) {
        let server = FeedServer::start(feed).await;
        let app = testing::context_with(
            dir.path(),
            json!({ "update": { "manifest_url": server.feed_url() } }),
            None,
        );
        (server, app)
    }

    #[test]
    fn test_is_newer() -> Result<()> {
        assert!(is_newer("2.0.0", "1.9.9")?);
        assert!(is_newer("v1.10.0", "1.9.0")?);
        assert!(!is_newer("1.0.0", "1.0.0")?);
        assert!(!is_newer("1.0.0-beta.1", "1.0.0")?);
        assert!(is_newer("three", "1.0.0").is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_update_runs_to_completion() -> Result<()> {
        let dir = TempDir::new()?;
        fs::create_dir_all(dir.path().join("site/app"))?;
        fs::write(dir.path().join("site/app/Version.php"), "1.0.0")?;
        let (server, app) =
            app_with_feed(&dir, json!({ "version": "2.0.0", "url": "packages/2.0.0.zip" })).await;
        let engine = update_engine(&app);

        let mut steps = Vec::new();
        loop {
            let result = engine.advance("admin").await?;
            assert!(result.success, "{}", result.message);
            steps.push(result.step.clone());
            if result.next_step.is_none() {
                break;
            }
        }
        assert_eq!(
            steps,
            vec!["start", "check_version", "download", "extract", "migrate", "clean", "finished"]
        );
        assert_eq!(fs::read_to_string(dir.path().join("site/app/Version.php"))?, "2.0.0");
        assert_eq!(app.settings.app_version()?, "2.0.0");
        assert!(!app.config.updates_dir().join("admin").exists());
        assert!(!app.system_lock().is_maintenance_mode()?);
        for mock in &server.mocks {
            mock.assert_async().await;
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_already_latest_aborts() -> Result<()> {
        let dir = TempDir::new()?;
        let (_server, app) =
            app_with_feed(&dir, json!({ "version": "2.0.0", "url": "packages/2.0.0.zip" })).await;
        app.settings.set(APP_VERSION, &"2.0.0")?;
        let engine = update_engine(&app);

        assert!(engine.advance("admin").await?.success);
        let result = engine.advance("admin").await?;
        assert!(!result.success);
        assert_eq!(result.step, "check_version");
        assert!(result.message.contains("already the latest version"));
        assert!(engine.state("admin").await?.is_none());
        assert!(!app.system_lock().is_maintenance_mode()?);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_package_aborts_download() -> Result<()> {
        let dir = TempDir::new()?;
        let (mut server, app) =
            app_with_feed(&dir, json!({ "version": "3.0.0", "url": "/packages/3.0.0.zip" })).await;
        let package = server.missing("/packages/3.0.0.zip").await;
        let engine = update_engine(&app);

        engine.advance("admin").await?;
        engine.advance("admin").await?;
        let result = engine.advance("admin").await?;
        assert!(!result.success);
        assert_eq!(result.step, "download");
        assert!(result.message.contains("404"));
        package.assert_async().await;
        assert!(!app.config.updates_dir().join("admin").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_versions_lists_newest_first() -> Result<()> {
        let dir = TempDir::new()?;
        let (_server, app) = app_with_feed(
            &dir,
            json!([
                { "version": "1.0.0", "url": "a.zip", "title": "First stable" },
                { "version": "2.0.0", "url": "b.zip", "logs": ["Faster admin"] },
                { "version": "not-a-version", "url": "c.zip" }
            ]),
        )
        .await;

        let report = versions(&app).await?;
        assert_eq!(report.current_version, "1.0.0");
        assert_eq!(report.latest_version.as_deref(), Some("2.0.0"));
        assert!(!report.is_updated);
        let listed: Vec<&str> = report.versions.iter().map(|r| r.version.as_str()).collect();
        assert_eq!(listed, vec!["2.0.0", "1.0.0"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_start_rejected_without_feed() -> Result<()> {
        let dir = TempDir::new()?;
        let app = testing::context(dir.path(), None);
        let result = update_engine(&app).advance("admin").await?;
        assert!(!result.success);
        assert!(result.message.contains("update.manifest_url"));
        assert!(app.system_lock().current()?.is_none());
        Ok(())
    }
}
