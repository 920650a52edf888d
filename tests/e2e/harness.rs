//! Test harness for the update pipeline.
//!
//! The `TestHarness` owns a fake live installation, a fake release source
//! and a recording supervisor, wired into a real [`UpdateScheduler`].

#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use os_health_agent::upgrade::{
    atomic_copy, atomic_write, DownloadProgress, Invocation, ReleaseAsset, ReleaseMetadata,
    ReplaceFile,
};
use os_health_agent::{
    create_event_channel, AgentConfig, AgentEvent, AgentEventsChannel, BackupManager,
    BackupSnapshot, Error, Installer, ProcessSupervisor, ReleaseSource, Result, UpdateScheduler,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::ffi::OsString;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use walkdir::WalkDir;

/// Tracked files of the fake installation.
pub const TRACKED: [&str; 3] = ["agent", "lib/collector.so", "config.toml"];

/// Build a zip archive in memory.
pub fn zip_bytes(files: &[(String, Vec<u8>)]) -> Vec<u8> {
    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = zip::ZipWriter::new(&mut cursor);
        let options = zip::write::SimpleFileOptions::default();
        for (name, body) in files {
            writer.start_file(name.as_str(), options).unwrap();
            writer.write_all(body).unwrap();
        }
        writer.finish().unwrap();
    }
    cursor.into_inner()
}

/// Build a gzip'd tar archive in memory.
pub fn tar_gz_bytes(files: &[(String, Vec<u8>)]) -> Vec<u8> {
    let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (name, body) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder.append_data(&mut header, name, body.as_slice()).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

/// Payload of `version`, laid out as a release archive would be.
pub fn payload_files(version: &str) -> Vec<(String, Vec<u8>)> {
    TRACKED
        .iter()
        .map(|rel| {
            (
                format!("os-health-agent-{version}/{rel}"),
                format!("{rel} {version}").into_bytes(),
            )
        })
        .collect()
}

/// A live installation on disk.
pub struct TestInstall {
    root: TempDir,
}

impl TestInstall {
    /// Create an installation of `version` with all tracked files, the
    /// version marker and one untracked data file.
    pub fn new(version: &str) -> Self {
        let root = tempfile::tempdir().unwrap();
        let install = Self { root };
        let dir = install.install_dir();
        std::fs::create_dir_all(dir.join("lib")).unwrap();
        for rel in TRACKED {
            std::fs::write(dir.join(rel), format!("{rel} {version}")).unwrap();
        }
        std::fs::write(dir.join("version.txt"), version).unwrap();
        std::fs::write(dir.join("state.db"), "local data").unwrap();
        install
    }

    /// Parent of the install dir; backups and scratch space live here.
    pub fn root(&self) -> &Path {
        self.root.path()
    }

    /// Live install dir.
    pub fn install_dir(&self) -> PathBuf {
        self.root.path().join("agent")
    }

    /// Every file under the install dir with its bytes.
    pub fn tree(&self) -> BTreeMap<PathBuf, Vec<u8>> {
        let dir = self.install_dir();
        WalkDir::new(&dir)
            .into_iter()
            .map(|e| e.unwrap())
            .filter(|e| e.file_type().is_file())
            .map(|e| {
                let rel = e.path().strip_prefix(&dir).unwrap().to_path_buf();
                (rel, std::fs::read(e.path()).unwrap())
            })
            .collect()
    }

    /// Names of everything next to the install dir.
    pub fn siblings(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(self.root.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    /// Content of the version marker.
    pub fn marker(&self) -> String {
        std::fs::read_to_string(self.install_dir().join("version.txt")).unwrap()
    }

    /// Content of a tracked file.
    pub fn read(&self, rel: &str) -> String {
        std::fs::read_to_string(self.install_dir().join(rel)).unwrap()
    }

    /// Backup manager for this installation.
    pub fn backups(&self) -> BackupManager {
        BackupManager::for_install(&self.install_dir()).unwrap()
    }

    /// Complete snapshots, oldest first.
    pub fn snapshots(&self) -> Vec<BackupSnapshot> {
        self.backups().list().unwrap()
    }
}

/// Release source serving fixed metadata and in-memory files.
#[derive(Default)]
pub struct FakeReleaseSource {
    release: Mutex<Option<ReleaseMetadata>>,
    files: Mutex<HashMap<String, Vec<u8>>>,
    metadata_error: Mutex<Option<String>>,
    gate: Mutex<Option<Arc<Notify>>>,
    download_started: Notify,
    metadata_calls: AtomicUsize,
    downloads: AtomicUsize,
}

impl FakeReleaseSource {
    /// Source with no release published.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Publish `tag` with the given assets (name, bytes).
    pub fn publish(&self, tag: &str, assets: Vec<(&str, Vec<u8>)>) {
        let mut files = self.files.lock();
        let assets = assets
            .into_iter()
            .map(|(name, bytes)| {
                let url = format!("https://downloads.example.com/{tag}/{name}");
                files.insert(url.clone(), bytes);
                ReleaseAsset {
                    name: name.to_string(),
                    download_location: url,
                }
            })
            .collect();
        *self.release.lock() = Some(ReleaseMetadata {
            tag_name: tag.to_string(),
            assets,
            body: Some(format!("Release {tag}")),
            published_at: None,
        });
    }

    /// Serve `bytes` at an arbitrary URL.
    pub fn serve(&self, url: &str, bytes: Vec<u8>) {
        self.files.lock().insert(url.to_string(), bytes);
    }

    /// Make metadata requests fail with a network error.
    pub fn fail_metadata(&self, message: &str) {
        *self.metadata_error.lock() = Some(message.to_string());
    }

    /// Hold every download until the returned notifier fires.
    pub fn gate_downloads(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    /// Wait until a download has started.
    pub async fn wait_for_download(&self) {
        self.download_started.notified().await;
    }

    /// Number of metadata requests served.
    pub fn metadata_calls(&self) -> usize {
        self.metadata_calls.load(Ordering::SeqCst)
    }

    /// Number of downloads started.
    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReleaseSource for FakeReleaseSource {
    async fn latest_release(&self, _repository: &str) -> Result<ReleaseMetadata> {
        self.metadata_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.metadata_error.lock().clone() {
            return Err(Error::Network(message));
        }
        self.release
            .lock()
            .clone()
            .ok_or_else(|| Error::Network("404 Not Found".to_string()))
    }

    async fn download(
        &self,
        url: &str,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
        progress: &(dyn Fn(DownloadProgress) + Send + Sync),
    ) -> Result<u64> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        self.download_started.notify_one();
        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let bytes = self
            .files
            .lock()
            .get(url)
            .cloned()
            .ok_or_else(|| Error::Network(format!("404 Not Found: {url}")))?;
        let total = bytes.len() as u64;
        let mut downloaded = 0u64;
        for chunk in bytes.chunks(8192) {
            sink.write_all(chunk).await.unwrap();
            downloaded += chunk.len() as u64;
            progress(DownloadProgress {
                downloaded,
                total: Some(total),
            });
        }
        Ok(downloaded)
    }
}

/// Supervisor that records restart requests instead of restarting.
#[derive(Default)]
pub struct RecordingSupervisor {
    restarts: Mutex<Vec<Invocation>>,
}

impl RecordingSupervisor {
    /// Restart requests so far.
    pub fn restarts(&self) -> Vec<Invocation> {
        self.restarts.lock().clone()
    }
}

impl ProcessSupervisor for RecordingSupervisor {
    fn restart_in_place(&self, invocation: &Invocation) -> Result<()> {
        self.restarts.lock().push(invocation.clone());
        Ok(())
    }
}

/// Replacer that fails every write after the first `allowed`.
///
/// The version marker counts as the last write of an install.
pub struct FailAfter {
    allowed: usize,
    calls: AtomicUsize,
}

impl FailAfter {
    /// Allow `allowed` writes, then fail.
    pub fn new(allowed: usize) -> Arc<Self> {
        Arc::new(Self {
            allowed,
            calls: AtomicUsize::new(0),
        })
    }

    fn check(&self, target: &Path) -> Result<()> {
        if self.calls.fetch_add(1, Ordering::SeqCst) >= self.allowed {
            return Err(Error::Filesystem(format!(
                "injected failure writing {}",
                target.display()
            )));
        }
        Ok(())
    }
}

impl ReplaceFile for FailAfter {
    fn replace(&self, source: &Path, target: &Path) -> Result<()> {
        self.check(target)?;
        atomic_copy(source, target)
    }

    fn write_marker(&self, marker: &Path, version: &str) -> Result<()> {
        self.check(marker)?;
        atomic_write(marker, version.as_bytes())
    }
}

/// Replacer that blocks for `delay` once `after` files are replaced, then
/// either fails or carries on.
pub struct StallAfter {
    after: usize,
    delay: Duration,
    fail: bool,
    calls: AtomicUsize,
    stalled: AtomicBool,
}

impl StallAfter {
    /// Stall before replacement number `after + 1`.
    pub fn new(after: usize, delay: Duration, fail: bool) -> Arc<Self> {
        Arc::new(Self {
            after,
            delay,
            fail,
            calls: AtomicUsize::new(0),
            stalled: AtomicBool::new(false),
        })
    }

    /// Whether the install has reached the stall.
    pub fn stalled(&self) -> bool {
        self.stalled.load(Ordering::SeqCst)
    }
}

impl ReplaceFile for StallAfter {
    fn replace(&self, source: &Path, target: &Path) -> Result<()> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == self.after {
            self.stalled.store(true, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            if self.fail {
                return Err(Error::Filesystem(format!(
                    "injected failure writing {}",
                    target.display()
                )));
            }
        }
        atomic_copy(source, target)
    }
}

/// A scheduler over a fake installation.
pub struct TestHarness {
    /// The live installation.
    pub install: TestInstall,
    /// Release source the scheduler reads from.
    pub source: Arc<FakeReleaseSource>,
    /// Restart recorder.
    pub supervisor: Arc<RecordingSupervisor>,
    /// Scheduler under test.
    pub scheduler: Arc<UpdateScheduler>,
    /// Events emitted by the scheduler.
    pub events: AgentEventsChannel,
}

impl TestHarness {
    /// Harness for an installation of `version`.
    pub fn new(version: &str) -> Self {
        Self::with(version, |_| {}, None)
    }

    /// Harness with config tweaks and an optional custom installer.
    pub fn with(
        version: &str,
        tweak: impl FnOnce(&mut AgentConfig),
        installer: Option<Installer>,
    ) -> Self {
        let install = TestInstall::new(version);
        let mut config = AgentConfig::default();
        config.install_dir = install.install_dir();
        config.upgrade.repository = "acme/os-health-agent".to_string();
        config.upgrade.tracked_files = TRACKED.iter().map(PathBuf::from).collect();
        config.upgrade.check_interval_secs = 3600;
        tweak(&mut config);
        config.validate().unwrap();

        let source = FakeReleaseSource::new();
        let supervisor = Arc::new(RecordingSupervisor::default());
        let (events_tx, events) = create_event_channel();

        let mut scheduler = UpdateScheduler::new(
            Arc::new(config),
            Arc::clone(&source) as Arc<dyn ReleaseSource>,
            Arc::clone(&supervisor) as Arc<dyn ProcessSupervisor>,
            Invocation::new(
                install.install_dir().join("agent"),
                vec![OsString::from("run"), OsString::from("--log-format=json")],
            ),
            events_tx,
        )
        .with_scratch_dir(install.root().join("scratch"));
        if let Some(installer) = installer {
            scheduler = scheduler.with_installer(installer);
        }

        Self {
            install,
            source,
            supervisor,
            scheduler: Arc::new(scheduler),
            events,
        }
    }

    /// Publish `version` as a zip release.
    pub fn publish_zip(&self, version: &str) {
        self.source.publish(
            &format!("v{version}"),
            vec![(
                format!("os-health-agent-{version}.zip").as_str(),
                zip_bytes(&payload_files(version)),
            )],
        );
    }

    /// Events received so far.
    pub fn drain_events(&mut self) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Run `f` with a timeout so a hung attempt fails the test instead of the run.
pub async fn within<F: std::future::Future>(f: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(10), f)
        .await
        .expect("timed out")
}
