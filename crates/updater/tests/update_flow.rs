use base64::{engine::general_purpose, Engine as _};
use delta_updater::{
    transport::Fault, AppImageInstaller, Arch, BlockMap, GenericConfig, InstallOptions,
    MemoryTransport, Platform, ProviderConfig, RangeMode, Updater, UpdaterConfig, UpdaterError,
    UpdaterEvent, UpdaterState,
};
use sha2::{Digest, Sha512};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const BASE: &str = "https://updates.example.com/";
const NEW_URL: &str = "https://updates.example.com/App-1.3.0.AppImage";
const CHANNEL_URL: &str = "https://updates.example.com/latest-linux.yml";

fn block(seed: u8) -> Vec<u8> {
    (0..1000u32)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

/// AppImage-like file: payload followed by its embedded block map.
fn appimage(payload: &[u8]) -> Vec<u8> {
    let map = BlockMap::compute(payload, 1000).unwrap();
    let mut file = payload.to_vec();
    file.extend(map.encode_embedded().unwrap());
    file
}

fn sha512(data: &[u8]) -> String {
    general_purpose::STANDARD.encode(Sha512::digest(data))
}

struct Feed {
    dir: TempDir,
    transport: Arc<MemoryTransport>,
    installed: PathBuf,
    new_file: Vec<u8>,
}

impl Feed {
    fn new(transport: MemoryTransport) -> Self {
        init_logging();
        let old_payload: Vec<u8> = (0..10u8).flat_map(block).collect();
        let new_payload: Vec<u8> = (0..10u8)
            .flat_map(|i| if i == 3 || i == 7 { block(100 + i) } else { block(i) })
            .collect();
        let old_file = appimage(&old_payload);
        let new_file = appimage(&new_payload);

        let dir = tempfile::tempdir().unwrap();
        let installed = dir.path().join("App-1.2.0.AppImage");
        std::fs::write(&installed, &old_file).unwrap();

        let transport = Arc::new(transport);
        transport.insert(NEW_URL, new_file.clone());
        let feed = Self {
            dir,
            transport,
            installed,
            new_file,
        };
        feed.publish("1.3.0", &sha512(&feed.new_file));
        feed
    }

    fn publish(&self, version: &str, sha512: &str) {
        self.transport.insert(
            CHANNEL_URL,
            format!(
                "version: {version}\nfiles:\n  - url: App-1.3.0.AppImage\n    sha512: '{sha512}'\n    size: {}\nreleaseDate: '2026-10-01T12:00:00.000Z'\n",
                self.new_file.len()
            ),
        );
    }

    fn staging(&self) -> PathBuf {
        self.dir.path().join("staging")
    }

    fn config(&self, mode: RangeMode) -> UpdaterConfig {
        UpdaterConfig::new(semver::Version::new(1, 2, 0))
            .target(Platform::Linux, Arch::X64)
            .installed_artifact(&self.installed)
            .download_dir(self.staging())
            .range_mode(mode)
            .range_retry_delay(Duration::from_millis(1))
    }

    fn updater(&self, config: UpdaterConfig) -> Updater {
        Updater::from_provider_config(
            config,
            &ProviderConfig::Generic(GenericConfig::new(BASE)),
            self.transport.clone(),
            Arc::new(AppImageInstaller::new(&self.installed).run_installed(false)),
        )
        .unwrap()
    }
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn drain(events: &mut tokio::sync::broadcast::Receiver<UpdaterEvent>) -> Vec<UpdaterEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

fn dir_is_empty(path: &Path) -> bool {
    match std::fs::read_dir(path) {
        Ok(mut entries) => entries.next().is_none(),
        Err(_) => true,
    }
}

#[tokio::test]
async fn same_version_is_not_an_update() {
    let feed = Feed::new(MemoryTransport::new());
    feed.publish("1.2.0", &sha512(&feed.new_file));
    let updater = feed.updater(feed.config(RangeMode::Concurrent));
    let mut events = updater.subscribe();

    let result = updater.check_for_updates().await.unwrap();
    assert!(!result.is_update_available);
    assert!(result.file.is_none());
    assert_eq!(updater.state(), UpdaterState::Idle);
    assert!(updater.available_update().is_none());

    let events = drain(&mut events);
    assert!(matches!(events[0], UpdaterEvent::CheckingForUpdate));
    assert!(matches!(events[1], UpdaterEvent::UpdateNotAvailable { .. }));
    // no file was touched
    assert_eq!(feed.transport.requests_for(NEW_URL).len(), 0);
}

#[tokio::test]
async fn differential_update_reuses_installed_blocks() {
    let feed = Feed::new(MemoryTransport::new());
    let updater = feed.updater(feed.config(RangeMode::Concurrent));
    let mut events = updater.subscribe();

    let result = updater.check_for_updates().await.unwrap();
    assert!(result.is_update_available);
    assert_eq!(result.version_info.version, semver::Version::new(1, 3, 0));
    assert_eq!(result.file.as_ref().unwrap().url.as_str(), NEW_URL);

    let path = updater.download_update().await.unwrap();
    assert_eq!(path, feed.staging().join("App-1.3.0.AppImage"));
    assert_eq!(std::fs::read(&path).unwrap(), feed.new_file);
    assert_eq!(updater.state(), UpdaterState::Downloaded(path.clone()));

    // every request for the new file asked for a range
    let requests = feed.transport.requests_for(NEW_URL);
    assert!(requests.iter().all(|r| !r.ranges.is_empty()));
    let fetched: u64 = requests
        .iter()
        .flat_map(|r| r.ranges.iter())
        .map(|r| r.len())
        .sum();
    assert!(fetched < feed.new_file.len() as u64 / 2);

    let events = drain(&mut events);
    let downloaded = events
        .iter()
        .position(|e| matches!(e, UpdaterEvent::UpdateDownloaded { .. }))
        .unwrap();
    assert_eq!(downloaded, events.len() - 1);
    match &events[downloaded] {
        UpdaterEvent::UpdateDownloaded {
            is_differential,
            stats,
            ..
        } => {
            assert!(*is_differential);
            assert_eq!(stats.unwrap().local_bytes, 8000);
        }
        _ => unreachable!(),
    }
    let mut last = 0;
    for event in &events[..downloaded] {
        if let UpdaterEvent::DownloadProgress(p) = event {
            assert!(p.transferred > last);
            last = p.transferred;
        }
    }
    assert_eq!(last, feed.new_file.len() as u64);
}

#[tokio::test]
async fn every_range_mode_produces_the_same_file() {
    for mode in [RangeMode::Concurrent, RangeMode::Sequential, RangeMode::MultiRange] {
        let feed = Feed::new(MemoryTransport::new());
        let updater = feed.updater(feed.config(mode));
        updater.check_for_updates().await.unwrap();
        let path = updater.download_update().await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), feed.new_file, "{mode:?}");
        assert!(
            feed.transport
                .requests_for(NEW_URL)
                .iter()
                .all(|r| !r.ranges.is_empty()),
            "{mode:?}"
        );
    }
}

#[tokio::test]
async fn multi_range_server_answers_in_one_request() {
    let feed = Feed::new(MemoryTransport::new());
    let updater = feed.updater(feed.config(RangeMode::MultiRange));
    updater.check_for_updates().await.unwrap();
    updater.download_update().await.unwrap();

    // two requests locate the embedded map, one fetches every changed range
    let requests = feed.transport.requests_for(NEW_URL);
    assert_eq!(requests.len(), 3);
    assert!(requests[2].ranges.len() > 1);
}

#[tokio::test]
async fn corrupted_range_falls_back_to_one_full_download() {
    let feed = Feed::new(MemoryTransport::new());
    feed.transport.inject(NEW_URL, Fault::CorruptRange { offset: 3500 });
    let updater = feed.updater(feed.config(RangeMode::Concurrent));
    let mut events = updater.subscribe();

    updater.check_for_updates().await.unwrap();
    let path = updater.download_update().await.unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), feed.new_file);

    let full: Vec<_> = feed
        .transport
        .requests_for(NEW_URL)
        .into_iter()
        .filter(|r| r.ranges.is_empty())
        .collect();
    assert_eq!(full.len(), 1);

    let downloaded = drain(&mut events)
        .into_iter()
        .find_map(|e| match e {
            UpdaterEvent::UpdateDownloaded {
                is_differential, ..
            } => Some(is_differential),
            _ => None,
        })
        .unwrap();
    assert!(!downloaded);
}

#[tokio::test]
async fn wrong_published_checksum_fails_without_leftovers() {
    let feed = Feed::new(MemoryTransport::new());
    feed.publish("1.3.0", &sha512(b"something else"));
    let updater = feed.updater(feed.config(RangeMode::Concurrent));
    let mut events = updater.subscribe();

    updater.check_for_updates().await.unwrap();
    let err = updater.download_update().await.unwrap_err();
    assert_eq!(err.code(), "ERR_UPDATER_CHECKSUM_MISMATCH");
    assert!(matches!(updater.state(), UpdaterState::Failed(_)));
    assert!(dir_is_empty(&feed.staging()));

    let last = drain(&mut events).pop().unwrap();
    assert!(matches!(
        last,
        UpdaterEvent::Error {
            code: "ERR_UPDATER_CHECKSUM_MISMATCH",
            ..
        }
    ));
}

#[tokio::test]
async fn cancel_stops_download_and_cleans_up() {
    let feed = Feed::new(MemoryTransport::new().with_latency(Duration::from_millis(40)));
    let updater = Arc::new(feed.updater(feed.config(RangeMode::Sequential)));
    updater.check_for_updates().await.unwrap();
    let mut events = updater.subscribe();

    let running = {
        let updater = Arc::clone(&updater);
        tokio::spawn(async move { updater.download_update().await })
    };
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(matches!(
        updater.check_for_updates().await,
        Err(UpdaterError::Busy)
    ));

    updater.cancel();
    let err = running.await.unwrap().unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(updater.state(), UpdaterState::Idle);
    assert!(dir_is_empty(&feed.staging()));

    let count = feed.transport.request_count();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(feed.transport.request_count(), count);

    let last = drain(&mut events).pop().unwrap();
    assert!(matches!(last, UpdaterEvent::UpdateCancelled));
}

#[tokio::test]
async fn cancel_after_download_discards_staged_file() {
    let feed = Feed::new(MemoryTransport::new());
    let updater = feed.updater(feed.config(RangeMode::Concurrent));
    updater.check_for_updates().await.unwrap();
    let path = updater.download_update().await.unwrap();

    updater.cancel();
    assert_eq!(updater.state(), UpdaterState::Idle);
    assert!(!path.exists());
}

#[tokio::test]
async fn cancel_at_the_last_byte_never_leaves_a_staged_update() {
    let feed = Feed::new(MemoryTransport::new());
    let updater = Arc::new(feed.updater(feed.config(RangeMode::Concurrent)));
    updater.check_for_updates().await.unwrap();
    let mut events = updater.subscribe();

    let mut states = updater.watch_state();
    let watcher = {
        let updater = Arc::clone(&updater);
        tokio::spawn(async move {
            while states.changed().await.is_ok() {
                let complete = match &*states.borrow_and_update() {
                    UpdaterState::Downloading(p) => p.total > 0 && p.transferred == p.total,
                    UpdaterState::Downloaded(_) => true,
                    _ => false,
                };
                if complete {
                    updater.cancel();
                    return;
                }
            }
        })
    };

    let outcome = updater.download_update().await;
    watcher.await.unwrap();
    match outcome {
        Ok(path) => assert!(!path.exists()),
        Err(err) => assert!(err.is_cancelled()),
    }
    assert_eq!(updater.state(), UpdaterState::Idle);
    assert!(dir_is_empty(&feed.staging()));
    let last = drain(&mut events).pop().unwrap();
    assert!(matches!(last, UpdaterEvent::UpdateCancelled));
}

#[tokio::test]
async fn install_replaces_the_running_artifact() -> anyhow::Result<()> {
    let feed = Feed::new(MemoryTransport::new());
    let updater = feed.updater(feed.config(RangeMode::Concurrent));
    updater.check_for_updates().await?;
    updater.download_update().await?;

    let outcome = updater.quit_and_install(InstallOptions::default()).await?;
    assert!(outcome.renamed);
    assert_eq!(
        outcome.installed_path,
        feed.dir.path().join("App-1.3.0.AppImage")
    );
    assert_eq!(std::fs::read(&outcome.installed_path)?, feed.new_file);
    assert!(!feed.installed.exists());
    assert_eq!(updater.state(), UpdaterState::Installing);
    Ok(())
}

#[tokio::test]
async fn auto_download_runs_after_check() -> anyhow::Result<()> {
    let feed = Feed::new(MemoryTransport::new());
    let updater = feed.updater(feed.config(RangeMode::Concurrent).auto_download(true));
    let result = updater.check_for_updates().await?;
    let path = result
        .downloaded
        .ok_or_else(|| anyhow::anyhow!("check did not download"))?;
    assert_eq!(std::fs::read(&path)?, feed.new_file);
    assert!(matches!(updater.state(), UpdaterState::Downloaded(_)));
    Ok(())
}
