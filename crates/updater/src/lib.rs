//! Differential self-update engine.
//!
//! An [`Updater`] asks a release [`Provider`] for the latest version on a
//! channel, picks the file matching the running platform, and downloads it.
//! When the installed artifact and the new one both have a [`BlockMap`], only
//! the blocks that changed are fetched with HTTP range requests and everything
//! else is copied from the installed file. Any failure of that path falls back
//! to a full download. The result is always verified against the published
//! checksum before it is handed to an [`Installer`].
//!
//! ```ignore
//! use delta_updater::{
//!     AppImageInstaller, GenericConfig, InstallOptions, ProviderConfig, ReqwestTransport,
//!     Updater, UpdaterConfig,
//! };
//! use std::sync::Arc;
//!
//! # async fn demo() -> delta_updater::Result<()> {
//! let config = UpdaterConfig::new(env!("CARGO_PKG_VERSION").parse()?).detect_installed_artifact();
//! let transport = Arc::new(ReqwestTransport::from_config(&config)?);
//! let provider = ProviderConfig::Generic(GenericConfig::new("https://updates.example.com/"));
//! let updater = Updater::from_provider_config(
//!     config,
//!     &provider,
//!     transport,
//!     Arc::new(AppImageInstaller::from_env()),
//! )?;
//!
//! if updater.check_for_updates().await?.is_update_available {
//!     updater.download_update().await?;
//!     updater.quit_and_install(InstallOptions::default()).await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod blockmap;
mod config;
pub mod download;
mod error;
mod events;
mod installer;
pub mod manifest;
mod platform;
pub mod provider;
pub mod transport;
mod updater;

pub use blockmap::{BlockMap, DiffPlan, Operation, PlanOptions};
pub use config::{RangeMode, UpdaterConfig};
pub use download::{
    DifferentialFailure, DifferentialStats, DownloadOptions, DownloadReport, OldArtifact,
    OldBlockMap, UpdateDownloader,
};
pub use error::{Result, UpdaterError};
pub use events::{ProgressCallback, ProgressInfo, UpdaterEvent};
pub use installer::{install_destination, AppImageInstaller, InstallOptions, InstallOutcome, Installer};
pub use manifest::{
    parse_update_info, BlockMapSource, Checksum, FileDescriptor, FileInfo, VersionInfo,
};
pub use platform::{channel_file_name, Arch, Platform};
pub use provider::{GenericConfig, Provider, ProviderConfig};
pub use transport::{HttpTransport, MemoryTransport, ReqwestTransport};
pub use updater::{
    is_update_available, staging_bucket, AvailableUpdate, UpdateCheckResult, Updater,
    UpdaterState,
};
