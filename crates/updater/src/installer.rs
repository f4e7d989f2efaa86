//! Replacing the installed artifact with a downloaded one.

use crate::error::{Result, UpdaterError};
use async_trait::async_trait;
use regex::Regex;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tempfile::{NamedTempFile, PathPersistError};
use tokio::process::Command;
use tokio::task;
use tracing::{info, warn};

/// How the installed update is started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstallOptions {
    /// Ask the installed artifact not to prompt.
    pub is_silent: bool,
    /// Launch the new version right away instead of only running its install hook.
    pub force_run_after: bool,
}

/// Result of a successful install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOutcome {
    /// Location of the new artifact.
    pub installed_path: PathBuf,
    /// Whether the artifact ended up under a different file name than before.
    pub renamed: bool,
}

/// Puts a verified download in place of the running application.
#[async_trait]
pub trait Installer: Send + Sync {
    async fn install(&self, downloaded: &Path, options: InstallOptions) -> Result<InstallOutcome>;
}

/// Installs AppImages by replacing the file the AppImage runtime reports as running.
#[derive(Debug, Clone)]
pub struct AppImageInstaller {
    current: Option<PathBuf>,
    run_installed: bool,
}

impl AppImageInstaller {
    /// Installer replacing `current`.
    pub fn new(current: impl Into<PathBuf>) -> Self {
        Self {
            current: Some(current.into()),
            run_installed: true,
        }
    }

    /// Installer replacing the file named by the `APPIMAGE` variable.
    pub fn from_env() -> Self {
        Self {
            current: std::env::var_os("APPIMAGE").map(PathBuf::from),
            run_installed: true,
        }
    }

    /// Whether the new artifact is executed after it was put in place.
    pub fn run_installed(mut self, enabled: bool) -> Self {
        self.run_installed = enabled;
        self
    }

    async fn launch(&self, installed: &Path, options: InstallOptions) -> Result<()> {
        let mut command = Command::new(installed);
        command.envs(launch_env(options));
        if options.force_run_after {
            command
                .spawn()
                .map_err(|err| UpdaterError::Install(format!("cannot start {}: {err}", installed.display())))?;
            return Ok(());
        }
        let status = command
            .status()
            .await
            .map_err(|err| UpdaterError::Install(format!("cannot run {}: {err}", installed.display())))?;
        if !status.success() {
            return Err(UpdaterError::Install(format!(
                "{} exited with {status}",
                installed.display()
            )));
        }
        Ok(())
    }
}

/// Variables telling the AppImage runtime how the new version was started.
fn launch_env(options: InstallOptions) -> Vec<(&'static str, &'static str)> {
    let mut env = Vec::new();
    if options.is_silent {
        env.push(("APPIMAGE_SILENT_INSTALL", "true"));
    }
    if !options.force_run_after {
        env.push(("APPIMAGE_EXIT_AFTER_INSTALL", "true"));
    }
    env
}

#[async_trait]
impl Installer for AppImageInstaller {
    async fn install(&self, downloaded: &Path, options: InstallOptions) -> Result<InstallOutcome> {
        let current = self
            .current
            .clone()
            .ok_or_else(|| UpdaterError::OldFileNotFound(PathBuf::from("$APPIMAGE")))?;
        let source = downloaded.to_path_buf();
        let target = current.clone();
        let installed = task::spawn_blocking(move || replace_artifact(&source, &target))
            .await
            .map_err(|err| UpdaterError::Other(format!("task join error: {err}")))??;

        let renamed = installed != current;
        if renamed {
            info!("installed update as {}", installed.display());
        } else {
            info!("replaced {}", installed.display());
        }
        if self.run_installed {
            self.launch(&installed, options).await?;
        }
        Ok(InstallOutcome {
            installed_path: installed,
            renamed,
        })
    }
}

/// Where the new artifact goes.
///
/// A versioned file name (`App-1.2.3.AppImage`) follows the new version's name;
/// any other name was chosen by the user and is kept.
pub fn install_destination(current: &Path, downloaded: &Path) -> PathBuf {
    static VERSIONED: OnceLock<Regex> = OnceLock::new();
    let versioned = VERSIONED.get_or_init(|| Regex::new(r"\d+\.\d+\.\d+").unwrap());

    let existing = current
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    match downloaded.file_name() {
        Some(new_name) if new_name.to_string_lossy() != existing && versioned.is_match(&existing) => {
            current.with_file_name(new_name)
        }
        _ => current.to_path_buf(),
    }
}

/// Atomically write `downloaded` to its destination next to `current`.
fn replace_artifact(downloaded: &Path, current: &Path) -> Result<PathBuf> {
    let parent = current
        .parent()
        .ok_or_else(|| UpdaterError::validation("installed artifact must have a parent directory"))?;
    if !downloaded.is_file() {
        return Err(UpdaterError::Install(format!(
            "downloaded file {} is missing",
            downloaded.display()
        )));
    }
    let destination = install_destination(current, downloaded);

    let mut temp = NamedTempFile::new_in(parent)?;
    io::copy(&mut File::open(downloaded)?, temp.as_file_mut())?;
    temp.as_file().sync_all()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = temp.as_file().metadata()?.permissions();
        perms.set_mode(0o755);
        temp.as_file().set_permissions(perms)?;
    }

    temp.into_temp_path()
        .persist(&destination)
        .map_err(map_persist_error)?;

    if destination != current {
        if let Err(err) = fs::remove_file(current) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!("failed to remove previous artifact {:?}: {}", current, err);
            }
        }
    }
    if let Err(err) = fs::remove_file(downloaded) {
        warn!("failed to remove staged download {:?}: {}", downloaded, err);
    }
    Ok(destination)
}

fn map_persist_error(err: PathPersistError) -> UpdaterError {
    UpdaterError::Io(err.error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn versioned_names_follow_new_version() {
        let current = Path::new("/opt/apps/App-1.2.0.AppImage");
        let downloaded = Path::new("/tmp/stage/App-1.3.0.AppImage");
        assert_eq!(
            install_destination(current, downloaded),
            PathBuf::from("/opt/apps/App-1.3.0.AppImage")
        );
    }

    #[test]
    fn custom_names_are_kept() {
        let current = Path::new("/opt/apps/MyApp.AppImage");
        let downloaded = Path::new("/tmp/stage/App-1.3.0.AppImage");
        assert_eq!(install_destination(current, downloaded), current);
    }

    #[test]
    fn launch_env_follows_options() {
        assert_eq!(
            launch_env(InstallOptions::default()),
            vec![("APPIMAGE_EXIT_AFTER_INSTALL", "true")]
        );
        assert_eq!(
            launch_env(InstallOptions {
                is_silent: true,
                force_run_after: true,
            }),
            vec![("APPIMAGE_SILENT_INSTALL", "true")]
        );
        assert_eq!(
            launch_env(InstallOptions {
                is_silent: true,
                force_run_after: false,
            })
            .len(),
            2
        );
    }

    #[tokio::test]
    async fn install_replaces_and_renames() {
        let dir = tempdir().unwrap();
        let current = dir.path().join("App-1.2.0.AppImage");
        std::fs::write(&current, b"old").unwrap();
        let stage = dir.path().join("stage");
        std::fs::create_dir(&stage).unwrap();
        let downloaded = stage.join("App-1.3.0.AppImage");
        std::fs::write(&downloaded, b"new").unwrap();

        let outcome = AppImageInstaller::new(&current)
            .run_installed(false)
            .install(&downloaded, InstallOptions::default())
            .await
            .unwrap();

        assert!(outcome.renamed);
        assert_eq!(outcome.installed_path, dir.path().join("App-1.3.0.AppImage"));
        assert_eq!(std::fs::read(&outcome.installed_path).unwrap(), b"new");
        assert!(!current.exists());
        assert!(!downloaded.exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&outcome.installed_path)
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o755);
        }
    }

    #[tokio::test]
    async fn missing_download_is_an_install_error() {
        let dir = tempdir().unwrap();
        let current = dir.path().join("App.AppImage");
        std::fs::write(&current, b"old").unwrap();
        let err = AppImageInstaller::new(&current)
            .run_installed(false)
            .install(&dir.path().join("gone.AppImage"), InstallOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ERR_UPDATER_INSTALL");
        assert_eq!(std::fs::read(&current).unwrap(), b"old");
    }
}
