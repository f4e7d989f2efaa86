//! Platform and architecture tags used for channel naming and asset selection.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Channel used when neither the caller nor the provider names one.
pub const DEFAULT_CHANNEL: &str = "stable";

/// Operating system family the update is meant for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Windows,
    Mac,
    Linux,
}

impl Platform {
    /// Platform of the running process.
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            Platform::Windows
        } else if cfg!(target_os = "macos") {
            Platform::Mac
        } else {
            Platform::Linux
        }
    }

    /// Parse a platform name, accepting both short and Node-style names.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "win" | "win32" | "windows" => Some(Platform::Windows),
            "mac" | "macos" | "darwin" => Some(Platform::Mac),
            "linux" => Some(Platform::Linux),
            _ => None,
        }
    }

    /// Packaging tag downloaded by default on this platform, and tags that must never be picked.
    pub fn default_packaging(&self) -> (&'static str, &'static [&'static str]) {
        match self {
            Platform::Windows => ("exe", &[]),
            Platform::Mac => ("zip", &[]),
            Platform::Linux => ("AppImage", &["rpm", "deb", "pacman"]),
        }
    }

    fn channel_suffix(&self, arch: Arch) -> String {
        match self {
            Platform::Windows => String::new(),
            Platform::Mac => "-mac".to_string(),
            Platform::Linux => match arch {
                Arch::X64 => "-linux".to_string(),
                other => format!("-linux-{}", other.as_str()),
            },
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Platform::Windows => "windows",
            Platform::Mac => "mac",
            Platform::Linux => "linux",
        };
        f.write_str(name)
    }
}

/// CPU architecture an artifact was built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    Ia32,
    X64,
    Armv7l,
    Arm64,
    Universal,
}

impl Arch {
    /// Architecture of the running process.
    pub fn current() -> Self {
        if cfg!(target_arch = "aarch64") {
            Arch::Arm64
        } else if cfg!(target_arch = "arm") {
            Arch::Armv7l
        } else if cfg!(target_arch = "x86") {
            Arch::Ia32
        } else {
            Arch::X64
        }
    }

    /// Canonical short name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::Ia32 => "ia32",
            Arch::X64 => "x64",
            Arch::Armv7l => "armv7l",
            Arch::Arm64 => "arm64",
            Arch::Universal => "universal",
        }
    }

    /// Parse an architecture name, including the aliases used in artifact file names.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "ia32" | "i386" | "i686" | "x86" => Some(Arch::Ia32),
            "x64" | "x86_64" | "amd64" => Some(Arch::X64),
            "armv7l" | "armhf" | "arm" => Some(Arch::Armv7l),
            "arm64" | "aarch64" => Some(Arch::Arm64),
            "universal" => Some(Arch::Universal),
            _ => None,
        }
    }

    /// Find an architecture tag inside an artifact file name such as `App-1.2.0-arm64.AppImage`.
    pub fn detect_in_file_name(file_name: &str) -> Option<Self> {
        // x86_64 contains the separator, so check it before splitting
        let lower = file_name.to_ascii_lowercase();
        if lower.contains("x86_64") {
            return Some(Arch::X64);
        }
        lower
            .split(|c: char| c == '-' || c == '_' || c == '.' || c == ' ')
            .find_map(Arch::from_name)
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Name of the channel manifest for `channel` on the given platform, e.g. `latest-linux-arm64.yml`.
///
/// The default `stable` channel is published under the `latest` stem.
pub fn channel_file_name(channel: &str, platform: Platform, arch: Arch) -> String {
    let stem = if channel.is_empty() || channel == DEFAULT_CHANNEL {
        "latest"
    } else {
        channel
    };
    format!("{stem}{}.yml", platform.channel_suffix(arch))
}
