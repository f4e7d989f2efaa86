use crate::error::{Result, UpdaterError};
use crate::platform::Arch;
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Raw channel manifest (`latest-linux.yml` and friends).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateManifest {
    /// Semantic version string for the release.
    pub version: String,
    /// Files belonging to the release.
    #[serde(default)]
    pub files: Vec<ManifestFile>,
    /// Legacy single-file path, used when `files` is absent.
    #[serde(default)]
    pub path: Option<String>,
    /// Legacy single-file SHA-512.
    #[serde(default)]
    pub sha512: Option<String>,
    #[serde(default)]
    pub release_date: Option<String>,
    #[serde(default)]
    pub release_name: Option<String>,
    #[serde(default)]
    pub release_notes: Option<ReleaseNotes>,
    /// Percentage of installations the release is rolled out to.
    #[serde(default)]
    pub staging_percentage: Option<f64>,
    #[serde(default)]
    pub minimum_system_version: Option<String>,
}

/// One file entry of a channel manifest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ManifestFile {
    /// Absolute URL or path relative to the provider base.
    pub url: String,
    /// SHA-512 of the file, base64 or hex.
    #[serde(default)]
    pub sha512: Option<String>,
    /// Legacy hex SHA-256 of the file.
    #[serde(default)]
    pub sha2: Option<String>,
    /// File size in bytes.
    #[serde(default)]
    pub size: Option<u64>,
    /// Sidecar block map location.
    #[serde(default)]
    pub block_map_url: Option<String>,
    /// Size of the sidecar block map.
    #[serde(default)]
    pub block_map_size: Option<u64>,
}

/// Release notes, either free text or per-version entries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ReleaseNotes {
    Text(String),
    Entries(Vec<ReleaseNoteEntry>),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReleaseNoteEntry {
    pub version: String,
    #[serde(default)]
    pub note: Option<String>,
}

impl ReleaseNotes {
    /// Flatten into a single text block.
    pub fn to_text(&self) -> String {
        match self {
            ReleaseNotes::Text(text) => text.clone(),
            ReleaseNotes::Entries(entries) => entries
                .iter()
                .map(|e| format!("{}: {}", e.version, e.note.as_deref().unwrap_or_default()))
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// Strong whole-file checksum declared by a manifest.
#[derive(Clone, PartialEq, Eq)]
pub enum Checksum {
    Sha512([u8; 64]),
    Sha256([u8; 32]),
}

impl Checksum {
    /// Parse a SHA-512 given as hex or base64.
    pub fn parse_sha512(raw: &str) -> Result<Self> {
        let bytes = decode_digest(raw, 64)?;
        let mut digest = [0u8; 64];
        digest.copy_from_slice(&bytes);
        Ok(Checksum::Sha512(digest))
    }

    /// Parse a hex SHA-256.
    pub fn parse_sha256(raw: &str) -> Result<Self> {
        let bytes = decode_digest(raw, 32)?;
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&bytes);
        Ok(Checksum::Sha256(digest))
    }

    /// Digest bytes.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Checksum::Sha512(d) => d,
            Checksum::Sha256(d) => d,
        }
    }

    pub fn algorithm(&self) -> &'static str {
        match self {
            Checksum::Sha512(_) => "sha512",
            Checksum::Sha256(_) => "sha256",
        }
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Checksum::Sha512(d) => f.write_str(&general_purpose::STANDARD.encode(d)),
            Checksum::Sha256(d) => f.write_str(&hex::encode(d)),
        }
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm(), self)
    }
}

fn decode_digest(raw: &str, len: usize) -> Result<Vec<u8>> {
    let raw = raw.trim();
    let bytes = if raw.len() == len * 2 && raw.bytes().all(|b| b.is_ascii_hexdigit()) {
        hex::decode(raw).map_err(|err| UpdaterError::validation(format!("bad hex digest: {err}")))?
    } else {
        general_purpose::STANDARD
            .decode(raw)
            .map_err(|err| UpdaterError::validation(format!("bad base64 digest: {err}")))?
    };
    if bytes.len() != len {
        return Err(UpdaterError::validation(format!(
            "digest must be {len} bytes, got {}",
            bytes.len()
        )));
    }
    Ok(bytes)
}

/// File entry of a parsed release, URL not yet resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub url: String,
    pub checksum: Checksum,
    pub size: Option<u64>,
    pub block_map_url: Option<String>,
}

/// Latest release as described by a channel manifest. Immutable once fetched.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionInfo {
    pub version: semver::Version,
    pub release_date: Option<DateTime<Utc>>,
    pub release_name: Option<String>,
    pub release_notes: Option<String>,
    pub staging_percentage: Option<f64>,
    pub minimum_system_version: Option<String>,
    pub files: Vec<FileInfo>,
}

/// Where the block map of a file comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockMapSource {
    /// Separate compressed document.
    Sidecar(Url),
    /// Trailer appended to the artifact itself.
    Embedded,
}

/// A release file with an absolute URL. Immutable after resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    pub url: Url,
    pub checksum: Checksum,
    pub size: Option<u64>,
    pub block_map_url: Option<Url>,
    /// Packaging kind, the file extension (`AppImage`, `exe`, `zip`, ...).
    pub packaging: String,
    /// Architecture tag found in the file name, if any.
    pub arch: Option<Arch>,
}

impl FileDescriptor {
    pub fn new(url: Url, checksum: Checksum, size: Option<u64>, block_map_url: Option<Url>) -> Self {
        let name = file_name_of(&url);
        let packaging = name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_string())
            .unwrap_or_default();
        let arch = Arch::detect_in_file_name(&name);
        Self {
            url,
            checksum,
            size,
            block_map_url,
            packaging,
            arch,
        }
    }

    /// Last path segment of the URL.
    pub fn file_name(&self) -> String {
        file_name_of(&self.url)
    }

    /// Whether the packaging tag equals `tag`, ignoring case.
    pub fn is_packaging(&self, tag: &str) -> bool {
        self.packaging.eq_ignore_ascii_case(tag)
    }

    /// Location of the block map describing the new file.
    ///
    /// An explicit sidecar wins; AppImages carry their map as a trailer;
    /// everything else publishes `<url>.blockmap`.
    pub fn block_map_source(&self) -> BlockMapSource {
        if let Some(url) = &self.block_map_url {
            return BlockMapSource::Sidecar(url.clone());
        }
        if self.is_packaging("AppImage") {
            return BlockMapSource::Embedded;
        }
        let mut sidecar = self.url.clone();
        sidecar.set_path(&format!("{}.blockmap", self.url.path()));
        BlockMapSource::Sidecar(sidecar)
    }
}

fn file_name_of(url: &Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back().map(str::to_string))
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "update".to_string())
}

/// Parse a channel manifest into a [`VersionInfo`].
pub fn parse_update_info(raw: &str, channel_file: &str) -> Result<VersionInfo> {
    let invalid = |reason: String| UpdaterError::InvalidUpdateInfo {
        file: channel_file.to_string(),
        reason,
    };

    let manifest: UpdateManifest =
        serde_yaml::from_str(raw).map_err(|err| invalid(format!("cannot parse YAML: {err}")))?;
    let version = semver::Version::parse(manifest.version.trim())
        .map_err(|err| invalid(format!("invalid version {:?}: {err}", manifest.version)))?;

    let mut entries = manifest.files.clone();
    if entries.is_empty() {
        match &manifest.path {
            Some(path) => entries.push(ManifestFile {
                url: path.clone(),
                sha512: manifest.sha512.clone(),
                sha2: None,
                size: None,
                block_map_url: None,
                block_map_size: None,
            }),
            None => return Err(invalid("no files listed".into())),
        }
    }

    let mut files = Vec::with_capacity(entries.len());
    for entry in entries {
        let checksum = match (&entry.sha512, &entry.sha2) {
            (Some(sha512), _) => Checksum::parse_sha512(sha512),
            (None, Some(sha2)) => Checksum::parse_sha256(sha2),
            (None, None) => Err(UpdaterError::validation("no checksum")),
        }
        .map_err(|err| invalid(format!("file {:?}: {err}", entry.url)))?;
        files.push(FileInfo {
            url: entry.url,
            checksum,
            size: entry.size,
            block_map_url: entry.block_map_url,
        });
    }

    let release_date = manifest.release_date.as_deref().and_then(|raw| {
        match DateTime::parse_from_rfc3339(raw) {
            Ok(date) => Some(date.with_timezone(&Utc)),
            Err(err) => {
                tracing::warn!("ignoring unparsable releaseDate {raw:?} in {channel_file}: {err}");
                None
            }
        }
    });

    Ok(VersionInfo {
        version,
        release_date,
        release_name: manifest.release_name,
        release_notes: manifest.release_notes.as_ref().map(ReleaseNotes::to_text),
        staging_percentage: manifest.staging_percentage,
        minimum_system_version: manifest.minimum_system_version,
        files,
    })
}

/// Resolve the files of `info` against `base`.
pub fn resolve_files(info: &VersionInfo, base: &Url) -> Result<Vec<FileDescriptor>> {
    info.files
        .iter()
        .map(|file| {
            let url = crate::transport::new_url_from_base(&file.url, base, false)?;
            let block_map_url = file
                .block_map_url
                .as_deref()
                .map(|raw| crate::transport::new_url_from_base(raw, base, false))
                .transpose()?;
            Ok(FileDescriptor::new(
                url,
                file.checksum.clone(),
                file.size,
                block_map_url,
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Digest, Sha512};

    fn sha512_b64(data: &[u8]) -> String {
        general_purpose::STANDARD.encode(Sha512::digest(data))
    }

    #[test]
    fn parses_files_and_metadata() {
        let raw = format!(
            "version: 1.3.0\nfiles:\n  - url: App-1.3.0.AppImage\n    sha512: {}\n    size: 10000\nreleaseDate: '2024-05-01T10:00:00.000Z'\nreleaseNotes: Bug fixes\nstagingPercentage: 50\n",
            sha512_b64(b"new")
        );
        let info = parse_update_info(&raw, "latest-linux.yml").unwrap();
        assert_eq!(info.version, semver::Version::new(1, 3, 0));
        assert_eq!(info.files.len(), 1);
        assert_eq!(info.files[0].size, Some(10000));
        assert_eq!(info.release_notes.as_deref(), Some("Bug fixes"));
        assert_eq!(info.staging_percentage, Some(50.0));
        assert!(info.release_date.is_some());
    }

    #[test]
    fn legacy_path_becomes_single_file() {
        let raw = format!(
            "version: 2.0.0\npath: App Setup 2.0.0.exe\nsha512: {}\n",
            sha512_b64(b"x")
        );
        let info = parse_update_info(&raw, "latest.yml").unwrap();
        assert_eq!(info.files.len(), 1);
        assert_eq!(info.files[0].url, "App Setup 2.0.0.exe");
    }

    #[test]
    fn hex_and_base64_digests_agree() {
        let digest = Sha512::digest(b"payload");
        let from_hex = Checksum::parse_sha512(&hex::encode(digest)).unwrap();
        let from_b64 = Checksum::parse_sha512(&general_purpose::STANDARD.encode(digest)).unwrap();
        assert_eq!(from_hex, from_b64);
        assert!(Checksum::parse_sha512("not a digest").is_err());
    }

    #[test]
    fn rejects_bad_manifests() {
        assert!(matches!(
            parse_update_info("version: [", "latest.yml"),
            Err(UpdaterError::InvalidUpdateInfo { .. })
        ));
        assert!(matches!(
            parse_update_info("version: banana\nfiles: []\n", "latest.yml"),
            Err(UpdaterError::InvalidUpdateInfo { .. })
        ));
        assert!(matches!(
            parse_update_info("version: 1.0.0\nfiles: []\n", "latest.yml"),
            Err(UpdaterError::InvalidUpdateInfo { .. })
        ));
    }

    #[test]
    fn descriptor_tags_and_block_map_source() {
        let base = Url::parse("https://updates.example.com/app/").unwrap();
        let checksum = Checksum::parse_sha512(&sha512_b64(b"a")).unwrap();
        let appimage = FileDescriptor::new(
            base.join("App-1.0.0-arm64.AppImage").unwrap(),
            checksum.clone(),
            Some(1),
            None,
        );
        assert_eq!(appimage.packaging, "AppImage");
        assert_eq!(appimage.arch, Some(Arch::Arm64));
        assert_eq!(appimage.block_map_source(), BlockMapSource::Embedded);

        let exe = FileDescriptor::new(base.join("App Setup.exe").unwrap(), checksum, Some(1), None);
        match exe.block_map_source() {
            BlockMapSource::Sidecar(url) => assert!(url.path().ends_with(".exe.blockmap")),
            other => panic!("unexpected source {other:?}"),
        }
    }
}
