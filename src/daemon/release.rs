use std::io::Read as _;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use flate2::read::GzDecoder;
use serde::Deserialize;
use tar::Archive;

pub const DAEMON_BINARY: &str = "boltzd";
pub const CLI_BINARY: &str = "boltzcli";

const GITHUB_LATEST_RELEASE: &str =
    "https://api.github.com/repos/BoltzExchange/boltz-client/releases/latest";
const GITHUB_DOWNLOAD_BASE: &str = "https://github.com/BoltzExchange/boltz-client/releases/download";

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("fetch {what}: {source}")]
    Http {
        what: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("release server answered {status} for {url}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },
    #[error("archive does not contain `{0}`")]
    MissingBinary(&'static str),
    #[error("extract archive: {0}")]
    Extract(#[source] std::io::Error),
    #[error("write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no release artifact for {os}/{arch}")]
    UnsupportedPlatform { os: String, arch: String },
}

/// Release artifact naming for one OS/architecture pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    os: &'static str,
    arch: &'static str,
}

impl Platform {
    pub fn current() -> Result<Self, DownloadError> {
        Self::from_parts(std::env::consts::OS, std::env::consts::ARCH)
    }

    pub fn from_parts(os: &str, arch: &str) -> Result<Self, DownloadError> {
        let os = match os {
            "linux" => "linux",
            "macos" => "darwin",
            _ => {
                return Err(DownloadError::UnsupportedPlatform {
                    os: os.to_string(),
                    arch: arch.to_string(),
                });
            }
        };
        let arch = match arch {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            _ => {
                return Err(DownloadError::UnsupportedPlatform {
                    os: os.to_string(),
                    arch: arch.to_string(),
                });
            }
        };
        Ok(Self { os, arch })
    }

    /// `linux-amd64`, `darwin-arm64`, ...
    pub fn name(&self) -> String {
        format!("{}-{}", self.os, self.arch)
    }

    pub fn archive_name(&self, version: &str) -> String {
        format!("boltz-client-{}-{version}.tar.gz", self.name())
    }
}

/// Where daemon releases come from.
#[async_trait]
pub trait ReleaseSource: Send + Sync {
    async fn latest_version(&self) -> Result<String, DownloadError>;

    /// Returns the gzip-compressed tarball for `version` on `platform`.
    async fn fetch_archive(
        &self,
        version: &str,
        platform: &Platform,
    ) -> Result<Vec<u8>, DownloadError>;
}

#[derive(Debug, Deserialize)]
struct GithubRelease {
    tag_name: String,
}

#[derive(Debug, Clone)]
pub struct GithubReleases {
    client: reqwest::Client,
}

impl GithubReleases {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for GithubReleases {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReleaseSource for GithubReleases {
    async fn latest_version(&self) -> Result<String, DownloadError> {
        let http = |source| DownloadError::Http {
            what: "latest release".to_string(),
            source,
        };
        let response = self
            .client
            .get(GITHUB_LATEST_RELEASE)
            .header(reqwest::header::USER_AGENT, "boltz-bridge")
            .send()
            .await
            .map_err(http)?;
        if !response.status().is_success() {
            return Err(DownloadError::Status {
                url: GITHUB_LATEST_RELEASE.to_string(),
                status: response.status(),
            });
        }
        let release: GithubRelease = response.json().await.map_err(http)?;
        Ok(release.tag_name)
    }

    async fn fetch_archive(
        &self,
        version: &str,
        platform: &Platform,
    ) -> Result<Vec<u8>, DownloadError> {
        let url = format!(
            "{GITHUB_DOWNLOAD_BASE}/{version}/{}",
            platform.archive_name(version)
        );
        let http = |source| DownloadError::Http {
            what: url.clone(),
            source,
        };
        let response = self.client.get(&url).send().await.map_err(http)?;
        if !response.status().is_success() {
            return Err(DownloadError::Status {
                url: url.clone(),
                status: response.status(),
            });
        }
        let bytes = response.bytes().await.map_err(http)?;
        Ok(bytes.to_vec())
    }
}

/// Unpacks `boltzd` and `boltzcli` from a release tarball into `dest`,
/// ignoring the directory layout inside the archive. Returns the daemon path.
pub fn extract_binaries(archive: &[u8], dest: &Path) -> Result<PathBuf, DownloadError> {
    std::fs::create_dir_all(dest).map_err(|source| DownloadError::Io {
        path: dest.to_path_buf(),
        source,
    })?;

    let mut tar = Archive::new(GzDecoder::new(archive));
    let mut found_daemon = false;
    for entry in tar.entries().map_err(DownloadError::Extract)? {
        let mut entry = entry.map_err(DownloadError::Extract)?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = match entry
            .path()
            .map_err(DownloadError::Extract)?
            .file_name()
            .and_then(|n| n.to_str())
        {
            Some(name) if name == DAEMON_BINARY || name == CLI_BINARY => name.to_string(),
            _ => continue,
        };
        let is_daemon = name == DAEMON_BINARY;
        let target = dest.join(&name);

        let mut bytes = Vec::new();
        entry
            .read_to_end(&mut bytes)
            .map_err(DownloadError::Extract)?;
        write_executable(&target, &bytes)?;
        found_daemon |= is_daemon;
    }

    if !found_daemon {
        return Err(DownloadError::MissingBinary(DAEMON_BINARY));
    }
    Ok(dest.join(DAEMON_BINARY))
}

fn write_executable(path: &Path, bytes: &[u8]) -> Result<(), DownloadError> {
    let io = |source| DownloadError::Io {
        path: path.to_path_buf(),
        source,
    };
    std::fs::write(path, bytes).map_err(io)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).map_err(io)?;
    }
    Ok(())
}
