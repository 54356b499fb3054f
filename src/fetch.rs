//! Populating a staging directory from per-subject archives.
//!
//! An [`ArchiveCatalog`] lists, per subject, the archives available and the
//! resource each one is retrieved from. [`fetch_subjects`] retrieves and
//! unpacks the requested archives into `<staging>/<subject>/`, skipping any
//! archive whose folder is already there.

use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use tar::Archive;
use thiserror::Error;

/// Archives fetched when the caller asks for none in particular
pub const DEFAULT_ARCHIVES: [&str; 2] = ["ct.tar.gz", "mr_T1.tar.gz"];

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("The dataset licence agreement has not been accepted")]
    LicenseNotAccepted,

    #[error("Unknown resource {0}")]
    UnknownResource(String),

    #[error("Malformed archive catalog: {0}")]
    Catalog(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub trait Fetcher: Send + Sync {
    fn retrieve(&self, resource: &str) -> Result<Vec<u8>, FetchError>;

    /// Unpack a gzip-compressed tarball into `destination`
    fn extract(&self, bytes: &[u8], destination: &Path) -> Result<(), FetchError> {
        fs::create_dir_all(destination)?;
        Archive::new(GzDecoder::new(bytes)).unpack(destination)?;
        Ok(())
    }
}

/// Resolves resources as relative paths under a base directory.
#[derive(Clone, Debug)]
pub struct LocalArchiveFetcher {
    base: PathBuf,
}

impl LocalArchiveFetcher {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }
}

impl Fetcher for LocalArchiveFetcher {
    fn retrieve(&self, resource: &str) -> Result<Vec<u8>, FetchError> {
        let relative = Path::new(resource);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        let path = self.base.join(relative);
        if escapes || !path.is_file() {
            return Err(FetchError::UnknownResource(resource.to_string()));
        }
        Ok(fs::read(path)?)
    }
}

/// Subject name → archive name → resource
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArchiveCatalog(BTreeMap<String, BTreeMap<String, String>>);

impl ArchiveCatalog {
    pub fn from_json_file(path: &Path) -> Result<Self, FetchError> {
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }

    pub fn insert(&mut self, subject: &str, archive: &str, resource: &str) {
        self.0
            .entry(subject.to_string())
            .or_default()
            .insert(archive.to_string(), resource.to_string());
    }

    pub fn subjects(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn resource(&self, subject: &str, archive: &str) -> Option<&str> {
        self.0.get(subject)?.get(archive).map(String::as_str)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FetchStatus {
    Extracted,
    AlreadyPresent,
    NotListed,
    Failed { message: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FetchRecord {
    pub subject: String,
    pub archive: String,
    #[serde(flatten)]
    pub status: FetchStatus,
}

/// Folder an archive unpacks to: its name up to the first dot
pub fn archive_stem(archive: &str) -> &str {
    archive.split('.').next().unwrap_or(archive)
}

/// Retrieve and unpack `archives` for every subject of `catalog`.
///
/// Nothing is retrieved unless `license_accepted` is set. A failing archive
/// is recorded and the remaining ones are still fetched.
pub fn fetch_subjects<S: AsRef<str>>(
    catalog: &ArchiveCatalog,
    fetcher: &dyn Fetcher,
    staging: &Path,
    archives: &[S],
    license_accepted: bool,
) -> Result<Vec<FetchRecord>, FetchError> {
    if !license_accepted {
        return Err(FetchError::LicenseNotAccepted);
    }
    fs::create_dir_all(staging)?;

    let mut records = Vec::new();
    for subject in catalog.subjects() {
        let subject_dir = staging.join(subject);
        for archive in archives.iter().map(AsRef::as_ref) {
            let status = match catalog.resource(subject, archive) {
                None => FetchStatus::NotListed,
                Some(_) if subject_dir.join(archive_stem(archive)).exists() => {
                    FetchStatus::AlreadyPresent
                }
                Some(resource) => match fetcher
                    .retrieve(resource)
                    .and_then(|bytes| fetcher.extract(&bytes, &subject_dir))
                {
                    Ok(()) => FetchStatus::Extracted,
                    Err(err) => FetchStatus::Failed {
                        message: err.to_string(),
                    },
                },
            };

            match &status {
                FetchStatus::Extracted => log::info!("{subject}: extracted {archive}"),
                FetchStatus::AlreadyPresent => log::debug!("{subject}: {archive} already present"),
                FetchStatus::NotListed => log::debug!("{subject}: no {archive} in catalog"),
                FetchStatus::Failed { message } => {
                    log::error!("{subject}: fetching {archive} failed: {message}")
                }
            }
            records.push(FetchRecord {
                subject: subject.to_string(),
                archive: archive.to_string(),
                status,
            });
        }
    }
    Ok(records)
}
