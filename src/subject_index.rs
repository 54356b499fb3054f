//! Discovery of subjects and modalities in a flat directory of volumes.

use crate::enums::DuplicatePolicy;

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct SubjectId(String);

impl SubjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Modality key, always stored lowercased (`"mr_T1"` and `"MR_t1"` are the
/// same modality).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct ModalityId(String);

impl ModalityId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(id.as_ref().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Modality of a stage output, e.g. `ct` + `dn` -> `ct_dn`
    pub fn with_postfix(&self, postfix: Option<&str>) -> Self {
        match postfix {
            Some(postfix) => Self::new(format!("{}_{}", self.0, postfix)),
            None => self.clone(),
        }
    }
}

impl From<&str> for ModalityId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl fmt::Display for ModalityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One volume file on disk.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct VolumeRef {
    pub subject: SubjectId,
    pub modality: ModalityId,
    pub path: PathBuf,
}

pub type ModalityMap = BTreeMap<ModalityId, VolumeRef>;

/// Filename protocol shared by every stage. Outputs of one stage are found
/// by the next one through it, so `parse` and `file_name` must agree.
pub trait NamingConvention: Send + Sync {
    fn extension(&self) -> &str;

    fn parse(&self, filename: &str) -> Option<(SubjectId, ModalityId)>;

    fn file_name(&self, subject: &SubjectId, modality: &ModalityId, postfix: Option<&str>)
    -> String;
}

/// `<prefix>_<number>_<modality tokens...>.<ext>`
///
/// The subject is the lowercased prefix joined to the number, the modality
/// is the remaining tokens joined with `_` and lowercased.
#[derive(Clone, Debug)]
pub struct StandardNaming {
    extension: String,
}

impl StandardNaming {
    pub fn new(extension: impl Into<String>) -> Self {
        Self {
            extension: extension.into(),
        }
    }
}

impl Default for StandardNaming {
    fn default() -> Self {
        Self::new("mha")
    }
}

impl NamingConvention for StandardNaming {
    fn extension(&self) -> &str {
        &self.extension
    }

    fn parse(&self, filename: &str) -> Option<(SubjectId, ModalityId)> {
        let (stem, extension) = filename.rsplit_once('.')?;
        if !extension.eq_ignore_ascii_case(&self.extension) {
            return None;
        }

        let mut tokens = stem.split('_');
        let prefix = tokens.next().filter(|t| !t.is_empty())?;
        let number = tokens
            .next()
            .filter(|t| !t.is_empty() && t.bytes().all(|b| b.is_ascii_digit()))?;
        let modality: Vec<&str> = tokens.collect();
        if modality.is_empty() || modality.iter().any(|t| t.is_empty()) {
            return None;
        }

        Some((
            SubjectId::new(format!("{}_{}", prefix.to_lowercase(), number)),
            ModalityId::new(modality.join("_")),
        ))
    }

    fn file_name(
        &self,
        subject: &SubjectId,
        modality: &ModalityId,
        postfix: Option<&str>,
    ) -> String {
        match postfix {
            Some(postfix) => format!("{subject}_{modality}_{postfix}.{}", self.extension),
            None => format!("{subject}_{modality}.{}", self.extension),
        }
    }
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error(
        "Subject {subject} has more than one {modality} volume: {} and {}",
        first.display(),
        second.display()
    )]
    DuplicateModality {
        subject: SubjectId,
        modality: ModalityId,
        first: PathBuf,
        second: PathBuf,
    },

    #[error("Cannot list {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// `subject -> modality -> file`, built once from a directory snapshot.
#[derive(Clone, Debug, Default)]
pub struct SubjectIndex {
    subjects: Vec<(SubjectId, ModalityMap)>,
    positions: HashMap<SubjectId, usize>,
}

impl SubjectIndex {
    /// Build an index from bare filenames located in `directory`.
    ///
    /// Filenames are sorted first so discovery order does not depend on
    /// the order the file system lists them in. Names the convention does
    /// not recognise are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::DuplicateModality`] when two files resolve to
    /// the same subject and modality and `policy` is
    /// [`DuplicatePolicy::Fail`].
    pub fn build<S: AsRef<str>>(
        directory: &Path,
        filenames: &[S],
        naming: &dyn NamingConvention,
        policy: DuplicatePolicy,
    ) -> Result<Self, IndexError> {
        let mut sorted: Vec<&str> = filenames.iter().map(|name| name.as_ref()).collect();
        sorted.sort_unstable();

        let mut index = Self::default();
        for filename in sorted {
            let Some((subject, modality)) = naming.parse(filename) else {
                log::debug!("Ignoring {filename}: does not follow the naming convention");
                continue;
            };
            let volume = VolumeRef {
                subject: subject.clone(),
                modality: modality.clone(),
                path: directory.join(filename),
            };

            let position = *index.positions.entry(subject.clone()).or_insert_with(|| {
                index.subjects.push((subject.clone(), ModalityMap::new()));
                index.subjects.len() - 1
            });
            let modalities = &mut index.subjects[position].1;

            if let Some(existing) = modalities.get(&modality) {
                match policy {
                    DuplicatePolicy::Fail => {
                        return Err(IndexError::DuplicateModality {
                            subject,
                            modality,
                            first: existing.path.clone(),
                            second: volume.path,
                        });
                    }
                    DuplicatePolicy::KeepFirst => {
                        log::warn!(
                            "{subject}: ignoring {} because {modality} is already provided by {}",
                            volume.path.display(),
                            existing.path.display()
                        );
                        continue;
                    }
                }
            }
            modalities.insert(modality, volume);
        }

        Ok(index)
    }

    /// List `directory` and index every regular file carrying the naming
    /// convention's extension.
    pub fn scan(
        directory: &Path,
        naming: &dyn NamingConvention,
        policy: DuplicatePolicy,
    ) -> Result<Self, IndexError> {
        let io_error = |source| IndexError::Io {
            path: directory.to_path_buf(),
            source,
        };
        let filenames: Vec<String> = fs::read_dir(directory)
            .map_err(io_error)?
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_ok_and(|t| t.is_file()))
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| {
                Path::new(name)
                    .extension()
                    .and_then(|s| s.to_str())
                    .is_some_and(|ext| ext.eq_ignore_ascii_case(naming.extension()))
            })
            .collect();

        Self::build(directory, &filenames, naming, policy)
    }

    pub fn lookup(&self, subject: &SubjectId, modality: &ModalityId) -> Option<&VolumeRef> {
        self.modalities(subject)?.get(modality)
    }

    pub fn modalities(&self, subject: &SubjectId) -> Option<&ModalityMap> {
        self.positions
            .get(subject)
            .map(|&position| &self.subjects[position].1)
    }

    /// Subjects in discovery order
    pub fn subjects(&self) -> impl Iterator<Item = &SubjectId> {
        self.subjects.iter().map(|(subject, _)| subject)
    }

    pub fn len(&self) -> usize {
        self.subjects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn build(filenames: &[&str], policy: DuplicatePolicy) -> Result<SubjectIndex, IndexError> {
        SubjectIndex::build(
            Path::new("/data"),
            filenames,
            &StandardNaming::default(),
            policy,
        )
    }

    #[test]
    fn parses_multi_token_modalities() {
        let naming = StandardNaming::default();
        assert_eq!(
            naming.parse("Patient_001_mr_T1.mha"),
            Some((SubjectId::new("patient_001"), ModalityId::new("mr_t1")))
        );
        assert_eq!(
            naming.parse("p_002_ct.MHA"),
            Some((SubjectId::new("p_002"), ModalityId::new("ct")))
        );
    }

    #[test]
    fn rejects_names_outside_the_convention() {
        let naming = StandardNaming::default();
        assert_eq!(naming.parse("p_001_ct.nii"), None);
        assert_eq!(naming.parse("p_001.mha"), None);
        assert_eq!(naming.parse("p_abc_ct.mha"), None);
        assert_eq!(naming.parse("p_001__ct.mha"), None);
        assert_eq!(naming.parse("README"), None);
    }

    #[test]
    fn file_name_is_parsed_back() {
        let naming = StandardNaming::default();
        let subject = SubjectId::new("p_001");
        let modality = ModalityId::new("mr_t1");
        let name = naming.file_name(&subject, &modality, Some("dn"));
        assert_eq!(name, "p_001_mr_t1_dn.mha");
        assert_eq!(
            naming.parse(&name),
            Some((subject, modality.with_postfix(Some("dn"))))
        );
    }

    #[test]
    fn subjects_follow_sorted_filename_order() {
        let index = build(
            &["p_010_ct.mha", "notes.txt", "p_002_ct.mha", "p_002_mr_T1.mha"],
            DuplicatePolicy::Fail,
        )
        .unwrap();
        let subjects: Vec<_> = index.subjects().map(SubjectId::as_str).collect();
        assert_eq!(subjects, ["p_002", "p_010"]);
        assert_eq!(index.len(), 2);

        let mr = index
            .lookup(&SubjectId::new("p_002"), &ModalityId::new("MR_T1"))
            .unwrap();
        assert_eq!(mr.path, Path::new("/data/p_002_mr_T1.mha"));
        assert!(index
            .lookup(&SubjectId::new("p_010"), &ModalityId::new("mr_t1"))
            .is_none());
    }

    #[test]
    fn duplicate_modality_fails() {
        let err = build(&["p_001_ct.mha", "P_001_CT.mha"], DuplicatePolicy::Fail).unwrap_err();
        match err {
            IndexError::DuplicateModality {
                subject, modality, ..
            } => {
                assert_eq!(subject, SubjectId::new("p_001"));
                assert_eq!(modality, ModalityId::new("ct"));
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn duplicate_modality_keeps_first_when_asked() {
        let index = build(&["p_001_ct.mha", "P_001_CT.mha"], DuplicatePolicy::KeepFirst).unwrap();
        let ct = index
            .lookup(&SubjectId::new("p_001"), &ModalityId::new("ct"))
            .unwrap();
        // "P_..." sorts before "p_..."
        assert_eq!(ct.path, Path::new("/data/P_001_CT.mha"));
    }

    #[test]
    fn scan_lists_only_matching_files() {
        let dir = TempDir::new().unwrap();
        for name in ["p_001_ct.mha", "p_001_mr_T1.mha", "p_001_ct.raw", "p_002_ct.mha"] {
            fs::write(dir.path().join(name), b"").unwrap();
        }
        fs::create_dir(dir.path().join("p_003_ct.mha")).unwrap();

        let index = SubjectIndex::scan(
            dir.path(),
            &StandardNaming::default(),
            DuplicatePolicy::Fail,
        )
        .unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index.modalities(&SubjectId::new("p_001")).unwrap().len(), 2);
    }

    #[test]
    fn scan_of_missing_directory_is_an_error() {
        let result = SubjectIndex::scan(
            Path::new("/nonexistent/volume-prep"),
            &StandardNaming::default(),
            DuplicatePolicy::Fail,
        );
        assert!(matches!(result, Err(IndexError::Io { .. })));
    }
}
