//! Persisted build state: input records, fingerprints, and the inverse
//! output index.
//!
//! One `BuildState` corresponds to one state file, which corresponds to one
//! `(output directory, builder id)` pair. Reads are fail-safe: an absent,
//! truncated, or version-mismatched state file yields an empty state and
//! thereby a full build. Writes are atomic (temp file + rename) and detect,
//! but tolerate, concurrent replacement of the file.

use crate::error::BuildError;
use crate::file_state::{mtime_millis, FileState};
use crate::pathset::{PathSet, Selector};
use serde::{Deserialize, Serialize};
use skipstone_common::relative_path;
use skipstone_diagnostics::Message;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Magic bytes identifying a skipstone state file.
const STATE_MAGIC: [u8; 4] = *b"SKBS";

/// Current state-file format version. Increment on breaking changes to
/// the persisted model; older files are then treated as absent.
const STATE_FORMAT_VERSION: u32 = 1;

/// Everything the engine remembers about one input between builds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputRecord {
    /// Outputs registered from this input during the last committed build.
    pub outputs: BTreeSet<PathBuf>,
    /// Files whose content feeds into this input's processing.
    pub referenced: BTreeSet<PathBuf>,
    /// Fingerprint of the input captured when its outputs were committed.
    pub fingerprint: FileState,
    /// Fingerprints of the referenced files, captured alongside.
    pub referenced_fingerprints: BTreeMap<PathBuf, FileState>,
    /// Messages recorded against this input, replayed until cleared.
    pub messages: Vec<Message>,
}

/// The serialized portion of a [`BuildState`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StateData {
    configuration: Option<Vec<u8>>,
    inputs: BTreeMap<PathBuf, InputRecord>,
    output_to_inputs: BTreeMap<PathBuf, BTreeSet<PathBuf>>,
    user_values: BTreeMap<Vec<u8>, Vec<u8>>,
}

/// The persisted record of one `(output directory, builder id)` pair's
/// previous build, plus the queries and mutations the commit protocol needs.
#[derive(Debug)]
pub struct BuildState {
    state_file: PathBuf,
    file_time: i64,
    file_size: u64,
    data: StateData,
}

impl BuildState {
    /// Creates an empty state bound to `state_file`.
    ///
    /// The current on-disk fingerprint of the file (all zero when absent) is
    /// captured so a later [`save`](Self::save) can tell whether someone else
    /// replaced the file in the meantime.
    pub fn new(state_file: PathBuf) -> Self {
        let on_disk = FileState::of(&state_file);
        Self {
            state_file,
            file_time: on_disk.mtime,
            file_size: on_disk.size,
            data: StateData::default(),
        }
    }

    /// Loads the state from `state_file`.
    ///
    /// Fails with [`BuildError::Io`] when the file cannot be read and with
    /// [`BuildError::Decode`] when it does not carry a decodable state of the
    /// current format version. Callers treat either as "state absent".
    pub fn load(state_file: &Path) -> Result<Self, BuildError> {
        let bytes =
            std::fs::read(state_file).map_err(|source| BuildError::io(state_file, source))?;

        let decode_err = |reason: &str| BuildError::Decode {
            path: state_file.to_path_buf(),
            reason: reason.to_string(),
        };

        if bytes.len() < 8 {
            return Err(decode_err("file too short"));
        }
        if bytes[..4] != STATE_MAGIC {
            return Err(decode_err("bad magic bytes"));
        }
        let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if version != STATE_FORMAT_VERSION {
            return Err(BuildError::Decode {
                path: state_file.to_path_buf(),
                reason: format!(
                    "format version {version}, expected {STATE_FORMAT_VERSION}"
                ),
            });
        }

        let (data, _) =
            bincode::serde::decode_from_slice::<StateData, _>(&bytes[8..], bincode::config::standard())
                .map_err(|e| BuildError::Decode {
                    path: state_file.to_path_buf(),
                    reason: e.to_string(),
                })?;

        let on_disk = FileState::of(state_file);
        Ok(Self {
            state_file: state_file.to_path_buf(),
            file_time: on_disk.mtime,
            file_size: on_disk.size,
            data,
        })
    }

    /// The path of the backing state file.
    pub fn state_file(&self) -> &Path {
        &self.state_file
    }

    /// Whether the state file on disk has been replaced since this state was
    /// loaded or last saved.
    pub fn is_stale(&self) -> bool {
        let on_disk = FileState::of(&self.state_file);
        on_disk.mtime != self.file_time || on_disk.size != self.file_size
    }

    /// True iff no configuration digest is stored or the stored digest
    /// differs byte-for-byte from `digest`.
    pub fn is_configuration_changed(&self, digest: &[u8]) -> bool {
        match &self.data.configuration {
            Some(stored) => stored.as_slice() != digest,
            None => true,
        }
    }

    /// Looks up an opaque user value persisted by a previous build.
    pub fn value(&self, key: &[u8]) -> Option<&[u8]> {
        self.data.user_values.get(key).map(|v| v.as_slice())
    }

    /// Stores an opaque user value for future incremental builds.
    pub fn set_value(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.data.user_values.insert(key, value);
    }

    /// Whether `file` must be reprocessed.
    ///
    /// True when the file is untracked, its fingerprint changed, one of its
    /// previously produced outputs is missing, or any referenced input is
    /// itself dirty (recursively; reference cycles are evaluated once per
    /// query).
    pub fn is_processing_required(&self, file: &Path) -> bool {
        let mut visited = HashSet::new();
        self.processing_required(file, &mut visited)
    }

    fn processing_required(&self, file: &Path, visited: &mut HashSet<PathBuf>) -> bool {
        if !visited.insert(file.to_path_buf()) {
            return false;
        }

        let Some(record) = self.data.inputs.get(file) else {
            return true;
        };
        if record.fingerprint != FileState::of(file) {
            return true;
        }
        if record.outputs.iter().any(|output| !output.exists()) {
            return true;
        }
        for referenced in &record.referenced {
            if self.data.inputs.contains_key(referenced) {
                if self.processing_required(referenced, visited) {
                    return true;
                }
            } else {
                match record.referenced_fingerprints.get(referenced) {
                    Some(stored) => {
                        if *stored != FileState::of(referenced) {
                            return true;
                        }
                    }
                    None => return true,
                }
            }
        }
        false
    }

    /// Relative paths of tracked inputs under `base_dir` that the path set
    /// selects but that are absent from `selected`, in lexicographic order.
    pub(crate) fn deleted_input_paths(
        &self,
        base_dir: &Path,
        selector: &Selector,
        selected: &HashSet<PathBuf>,
    ) -> Vec<String> {
        self.data
            .inputs
            .keys()
            .filter(|input| !selected.contains(*input))
            .filter_map(|input| relative_path(input, base_dir))
            .filter(|rel| selector.is_selected(rel))
            .collect()
    }

    /// Overwrites the stored configuration digest.
    pub(crate) fn set_configuration(&mut self, digest: Option<Vec<u8>>) {
        self.data.configuration = digest;
    }

    /// Replaces the referenced inputs of `input`, capturing a fresh
    /// fingerprint for every referenced file.
    pub(crate) fn set_referenced_inputs(&mut self, input: &Path, referenced: BTreeSet<PathBuf>) {
        let fingerprints = referenced
            .iter()
            .map(|r| (r.clone(), FileState::of(r)))
            .collect();
        let record = self.data.inputs.entry(input.to_path_buf()).or_default();
        record.referenced = referenced;
        record.referenced_fingerprints = fingerprints;
    }

    /// Replaces the outputs of `input`, re-probing the input's fingerprint.
    ///
    /// Returns the obsolete outputs: previously recorded for `input`, not
    /// re-registered, and not owned by any other input.
    pub(crate) fn set_outputs(
        &mut self,
        input: &Path,
        outputs: BTreeSet<PathBuf>,
    ) -> BTreeSet<PathBuf> {
        let record = self.data.inputs.entry(input.to_path_buf()).or_default();
        record.fingerprint = FileState::of(input);
        let old = std::mem::replace(&mut record.outputs, outputs.clone());

        for added in outputs.difference(&old) {
            self.data
                .output_to_inputs
                .entry(added.clone())
                .or_default()
                .insert(input.to_path_buf());
        }

        let mut obsolete = BTreeSet::new();
        for removed in old.difference(&outputs) {
            if self.release_output(removed, input) {
                obsolete.insert(removed.clone());
            }
        }
        obsolete
    }

    /// Deletes the record of `input` entirely.
    ///
    /// Returns the orphaned outputs: previously recorded for `input` and not
    /// owned by any other input after the removal.
    pub(crate) fn remove_input(&mut self, input: &Path) -> BTreeSet<PathBuf> {
        let Some(record) = self.data.inputs.remove(input) else {
            return BTreeSet::new();
        };

        let mut orphaned = BTreeSet::new();
        for output in &record.outputs {
            if self.release_output(output, input) {
                orphaned.insert(output.clone());
            }
        }
        orphaned
    }

    /// Drops `input` from the owner set of `output` in the inverse index.
    /// Returns `true` when no owner remains.
    fn release_output(&mut self, output: &Path, input: &Path) -> bool {
        let unowned = match self.data.output_to_inputs.get_mut(output) {
            Some(owners) => {
                owners.remove(input);
                owners.is_empty()
            }
            None => true,
        };
        if unowned {
            self.data.output_to_inputs.remove(output);
        }
        unowned
    }

    /// Replaces the stored messages of every input present in `new`.
    ///
    /// Returns the complete previous message map (inputs with at least one
    /// stored message), which the commit uses for diagnostic replay.
    pub(crate) fn merge_messages(
        &mut self,
        new: &BTreeMap<PathBuf, Vec<Message>>,
    ) -> BTreeMap<PathBuf, Vec<Message>> {
        let old = self
            .data
            .inputs
            .iter()
            .filter(|(_, record)| !record.messages.is_empty())
            .map(|(input, record)| (input.clone(), record.messages.clone()))
            .collect();

        for (input, messages) in new {
            let record = self.data.inputs.entry(input.clone()).or_default();
            record.messages = messages.clone();
        }
        old
    }

    /// Clears the stored messages of `input`.
    pub(crate) fn clear_messages(&mut self, input: &Path) {
        if let Some(record) = self.data.inputs.get_mut(input) {
            record.messages.clear();
        }
    }

    /// Prunes referenced-input fingerprints that no longer back a reference:
    /// entries for paths that are not referenced anymore or that are tracked
    /// inputs themselves (and therefore compared through their own record).
    pub(crate) fn cleanup_referenced_inputs(&mut self) {
        let tracked: HashSet<PathBuf> = self.data.inputs.keys().cloned().collect();
        for record in self.data.inputs.values_mut() {
            record
                .referenced_fingerprints
                .retain(|path, _| record.referenced.contains(path) && !tracked.contains(path));
        }
    }

    /// Number of persisted error-severity messages across inputs selected by
    /// any of the given path sets.
    pub(crate) fn selected_error_count(&self, sets: &[(PathSet, Selector)]) -> usize {
        self.data
            .inputs
            .iter()
            .filter(|(input, _)| input_matches_any(input, sets))
            .map(|(_, record)| {
                record
                    .messages
                    .iter()
                    .filter(|m| m.severity.is_error())
                    .count()
            })
            .sum()
    }

    /// Drops the entire persisted model, keeping the file binding.
    pub(crate) fn reset(&mut self) {
        self.data = StateData::default();
    }

    /// Persists the state atomically (temp file + rename).
    ///
    /// A concurrently replaced state file is logged and overwritten; the last
    /// writer wins and the loser finds out on its next load.
    pub(crate) fn save(&mut self) -> Result<(), BuildError> {
        if self.is_stale() {
            debug!(
                state_file = %self.state_file.display(),
                "concurrent modification of build state file"
            );
        }

        let parent = self.state_file.parent().unwrap_or(Path::new("."));
        std::fs::create_dir_all(parent).map_err(|source| BuildError::io(parent, source))?;

        let payload = bincode::serde::encode_to_vec(&self.data, bincode::config::standard())
            .map_err(|e| BuildError::Serialization {
                path: self.state_file.clone(),
                reason: e.to_string(),
            })?;

        let mut file = tempfile::NamedTempFile::new_in(parent)
            .map_err(|source| BuildError::io(parent, source))?;
        file.write_all(&STATE_MAGIC)
            .and_then(|()| file.write_all(&STATE_FORMAT_VERSION.to_le_bytes()))
            .and_then(|()| file.write_all(&payload))
            .map_err(|source| BuildError::io(&self.state_file, source))?;
        file.persist(&self.state_file)
            .map_err(|e| BuildError::io(&self.state_file, e.error))?;

        if let Ok(meta) = std::fs::metadata(&self.state_file) {
            self.file_time = mtime_millis(&meta);
            self.file_size = meta.len();
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn input(&self, input: &Path) -> Option<&InputRecord> {
        self.data.inputs.get(input)
    }

    #[cfg(test)]
    pub(crate) fn output_owners(&self, output: &Path) -> Option<&BTreeSet<PathBuf>> {
        self.data.output_to_inputs.get(output)
    }
}

/// Whether `input` lies under the base of any of the compiled path sets and
/// its relative path is selected by that set.
pub(crate) fn input_matches_any(input: &Path, sets: &[(PathSet, Selector)]) -> bool {
    sets.iter().any(|(paths, selector)| {
        relative_path(input, paths.base_dir())
            .is_some_and(|rel| selector.is_selected(&rel))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use skipstone_diagnostics::Severity;

    fn state_in(dir: &Path) -> BuildState {
        BuildState::new(dir.join("state.ser"))
    }

    fn outputs<P: AsRef<Path>>(paths: &[P]) -> BTreeSet<PathBuf> {
        paths.iter().map(|p| p.as_ref().to_path_buf()).collect()
    }

    #[test]
    fn fresh_state_requires_processing() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(dir.path());
        let input = dir.path().join("a.txt");
        std::fs::write(&input, "1").unwrap();
        assert!(state.is_processing_required(&input));
    }

    #[test]
    fn committed_input_is_clean_until_changed() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = state_in(dir.path());
        let input = dir.path().join("a.txt");
        let output = dir.path().join("a.out");
        std::fs::write(&input, "1").unwrap();
        std::fs::write(&output, "out").unwrap();

        state.set_outputs(&input, outputs(&[&output]));
        assert!(!state.is_processing_required(&input));

        std::fs::write(&input, "11").unwrap();
        assert!(state.is_processing_required(&input));
    }

    #[test]
    fn missing_output_requires_processing() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = state_in(dir.path());
        let input = dir.path().join("a.txt");
        let output = dir.path().join("a.out");
        std::fs::write(&input, "1").unwrap();
        std::fs::write(&output, "out").unwrap();

        state.set_outputs(&input, outputs(&[&output]));
        assert!(!state.is_processing_required(&input));

        std::fs::remove_file(&output).unwrap();
        assert!(state.is_processing_required(&input));
    }

    #[test]
    fn changed_referenced_file_requires_processing() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = state_in(dir.path());
        let input = dir.path().join("a.txt");
        let header = dir.path().join("a.h");
        std::fs::write(&input, "1").unwrap();
        std::fs::write(&header, "x").unwrap();

        state.set_referenced_inputs(&input, outputs(&[&header]));
        state.set_outputs(&input, BTreeSet::new());
        assert!(!state.is_processing_required(&input));

        std::fs::write(&header, "xx").unwrap();
        assert!(state.is_processing_required(&input));
    }

    #[test]
    fn reference_cycle_terminates() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = state_in(dir.path());
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        std::fs::write(&a, "a").unwrap();
        std::fs::write(&b, "b").unwrap();

        state.set_referenced_inputs(&a, outputs(&[&b]));
        state.set_outputs(&a, BTreeSet::new());
        state.set_referenced_inputs(&b, outputs(&[&a]));
        state.set_outputs(&b, BTreeSet::new());

        assert!(!state.is_processing_required(&a));

        std::fs::write(&b, "bb").unwrap();
        assert!(state.is_processing_required(&a));
    }

    #[test]
    fn set_outputs_returns_dropped_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = state_in(dir.path());
        let input = dir.path().join("a.txt");
        let keep = dir.path().join("a.out");
        let dropped = dir.path().join("a.aux");
        std::fs::write(&input, "1").unwrap();

        state.set_outputs(&input, outputs(&[&keep, &dropped]));
        let obsolete = state.set_outputs(&input, outputs(&[&keep]));
        assert_eq!(obsolete, outputs(&[&dropped]));
        assert!(state.output_owners(&dropped).is_none());
        assert!(state.output_owners(&keep).is_some());
    }

    #[test]
    fn shared_output_is_not_obsolete_while_owned() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = state_in(dir.path());
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        let shared = dir.path().join("merged.out");

        state.set_outputs(&a, outputs(&[&shared]));
        state.set_outputs(&b, outputs(&[&shared]));

        let obsolete = state.set_outputs(&a, BTreeSet::new());
        assert!(obsolete.is_empty(), "output still owned by b");

        let orphaned = state.remove_input(&b);
        assert_eq!(orphaned, outputs(&[&shared]));
    }

    #[test]
    fn remove_input_returns_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = state_in(dir.path());
        let input = dir.path().join("a.txt");
        let out = dir.path().join("a.out");

        state.set_outputs(&input, outputs(&[&out]));
        let orphaned = state.remove_input(&input);
        assert_eq!(orphaned, outputs(&[&out]));
        assert!(state.input(&input).is_none());

        assert!(state.remove_input(&input).is_empty());
    }

    #[test]
    fn merge_messages_returns_previous_map() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = state_in(dir.path());
        let input = dir.path().join("a.txt");

        let first = BTreeMap::from([(
            input.clone(),
            vec![Message::new(1, 1, "bad", Severity::Error, None)],
        )]);
        let old = state.merge_messages(&first);
        assert!(old.is_empty());

        let old = state.merge_messages(&BTreeMap::new());
        assert_eq!(old.len(), 1);
        assert_eq!(old[&input][0].text, "bad");

        let cleared = BTreeMap::from([(input.clone(), Vec::new())]);
        let old = state.merge_messages(&cleared);
        assert_eq!(old.len(), 1);
        assert!(state.input(&input).unwrap().messages.is_empty());
    }

    #[test]
    fn cleanup_prunes_unreferenced_fingerprints() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = state_in(dir.path());
        let input = dir.path().join("a.txt");
        let external = dir.path().join("a.h");
        let tracked = dir.path().join("b.txt");
        std::fs::write(&external, "x").unwrap();

        state.set_referenced_inputs(&input, outputs(&[&external, &tracked]));
        state.set_outputs(&input, BTreeSet::new());
        state.set_outputs(&tracked, BTreeSet::new());

        state.cleanup_referenced_inputs();
        let record = state.input(&input).unwrap();
        assert!(record.referenced_fingerprints.contains_key(&external));
        assert!(
            !record.referenced_fingerprints.contains_key(&tracked),
            "tracked inputs are compared through their own record"
        );
    }

    #[test]
    fn configuration_changes() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = state_in(dir.path());
        assert!(state.is_configuration_changed(b"v1"));

        state.set_configuration(Some(b"v1".to_vec()));
        assert!(!state.is_configuration_changed(b"v1"));
        assert!(state.is_configuration_changed(b"v2"));
    }

    #[test]
    fn user_values_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = state_in(dir.path());
        assert!(state.value(b"counter").is_none());
        state.set_value(b"counter".to_vec(), b"41".to_vec());
        assert_eq!(state.value(b"counter"), Some(b"41".as_slice()));
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = state_in(dir.path());
        let input = dir.path().join("a.txt");
        let out = dir.path().join("a.out");
        std::fs::write(&input, "1").unwrap();

        state.set_configuration(Some(b"cfg".to_vec()));
        state.set_outputs(&input, outputs(&[&out]));
        state.set_value(b"k".to_vec(), b"v".to_vec());
        state.save().unwrap();

        let loaded = BuildState::load(state.state_file()).unwrap();
        assert!(!loaded.is_configuration_changed(b"cfg"));
        assert_eq!(loaded.value(b"k"), Some(b"v".as_slice()));
        assert!(loaded.input(&input).is_some());
        assert_eq!(loaded.output_owners(&out).unwrap().len(), 1);
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = BuildState::load(&dir.path().join("absent.ser")).unwrap_err();
        assert!(matches!(err, BuildError::Io { .. }));
    }

    #[test]
    fn load_corrupt_file_is_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.ser");
        std::fs::write(&path, b"not a state file at all").unwrap();
        let err = BuildState::load(&path).unwrap_err();
        assert!(matches!(err, BuildError::Decode { .. }));
    }

    #[test]
    fn load_rejects_other_format_version() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = state_in(dir.path());
        state.save().unwrap();

        let mut bytes = std::fs::read(state.state_file()).unwrap();
        bytes[4] = 0xFF;
        std::fs::write(state.state_file(), bytes).unwrap();

        let err = BuildState::load(state.state_file()).unwrap_err();
        assert!(matches!(err, BuildError::Decode { .. }));
    }

    #[test]
    fn stale_after_external_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = state_in(dir.path());
        state.save().unwrap();
        assert!(!state.is_stale());

        std::fs::write(state.state_file(), b"someone else was here").unwrap();
        assert!(state.is_stale());

        // Save proceeds anyway; last writer wins.
        state.save().unwrap();
        assert!(!state.is_stale());
    }

    #[test]
    fn deleted_input_detection_honors_selector() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("in");
        std::fs::create_dir_all(&base).unwrap();
        let mut state = state_in(dir.path());

        let gone_txt = base.join("gone.txt");
        let gone_xml = base.join("gone.xml");
        let live = base.join("live.txt");
        state.set_outputs(&gone_txt, BTreeSet::new());
        state.set_outputs(&gone_xml, BTreeSet::new());
        state.set_outputs(&live, BTreeSet::new());

        let paths = PathSet::new(&base).with_includes(["**/*.txt"]);
        let selector = Selector::compile(&paths).unwrap();
        let selected = HashSet::from([live.clone()]);

        let deleted = state.deleted_input_paths(&base, &selector, &selected);
        assert_eq!(deleted, vec!["gone.txt".to_string()]);
    }
}
