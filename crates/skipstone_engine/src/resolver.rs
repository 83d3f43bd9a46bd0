//! Path-set resolution: the selection scan and dirtiness classification.

use crate::pathset::{PathSet, Selector};
use crate::state::BuildState;
use skipstone_common::relative_path;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// One path produced by a resolution, relative to the path set's base.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    /// `/`-separated path relative to the base directory; empty for the base
    /// itself.
    pub rel: String,
    /// Whether the path is a previously tracked input that no longer exists.
    pub deleted: bool,
}

impl ResolvedPath {
    fn live(rel: impl Into<String>) -> Self {
        Self {
            rel: rel.into(),
            deleted: false,
        }
    }
}

/// Scans the path set and classifies every selected entry.
///
/// Returns the paths that require processing (all of them when `full_build`
/// is set; the walk still runs so deletion detection stays correct),
/// followed by tracked inputs under the base that have disappeared, marked
/// `deleted`. Unreadable directory entries are skipped.
pub(crate) fn resolve_inputs(
    paths: &PathSet,
    selector: &Selector,
    state: &BuildState,
    full_build: bool,
) -> Vec<ResolvedPath> {
    let mut dirty = Vec::new();
    let selected = scan(paths, selector, |abs, rel| {
        if full_build || state.is_processing_required(abs) {
            dirty.push(ResolvedPath::live(rel));
        }
    });

    for rel in state.deleted_input_paths(paths.base_dir(), selector, &selected) {
        dirty.push(ResolvedPath { rel, deleted: true });
    }
    dirty
}

/// The selection scan without the dirtiness predicate: every matching entry,
/// as absolute paths.
pub(crate) fn resolve_outputs(paths: &PathSet, selector: &Selector) -> Vec<PathBuf> {
    let mut matched = Vec::new();
    scan(paths, selector, |abs, _| matched.push(abs.to_path_buf()));
    matched
}

/// Walks the base directory, invoking `visit` for every selected entry and
/// returning the set of selected absolute paths.
fn scan(
    paths: &PathSet,
    selector: &Selector,
    mut visit: impl FnMut(&Path, &str),
) -> HashSet<PathBuf> {
    let base = paths.base_dir();
    let mut selected = HashSet::new();

    if !base.is_dir() {
        return selected;
    }

    if paths.is_including_directories() && selector.is_selected("") {
        selected.insert(base.to_path_buf());
        visit(base, "");
    }

    let mut walker = WalkDir::new(base)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter();
    while let Some(entry) = walker.next() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                debug!(base = %base.display(), error = %e, "skipping unreadable entry");
                continue;
            }
        };
        let Some(rel) = relative_path(entry.path(), base) else {
            continue;
        };

        if entry.file_type().is_dir() {
            if paths.is_including_directories() && selector.is_selected(&rel) {
                selected.insert(entry.path().to_path_buf());
                visit(entry.path(), &rel);
            }
            if !selector.could_select_descendant(&rel) {
                walker.skip_current_dir();
            }
        } else if paths.is_including_files() && selector.is_selected(&rel) {
            selected.insert(entry.path().to_path_buf());
            visit(entry.path(), &rel);
        }
    }

    selected
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn rels(resolved: &[ResolvedPath]) -> Vec<&str> {
        resolved.iter().map(|p| p.rel.as_str()).collect()
    }

    fn compile(paths: &PathSet) -> Selector {
        Selector::compile(paths).unwrap()
    }

    #[test]
    fn fresh_state_marks_everything_dirty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "1").unwrap();
        std::fs::write(dir.path().join("b.txt"), "2").unwrap();

        let paths = PathSet::new(dir.path());
        let state = BuildState::new(dir.path().join("state.ser"));
        let resolved = resolve_inputs(&paths, &compile(&paths), &state, false);
        assert_eq!(rels(&resolved), ["a.txt", "b.txt"]);
    }

    #[test]
    fn committed_inputs_are_clean() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        std::fs::write(&a, "1").unwrap();
        std::fs::write(&b, "2").unwrap();

        let mut state = BuildState::new(dir.path().join("state.ser"));
        state.set_outputs(&a, BTreeSet::new());
        state.set_outputs(&b, BTreeSet::new());

        let paths = PathSet::new(dir.path()).with_includes(["*.txt"]);
        let resolved = resolve_inputs(&paths, &compile(&paths), &state, false);
        assert!(resolved.is_empty());

        std::fs::write(&a, "11").unwrap();
        let resolved = resolve_inputs(&paths, &compile(&paths), &state, false);
        assert_eq!(rels(&resolved), ["a.txt"]);
    }

    #[test]
    fn full_build_forces_dirtiness_but_keeps_deletions() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        std::fs::write(&a, "1").unwrap();

        let mut state = BuildState::new(dir.path().join("state.ser"));
        state.set_outputs(&a, BTreeSet::new());
        state.set_outputs(&dir.path().join("gone.txt"), BTreeSet::new());

        let paths = PathSet::new(dir.path()).with_includes(["*.txt"]);
        let resolved = resolve_inputs(&paths, &compile(&paths), &state, true);
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[0], ResolvedPath::live("a.txt"));
        assert_eq!(
            resolved[1],
            ResolvedPath {
                rel: "gone.txt".to_string(),
                deleted: true
            }
        );
    }

    #[test]
    fn unrelated_subtrees_are_pruned_without_losing_matches() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("gen/model")).unwrap();
        std::fs::create_dir_all(dir.path().join("docs")).unwrap();
        std::fs::write(dir.path().join("gen/model/a.java"), "1").unwrap();
        std::fs::write(dir.path().join("docs/readme.java"), "x").unwrap();

        let paths = PathSet::new(dir.path()).with_includes(["gen/**/*.java"]);
        let state = BuildState::new(dir.path().join("state.ser"));
        let resolved = resolve_inputs(&paths, &compile(&paths), &state, false);
        assert_eq!(rels(&resolved), ["gen/model/a.java"]);
    }

    #[test]
    fn directories_selected_when_included() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/a.txt"), "1").unwrap();

        let paths = PathSet::new(dir.path())
            .with_includes(["**"])
            .including_directories(true)
            .including_files(false);
        let state = BuildState::new(dir.path().join("state.ser"));
        let resolved = resolve_inputs(&paths, &compile(&paths), &state, false);
        assert_eq!(rels(&resolved), ["sub"]);
    }

    #[test]
    fn base_dir_itself_selected_with_match_all() {
        let dir = tempfile::tempdir().unwrap();

        let paths = PathSet::new(dir.path())
            .including_directories(true)
            .including_files(false);
        let state = BuildState::new(dir.path().join("state.ser"));
        let resolved = resolve_inputs(&paths, &compile(&paths), &state, false);
        assert_eq!(rels(&resolved), [""]);
    }

    #[test]
    fn missing_base_yields_only_deletions() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("absent");

        let mut state = BuildState::new(dir.path().join("state.ser"));
        state.set_outputs(&base.join("old.txt"), BTreeSet::new());

        let paths = PathSet::new(&base);
        let resolved = resolve_inputs(&paths, &compile(&paths), &state, false);
        assert_eq!(resolved.len(), 1);
        assert!(resolved[0].deleted);
        assert_eq!(resolved[0].rel, "old.txt");
    }

    #[test]
    fn resolve_outputs_lists_matches_without_state() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.class"), "1").unwrap();
        std::fs::write(dir.path().join("a.java"), "1").unwrap();

        let paths = PathSet::new(dir.path()).with_includes(["*.class"]);
        let matched = resolve_outputs(&paths, &compile(&paths));
        assert_eq!(matched, vec![dir.path().join("a.class")]);
    }
}
