//! Input/output selection by base directory and glob patterns.

use crate::error::BuildError;
use globset::{GlobBuilder, GlobMatcher};
use skipstone_common::normalize_path;
use std::path::{Path, PathBuf};

/// A selection of filesystem entries below a base directory.
///
/// A relative path matches iff some include pattern matches it (an empty
/// include list matches everything) and no exclude pattern matches it.
/// Patterns use `/` as the separator on every host: `*` and `?` match within
/// one path segment, `**` matches any number of segments. A pattern ending
/// in `/` selects the whole subtree (`sub/` is `sub/**`).
///
/// `PathSet` is a plain value: equality is structural and it can serve as a
/// map key. Pattern compilation happens separately in [`Selector`], so an
/// invalid pattern surfaces when the set is first resolved.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PathSet {
    base_dir: PathBuf,
    includes: Vec<String>,
    excludes: Vec<String>,
    include_files: bool,
    include_directories: bool,
}

impl PathSet {
    /// Creates a path set selecting every file below `base_dir`.
    ///
    /// Defaults: all files included, directories not included.
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: normalize_path(base_dir.as_ref()),
            includes: Vec::new(),
            excludes: Vec::new(),
            include_files: true,
            include_directories: false,
        }
    }

    /// Replaces the include patterns.
    pub fn with_includes<I, S>(mut self, includes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.includes = includes
            .into_iter()
            .map(|p| normalize_pattern(&p.into()))
            .collect();
        self
    }

    /// Replaces the exclude patterns.
    pub fn with_excludes<I, S>(mut self, excludes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excludes = excludes
            .into_iter()
            .map(|p| normalize_pattern(&p.into()))
            .collect();
        self
    }

    /// Sets whether plain files are selected. Defaults to `true`.
    pub fn including_files(mut self, include_files: bool) -> Self {
        self.include_files = include_files;
        self
    }

    /// Sets whether directories are selected. Defaults to `false`.
    pub fn including_directories(mut self, include_directories: bool) -> Self {
        self.include_directories = include_directories;
        self
    }

    /// The normalized absolute base directory of this selection.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// The include patterns; empty means "match all".
    pub fn includes(&self) -> &[String] {
        &self.includes
    }

    /// The exclude patterns; empty means "exclude none".
    pub fn excludes(&self) -> &[String] {
        &self.excludes
    }

    /// Whether plain files are selected.
    pub fn is_including_files(&self) -> bool {
        self.include_files
    }

    /// Whether directories are selected.
    pub fn is_including_directories(&self) -> bool {
        self.include_directories
    }
}

/// Brings a pattern into canonical form: `/` separators, no leading `./`,
/// and a trailing `/` expanded to the whole subtree.
fn normalize_pattern(pattern: &str) -> String {
    let mut pattern = pattern.replace('\\', "/");
    while let Some(rest) = pattern.strip_prefix("./") {
        pattern = rest.to_string();
    }
    if pattern.ends_with('/') {
        pattern.push_str("**");
    }
    pattern
}

/// One compiled include pattern: the full-path matcher plus the per-segment
/// prefix used for the ancestor test.
struct Pattern {
    matcher: GlobMatcher,
    prefix: Vec<PrefixSegment>,
}

enum PrefixSegment {
    /// A `**` segment; everything below this point may match.
    Any,
    /// A literal or wildcard segment matching exactly one path component.
    One(GlobMatcher),
}

impl Pattern {
    fn compile(pattern: &str) -> Result<Self, BuildError> {
        let matcher = compile_glob(pattern)?;
        let mut prefix = Vec::new();
        for segment in pattern.split('/').filter(|s| !s.is_empty()) {
            if segment == "**" {
                prefix.push(PrefixSegment::Any);
            } else {
                prefix.push(PrefixSegment::One(compile_glob(segment)?));
            }
        }
        Ok(Self { matcher, prefix })
    }

    /// Could this pattern match some path strictly below `segments`?
    fn could_match_below(&self, segments: &[&str]) -> bool {
        for (position, segment) in segments.iter().enumerate() {
            match self.prefix.get(position) {
                Some(PrefixSegment::Any) => return true,
                Some(PrefixSegment::One(matcher)) if matcher.is_match(segment) => {}
                _ => return false,
            }
        }
        // Every directory segment matched; descendants can only match if the
        // pattern still has segments left to consume.
        self.prefix.len() > segments.len()
    }
}

fn compile_glob(pattern: &str) -> Result<GlobMatcher, BuildError> {
    GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .map(|glob| glob.compile_matcher())
        .map_err(|source| BuildError::Pattern {
            pattern: pattern.to_string(),
            source,
        })
}

/// The compiled form of a [`PathSet`]'s patterns.
///
/// Compiled once per directory scan or commit; `PathSet` itself stays a
/// cheap hashable value.
pub(crate) struct Selector {
    includes: Vec<Pattern>,
    excludes: Vec<GlobMatcher>,
}

impl Selector {
    pub(crate) fn compile(paths: &PathSet) -> Result<Self, BuildError> {
        let includes = paths
            .includes()
            .iter()
            .map(|p| Pattern::compile(p))
            .collect::<Result<_, _>>()?;
        let excludes = paths
            .excludes()
            .iter()
            .map(|p| compile_glob(p))
            .collect::<Result<_, _>>()?;
        Ok(Self { includes, excludes })
    }

    /// Whether the relative path is selected: some include matches (empty
    /// include list matches all) and no exclude matches.
    pub(crate) fn is_selected(&self, rel: &str) -> bool {
        let included = self.includes.is_empty()
            || self.includes.iter().any(|p| p.matcher.is_match(rel));
        included && !self.excludes.iter().any(|m| m.is_match(rel))
    }

    /// Whether some include pattern could match a path strictly below `rel`.
    ///
    /// A conservative over-approximation: answering `true` merely costs a
    /// subtree walk. An empty include list always answers `true`.
    pub(crate) fn could_select_descendant(&self, rel: &str) -> bool {
        if self.includes.is_empty() {
            return true;
        }
        let segments: Vec<&str> = if rel.is_empty() {
            Vec::new()
        } else {
            rel.split('/').collect()
        };
        self.includes.iter().any(|p| p.could_match_below(&segments))
    }
}
