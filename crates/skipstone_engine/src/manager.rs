//! The build manager: state cache, context factory, and diagnostic routing.

use crate::context::{register_outputs, BuildContext, ContextInner};
use crate::error::BuildError;
use crate::output::{IncrementalOutputStream, StreamSink};
use crate::pathset::{PathSet, Selector};
use crate::resolver;
use crate::state::BuildState;
use skipstone_common::{normalize_path, Digest};
use skipstone_diagnostics::{format_message, Severity};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, error, warn};

/// Integration hooks injected into a [`BuildManager`].
///
/// The defaults turn messages into log records and ignore everything else;
/// IDE-like integrators override these to surface markers, refresh views,
/// or force full builds.
pub trait BuildListener: Send + Sync {
    /// Decides whether the context for `output_dir` starts as a full build.
    fn is_full_build(&self, _output_dir: &Path) -> bool {
        false
    }

    /// Called for every message as it is added during a build.
    #[allow(clippy::too_many_arguments)]
    fn add_message(
        &self,
        file: &Path,
        line: i32,
        column: i32,
        text: &str,
        severity: Severity,
        cause: Option<&str>,
    ) {
        let rendered = format_message(file, line, column, text, cause);
        match severity {
            Severity::Warning => warn!("{rendered}"),
            Severity::Error => error!("{rendered}"),
        }
    }

    /// Called when a commit replays a persisted message from an earlier
    /// build for an input that was not reprocessed.
    #[allow(clippy::too_many_arguments)]
    fn log_message(
        &self,
        file: &Path,
        line: i32,
        column: i32,
        text: &str,
        severity: Severity,
        cause: Option<&str>,
    ) {
        self.add_message(file, line, column, text, severity, cause);
    }

    /// Called when the messages of `file` are reset.
    fn clear_messages(&self, _file: &Path) {}

    /// Called after a commit with every output that was created, rewritten,
    /// or deleted, and for manager-routed writes outside any live context.
    fn output_updated(&self, _outputs: &BTreeSet<PathBuf>) {}
}

/// The default listener: log-only diagnostics, never a full build.
pub struct LogListener;

impl BuildListener for LogListener {}

struct ManagerInner {
    listener: Arc<dyn BuildListener>,
    /// Live build states by state-file path. Weak: the owning context is the
    /// strong holder; purged on every lookup. Per-process advisory only:
    /// cross-process modification of the underlying file is not detected
    /// here, only at save time.
    states: Mutex<HashMap<PathBuf, Weak<Mutex<BuildState>>>>,
    /// Live contexts by canonical output directory, for routing output
    /// registrations made without direct context access. Reverse iteration
    /// finds the innermost matching directory first.
    contexts: Mutex<BTreeMap<PathBuf, Weak<Mutex<ContextInner>>>>,
}

/// Factory and registry for build contexts.
///
/// Cheap to clone; clones share the state cache, the context registry, and
/// the listener hooks.
#[derive(Clone)]
pub struct BuildManager {
    inner: Arc<ManagerInner>,
}

impl Default for BuildManager {
    fn default() -> Self {
        Self::new()
    }
}

impl BuildManager {
    /// Creates a manager with the default [`LogListener`] hooks.
    pub fn new() -> Self {
        Self::with_listener(Arc::new(LogListener))
    }

    /// Creates a manager with custom integration hooks.
    pub fn with_listener(listener: Arc<dyn BuildListener>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                listener,
                states: Mutex::new(HashMap::new()),
                contexts: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    pub(crate) fn listener(&self) -> &dyn BuildListener {
        &*self.inner.listener
    }

    /// Creates a build context for `output_dir`.
    ///
    /// The state file lives under `state_dir`, named from digests of the
    /// canonical output directory and `builder_id`, so every
    /// `(output directory, builder)` pair gets its own state. The listener's
    /// `is_full_build` hook decides whether prior state is honored.
    pub fn new_context(
        &self,
        output_dir: &Path,
        state_dir: &Path,
        builder_id: &str,
    ) -> Result<BuildContext, BuildError> {
        if builder_id.is_empty() {
            return Err(BuildError::InvalidArgument {
                reason: "builder id not specified",
            });
        }

        let output_dir = normalize_path(output_dir);
        let state_file = state_file_path(state_dir, &output_dir, builder_id);
        let full_build = self.inner.listener.is_full_build(&output_dir);
        let state = self.build_state(state_file, full_build);

        let context = BuildContext::new(self.clone(), output_dir.clone(), state, full_build);
        let mut contexts = self.inner.contexts.lock().unwrap();
        contexts.retain(|_, weak| weak.strong_count() > 0);
        contexts.insert(output_dir, Arc::downgrade(context.inner_handle()));
        Ok(context)
    }

    /// Looks up or loads the build state for `state_file`.
    ///
    /// The same path yields the same live instance, so two contexts over one
    /// state file share it rather than clobbering each other's view.
    fn build_state(&self, state_file: PathBuf, full_build: bool) -> Arc<Mutex<BuildState>> {
        let mut cache = self.inner.states.lock().unwrap();
        cache.retain(|_, weak| weak.strong_count() > 0);

        if let Some(live) = cache.get(&state_file).and_then(Weak::upgrade) {
            if full_build {
                live.lock().unwrap().reset();
            }
            return live;
        }

        let state = if full_build {
            BuildState::new(state_file.clone())
        } else {
            match BuildState::load(&state_file) {
                Ok(state) => state,
                Err(e) => {
                    if state_file.is_file() {
                        warn!(
                            state_file = %state_file.display(),
                            error = %e,
                            "could not load incremental build state, assuming full build"
                        );
                    }
                    BuildState::new(state_file.clone())
                }
            }
        };

        let state = Arc::new(Mutex::new(state));
        cache.insert(state_file, Arc::downgrade(&state));
        state
    }

    /// Removes the state for `state_file` from the cache and deletes the
    /// file itself, forcing the next build to be full.
    pub(crate) fn destroy(&self, state_file: &Path) {
        self.inner.states.lock().unwrap().remove(state_file);
        if let Err(e) = std::fs::remove_file(state_file) {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!(
                    state_file = %state_file.display(),
                    error = %e,
                    "could not delete build state file"
                );
            }
        }
    }

    /// Lists every file matched by `paths` as absolute paths: the selection
    /// scan without the dirtiness predicate.
    pub fn resolve_outputs(&self, paths: &PathSet) -> Result<Vec<PathBuf>, BuildError> {
        let selector = Selector::compile(paths)?;
        Ok(resolver::resolve_outputs(paths, &selector))
    }

    /// Registers an output without direct context access.
    ///
    /// The registration is routed to the innermost live context whose output
    /// directory contains `output`; with no such context the listener's
    /// `output_updated` fires immediately.
    pub fn add_output(&self, input: Option<&Path>, output: &Path) {
        let output = normalize_path(output);
        if let Some(context) = self.route(&output) {
            let mut inner = context.lock().unwrap();
            if inner.is_open() {
                register_outputs(&mut inner, input, [output]);
                return;
            }
        }
        self.inner
            .listener
            .output_updated(&BTreeSet::from([output]));
    }

    /// Opens a write-through-compare stream without direct context access.
    ///
    /// Routed like [`add_output`](Self::add_output): inside a live context
    /// the stream reports into that context, otherwise a modified result is
    /// announced via `output_updated` when the stream closes.
    pub fn new_output_stream(&self, output: &Path) -> IncrementalOutputStream {
        let output = normalize_path(output);
        let sink = match self.route(&output) {
            Some(context) if context.lock().unwrap().is_open() => StreamSink::Context(context),
            _ => StreamSink::Manager(self.clone()),
        };
        IncrementalOutputStream::new(output, sink)
    }

    /// Finds the live context with the deepest output directory containing
    /// `output`, purging dead registry entries along the way.
    fn route(&self, output: &Path) -> Option<Arc<Mutex<ContextInner>>> {
        let mut contexts = self.inner.contexts.lock().unwrap();
        contexts.retain(|_, weak| weak.strong_count() > 0);
        contexts
            .iter()
            .rev()
            .find(|(dir, _)| output.starts_with(dir))
            .and_then(|(_, weak)| weak.upgrade())
    }
}

/// The state file for one `(output directory, builder id)` pair:
/// `state_dir/<hex(digest(output_dir))>-<hex(digest(builder_id))>.ser`.
fn state_file_path(state_dir: &Path, output_dir: &Path, builder_id: &str) -> PathBuf {
    let dir_digest = Digest::from_bytes(output_dir.to_string_lossy().as_bytes());
    let builder_digest = Digest::from_bytes(builder_id.as_bytes());
    normalize_path(state_dir).join(format!("{dir_digest}-{builder_digest}.ser"))
}
