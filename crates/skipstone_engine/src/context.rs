//! The build context: one transient session of the engine.

use crate::error::BuildError;
use crate::manager::BuildManager;
use crate::output::{IncrementalOutputStream, StreamSink};
use crate::pathset::{PathSet, Selector};
use crate::resolver;
use crate::state::{input_matches_any, BuildState};
use skipstone_common::{normalize_path, Digester};
use skipstone_diagnostics::{Message, Severity};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::debug;

/// Lifecycle of a context: open, then exactly one of committed or closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Open,
    Committed,
    Closed,
}

/// The mutable working state of a context, shared with the output streams it
/// hands out and guarded by one mutex so multi-threaded generators can feed
/// a single context.
pub(crate) struct ContextInner {
    phase: Phase,
    configuration: Option<Vec<u8>>,
    deleted_inputs: BTreeSet<PathBuf>,
    added_outputs: BTreeMap<PathBuf, BTreeSet<PathBuf>>,
    referenced_inputs: BTreeMap<PathBuf, BTreeSet<PathBuf>>,
    pub(crate) modified_outputs: BTreeSet<PathBuf>,
    pub(crate) unmodified_outputs: BTreeSet<PathBuf>,
    queried_sets: HashSet<PathSet>,
    messages: BTreeMap<PathBuf, Vec<Message>>,
}

impl ContextInner {
    pub(crate) fn is_open(&self) -> bool {
        self.phase == Phase::Open
    }
}

/// Registers outputs in a context's working state: each output joins the
/// modified set, and when an input is given, the input→outputs binding.
/// Registering an input with no outputs still marks it as seen this build.
pub(crate) fn register_outputs(
    inner: &mut ContextInner,
    input: Option<&Path>,
    outputs: impl IntoIterator<Item = PathBuf>,
) {
    let outputs: Vec<PathBuf> = outputs.into_iter().map(|o| normalize_path(&o)).collect();
    if let Some(input) = input {
        let bound = inner
            .added_outputs
            .entry(normalize_path(input))
            .or_default();
        bound.extend(outputs.iter().cloned());
    }
    inner.modified_outputs.extend(outputs);
}

/// One build session against one output directory and builder id.
///
/// A context accumulates tentative registrations (outputs, referenced
/// inputs, messages) while the client processes the dirty inputs. A
/// [`commit`](Self::commit) reconciles the filesystem and persists the
/// state; a [`close`](Self::close) without commit destroys the state so the
/// next build is full. Dropping an open context is equivalent to closing it.
pub struct BuildContext {
    manager: BuildManager,
    state: Arc<Mutex<BuildState>>,
    output_dir: PathBuf,
    full_build: bool,
    start: Instant,
    inner: Arc<Mutex<ContextInner>>,
}

impl std::fmt::Debug for BuildContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildContext")
            .field("output_dir", &self.output_dir)
            .field("full_build", &self.full_build)
            .finish()
    }
}

impl BuildContext {
    pub(crate) fn new(
        manager: BuildManager,
        output_dir: PathBuf,
        state: Arc<Mutex<BuildState>>,
        full_build: bool,
    ) -> Self {
        Self {
            manager,
            state,
            output_dir,
            full_build,
            start: Instant::now(),
            inner: Arc::new(Mutex::new(ContextInner {
                phase: Phase::Open,
                configuration: None,
                deleted_inputs: BTreeSet::new(),
                added_outputs: BTreeMap::new(),
                referenced_inputs: BTreeMap::new(),
                modified_outputs: BTreeSet::new(),
                unmodified_outputs: BTreeSet::new(),
                queried_sets: HashSet::new(),
                messages: BTreeMap::new(),
            })),
        }
    }

    pub(crate) fn inner_handle(&self) -> &Arc<Mutex<ContextInner>> {
        &self.inner
    }

    fn guard_open(inner: &ContextInner) -> Result<(), BuildError> {
        match inner.phase {
            Phase::Open => Ok(()),
            Phase::Committed => Err(BuildError::IllegalState {
                reason: "build context has already been committed",
            }),
            Phase::Closed => Err(BuildError::IllegalState {
                reason: "build context has already been closed",
            }),
        }
    }

    /// The canonical output directory this context updates.
    pub fn output_directory(&self) -> &Path {
        &self.output_dir
    }

    /// Whether this context was opened as a full build.
    pub fn is_full_build(&self) -> bool {
        self.full_build
    }

    /// Creates a fresh fingerprint accumulator for configuration digests.
    pub fn new_digester(&self) -> Result<Digester, BuildError> {
        Self::guard_open(&self.inner.lock().unwrap())?;
        Ok(Digester::new())
    }

    /// Looks up an opaque user value persisted by the previous build.
    ///
    /// On a full build all previously saved user data is gone.
    pub fn value(&self, key: &[u8]) -> Result<Option<Vec<u8>>, BuildError> {
        Self::guard_open(&self.inner.lock().unwrap())?;
        Ok(self.state.lock().unwrap().value(key).map(|v| v.to_vec()))
    }

    /// Stores an opaque user value for reuse during a future incremental
    /// build.
    pub fn set_value(&self, key: &[u8], value: &[u8]) -> Result<(), BuildError> {
        Self::guard_open(&self.inner.lock().unwrap())?;
        self.state
            .lock()
            .unwrap()
            .set_value(key.to_vec(), value.to_vec());
        Ok(())
    }

    /// Stores the configuration digest for this build and reports whether it
    /// differs from the committed one.
    ///
    /// A `true` result upgrades every subsequent
    /// [`get_inputs`](Self::get_inputs) call to full-build behavior.
    pub fn set_configuration(&self, digest: &[u8]) -> Result<bool, BuildError> {
        let mut inner = self.inner.lock().unwrap();
        Self::guard_open(&inner)?;
        inner.configuration = Some(digest.to_vec());
        Ok(self.state.lock().unwrap().is_configuration_changed(digest))
    }

    /// Determines the inputs matched by `paths` that require processing.
    ///
    /// Returned paths are relative to the path set's base directory. Inputs
    /// that vanished since the last build are recorded for cleanup at commit
    /// and not returned. Every returned input is marked as seen this build,
    /// so committing without registering outputs for it deletes its previous
    /// outputs.
    pub fn get_inputs(&self, paths: &PathSet) -> Result<Vec<String>, BuildError> {
        let selector = Selector::compile(paths)?;
        let mut inner = self.inner.lock().unwrap();
        Self::guard_open(&inner)?;
        inner.queried_sets.insert(paths.clone());

        let state = self.state.lock().unwrap();
        let full_build = self.full_build
            || inner
                .configuration
                .as_deref()
                .is_some_and(|digest| state.is_configuration_changed(digest));
        let resolved = resolver::resolve_inputs(paths, &selector, &state, full_build);
        drop(state);

        let mut inputs = Vec::new();
        for path in resolved {
            let file = paths.base_dir().join(&path.rel);
            if path.deleted {
                inner.deleted_inputs.insert(file);
            } else {
                inner.added_outputs.entry(file).or_default();
                inputs.push(path.rel);
            }
        }
        Ok(inputs)
    }

    /// Opens a write-through-compare stream to `output`.
    ///
    /// On close the stream reports into this context: a byte-identical write
    /// leaves the file untouched and lands in the unmodified set.
    pub fn new_output_stream(&self, output: &Path) -> Result<IncrementalOutputStream, BuildError> {
        Self::guard_open(&self.inner.lock().unwrap())?;
        Ok(IncrementalOutputStream::new(
            normalize_path(output),
            StreamSink::Context(Arc::clone(&self.inner)),
        ))
    }

    /// Registers one output produced from `input`, or from no particular
    /// input when `input` is `None` (aggregated outputs).
    pub fn add_output(&self, input: Option<&Path>, output: &Path) -> Result<(), BuildError> {
        self.add_outputs(input, [output])
    }

    /// Registers several outputs produced from `input`.
    pub fn add_outputs<I, P>(&self, input: Option<&Path>, outputs: I) -> Result<(), BuildError>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut inner = self.inner.lock().unwrap();
        Self::guard_open(&inner)?;
        register_outputs(
            &mut inner,
            input,
            outputs.into_iter().map(|o| o.as_ref().to_path_buf()),
        );
        Ok(())
    }

    /// Registers every file matched by `outputs` as produced from `input`.
    pub fn add_matched_outputs(
        &self,
        input: Option<&Path>,
        outputs: &PathSet,
    ) -> Result<(), BuildError> {
        let matched = self.manager.resolve_outputs(outputs)?;
        self.add_outputs(input, matched)
    }

    /// Records files whose content feeds into the processing of `input`,
    /// such as transitive includes. A change to any referenced file marks
    /// `input` as requiring processing in the next build.
    pub fn add_referenced_inputs<I, P>(&self, input: &Path, referenced: I) -> Result<(), BuildError>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut inner = self.inner.lock().unwrap();
        Self::guard_open(&inner)?;
        let set = inner
            .referenced_inputs
            .entry(normalize_path(input))
            .or_default();
        for path in referenced {
            set.insert(normalize_path(path.as_ref()));
        }
        Ok(())
    }

    /// Records a message about a problem with `input`.
    ///
    /// [`clear_messages`](Self::clear_messages) must have been called for
    /// `input` earlier in this build; persisted messages from the previous
    /// build stay authoritative until explicitly reset. The message is also
    /// routed to the manager's diagnostic hooks immediately.
    #[allow(clippy::too_many_arguments)]
    pub fn add_message(
        &self,
        input: &Path,
        line: i32,
        column: i32,
        text: &str,
        severity: Severity,
        cause: Option<String>,
    ) -> Result<(), BuildError> {
        let input = normalize_path(input);
        {
            let mut inner = self.inner.lock().unwrap();
            Self::guard_open(&inner)?;
            let Some(messages) = inner.messages.get_mut(&input) else {
                return Err(BuildError::IllegalState {
                    reason: "add_message without prior clear_messages",
                });
            };
            messages.push(Message::new(line, column, text, severity, cause.clone()));
        }
        self.manager
            .listener()
            .add_message(&input, line, column, text, severity, cause.as_deref());
        Ok(())
    }

    /// Resets the messages of `input`, in this context and in the persisted
    /// state, and arms [`add_message`](Self::add_message) for it.
    pub fn clear_messages(&self, input: &Path) -> Result<(), BuildError> {
        let input = normalize_path(input);
        {
            let mut inner = self.inner.lock().unwrap();
            Self::guard_open(&inner)?;
            self.state.lock().unwrap().clear_messages(&input);
            inner.messages.insert(input.clone(), Vec::new());
        }
        self.manager.listener().clear_messages(&input);
        Ok(())
    }

    /// Commits the build: reconciles obsolete and orphaned outputs,
    /// persists the state, notifies listeners, replays surviving messages,
    /// and fails with [`BuildError::BuildFailed`] when error-severity
    /// messages remain for any selected input.
    ///
    /// Committing twice is a no-op; committing after [`close`](Self::close)
    /// is an error.
    pub fn commit(&self) -> Result<(), BuildError> {
        let mut guard = self.inner.lock().unwrap();
        match guard.phase {
            Phase::Closed => {
                return Err(BuildError::IllegalState {
                    reason: "commit() after close()",
                })
            }
            Phase::Committed => return Ok(()),
            Phase::Open => guard.phase = Phase::Committed,
        }
        let inner = &mut *guard;

        // Outputs the compare streams proved identical were never really
        // produced.
        inner.modified_outputs = inner
            .modified_outputs
            .difference(&inner.unmodified_outputs)
            .cloned()
            .collect();
        let produced = inner.modified_outputs.len();

        let mut state = self.state.lock().unwrap();
        state.set_configuration(inner.configuration.clone());

        let mut deleted_obsolete = 0;
        for (input, outputs) in &inner.added_outputs {
            let referenced = inner
                .referenced_inputs
                .get(input)
                .cloned()
                .unwrap_or_default();
            state.set_referenced_inputs(input, referenced);
            let obsolete = state.set_outputs(input, outputs.clone());
            deleted_obsolete += delete_superfluous(&obsolete, "obsolete");
            inner.modified_outputs.extend(obsolete);
        }

        // Deepest paths first, so a deleted directory's files are removed
        // before the directory itself.
        let mut deleted_orphaned = 0;
        for input in inner.deleted_inputs.iter().rev() {
            let orphaned = state.remove_input(input);
            deleted_orphaned += delete_superfluous(&orphaned, "orphaned");
            inner.modified_outputs.extend(orphaned);
        }

        state.cleanup_referenced_inputs();

        let old_messages = state.merge_messages(&inner.messages);

        if let Err(e) = state.save() {
            tracing::warn!(
                state_file = %state.state_file().display(),
                error = %e,
                "could not persist incremental build state"
            );
        }

        if !inner.modified_outputs.is_empty() {
            self.manager.listener().output_updated(&inner.modified_outputs);
        }

        debug!(
            produced,
            deleted_obsolete,
            deleted_orphaned,
            millis = self.start.elapsed().as_millis() as u64,
            "build committed"
        );

        let mut selected_sets = Vec::with_capacity(inner.queried_sets.len());
        for paths in &inner.queried_sets {
            selected_sets.push((paths.clone(), Selector::compile(paths)?));
        }

        // Replay messages for selected inputs that were not touched this
        // build; touched inputs already routed theirs live.
        for (input, messages) in &old_messages {
            if inner.messages.contains_key(input) {
                continue;
            }
            if !input_matches_any(input, &selected_sets) {
                continue;
            }
            for message in messages {
                self.manager.listener().log_message(
                    input,
                    message.line,
                    message.column,
                    &message.text,
                    message.severity,
                    message.cause.as_deref(),
                );
            }
        }

        let errors = state.selected_error_count(&selected_sets);
        if errors > 0 {
            return Err(BuildError::BuildFailed { errors });
        }
        Ok(())
    }

    /// Closes the context. Without a preceding commit this destroys the
    /// persisted state, so the next build is full. After a commit this is a
    /// no-op.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.phase == Phase::Open {
            let state_file = self
                .state
                .lock()
                .unwrap()
                .state_file()
                .to_path_buf();
            self.manager.destroy(&state_file);
            inner.phase = Phase::Closed;
        }
    }
}

impl Drop for BuildContext {
    fn drop(&mut self) {
        self.close();
    }
}

/// Deletes obsolete or orphaned outputs, ignoring files already gone.
/// Returns how many were actually deleted.
fn delete_superfluous(outputs: &BTreeSet<PathBuf>, kind: &str) -> usize {
    let mut deleted = 0;
    for output in outputs {
        let result = if output.is_dir() {
            std::fs::remove_dir(output)
        } else {
            std::fs::remove_file(output)
        };
        match result {
            Ok(()) => {
                deleted += 1;
                debug!(output = %output.display(), kind, "deleted superfluous output");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                debug!(output = %output.display(), kind, error = %e, "could not delete output");
            }
        }
    }
    deleted
}
