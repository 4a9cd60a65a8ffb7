//! Execution context and the content-store collaborators it bridges to.
//!
//! A job runs against exactly one `ContentSession`. The session is acquired
//! before the sequencer is invoked and is committed by the pipeline only when
//! the sequencer returns successfully; every other exit path (error, panic,
//! early drop) rolls it back when the context is dropped.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::error::ExecutionError;
use crate::event::ChangeEvent;
use crate::job::{Job, JobId};
use crate::path;
use crate::sequencer::SequencerConfig;
use crate::value::{BinaryKey, PropertyValue};

/// Source of sessions against the observed content store.
pub trait ContentStore: Send + Sync {
    /// Opens a session scoped to one workspace.
    fn open_session(&self, workspace: &str) -> Result<Box<dyn ContentSession>, ExecutionError>;
}

/// A unit of work against the content store.
///
/// Writes are staged until `commit`; `rollback` discards them.
pub trait ContentSession: Send {
    /// Reads a property, observing this session's staged writes.
    fn read_property(&self, path: &str, name: &str) -> Result<Option<PropertyValue>, ExecutionError>;

    /// Returns true if the node exists (staged or committed).
    fn node_exists(&self, path: &str) -> Result<bool, ExecutionError>;

    /// Creates the node and any missing ancestors.
    fn ensure_node(&mut self, path: &str) -> Result<(), ExecutionError>;

    /// Sets a property, creating the node if needed.
    fn set_property(&mut self, path: &str, name: &str, value: PropertyValue) -> Result<(), ExecutionError>;

    /// Makes staged writes visible.
    fn commit(self: Box<Self>) -> Result<(), ExecutionError>;

    /// Discards staged writes.
    fn rollback(self: Box<Self>);
}

/// Content-addressed storage for large values.
pub trait BinaryStore: Send + Sync {
    /// Fetches the bytes for a key.
    fn get(&self, key: &BinaryKey) -> Result<Option<Arc<[u8]>>, ExecutionError>;

    /// Stores bytes and returns their key. Storing identical content twice is a no-op.
    fn put(&self, bytes: &[u8]) -> Result<BinaryKey, ExecutionError>;
}

/// Read/write bridge handed to sequencer logic for the duration of one job.
pub struct ExecutionContext<'a> {
    job_id: JobId,
    event: &'a ChangeEvent,
    config: &'a SequencerConfig,
    output_path: &'a str,
    session: Option<Box<dyn ContentSession>>,
    binaries: &'a dyn BinaryStore,
}

impl<'a> ExecutionContext<'a> {
    pub(crate) fn new(job: &'a Job, session: Box<dyn ContentSession>, binaries: &'a dyn BinaryStore) -> Self {
        Self {
            job_id: job.id(),
            event: job.event(),
            config: job.sequencer(),
            output_path: job.output_path(),
            session: Some(session),
            binaries,
        }
    }

    #[must_use]
    pub const fn job_id(&self) -> JobId {
        self.job_id
    }

    /// The change that triggered this job.
    #[must_use]
    pub const fn event(&self) -> &ChangeEvent {
        self.event
    }

    /// Where derived content should be written.
    ///
    /// This is the expanded output template of the matching rule, or the
    /// changed node's own path when the rule has none.
    #[must_use]
    pub const fn output_path(&self) -> &str {
        self.output_path
    }

    /// A configuration property of the running sequencer.
    #[must_use]
    pub fn config_property(&self, name: &str) -> Option<&PropertyValue> {
        self.config.properties().get(name)
    }

    /// Reads the value of the property that changed.
    ///
    /// Fails with `NodeNotFound` when the node itself is gone (for example
    /// after a removal) and `PropertyNotFound` when only the property is.
    pub fn input_value(&self) -> Result<PropertyValue, ExecutionError> {
        let path = self.event.path();
        let property = self.event.property();
        if let Some(value) = self.read_property(path, property)? {
            return Ok(value);
        }
        self.require_node(path)?;
        Err(ExecutionError::PropertyNotFound {
            path: path.to_string(),
            property: property.to_string(),
        })
    }

    /// True if the node exists in this job's session, including nodes
    /// created earlier in the same job.
    pub fn node_exists(&self, path: &str) -> Result<bool, ExecutionError> {
        let path = checked_path(path)?;
        self.session()?.node_exists(&path)
    }

    /// Like [`Self::node_exists`], but a missing node is an error.
    pub fn require_node(&self, path: &str) -> Result<(), ExecutionError> {
        if self.node_exists(path)? {
            Ok(())
        } else {
            Err(ExecutionError::NodeNotFound { path: path::normalize(path) })
        }
    }

    /// Reads the changed property as bytes.
    ///
    /// Binary values are resolved through the binary store; string values are
    /// returned as their UTF-8 bytes.
    pub fn input_bytes(&self) -> Result<Arc<[u8]>, ExecutionError> {
        match self.input_value()? {
            PropertyValue::Binary(key) => self.read_binary(&key),
            PropertyValue::String(s) => Ok(Arc::from(s.into_bytes())),
            other => Err(ExecutionError::Storage {
                message: format!(
                    "property '{}' on {} holds a {} value, not binary content",
                    self.event.property(),
                    self.event.path(),
                    other.type_name()
                ),
            }),
        }
    }

    pub fn read_property(&self, path: &str, name: &str) -> Result<Option<PropertyValue>, ExecutionError> {
        self.session()?.read_property(path, name)
    }

    pub fn read_binary(&self, key: &BinaryKey) -> Result<Arc<[u8]>, ExecutionError> {
        self.binaries
            .get(key)?
            .ok_or_else(|| ExecutionError::BinaryNotFound { key: key.to_string() })
    }

    /// Stores derived binary content and returns a value referencing it.
    pub fn store_binary(&self, bytes: &[u8]) -> Result<PropertyValue, ExecutionError> {
        Ok(PropertyValue::Binary(self.binaries.put(bytes)?))
    }

    /// Creates a derived node (and its ancestors).
    pub fn create_node(&mut self, path: &str) -> Result<(), ExecutionError> {
        let path = checked_path(path)?;
        self.session_mut()?.ensure_node(&path)
    }

    /// Writes a derived property.
    pub fn write_property(
        &mut self,
        path: &str,
        name: &str,
        value: impl Into<PropertyValue>,
    ) -> Result<(), ExecutionError> {
        let path = checked_path(path)?;
        if name.trim().is_empty() {
            return Err(ExecutionError::InvalidPath {
                path,
                reason: "property name may not be blank".to_string(),
            });
        }
        self.session_mut()?.set_property(&path, name, value.into())
    }

    /// Writes a property on the output node.
    pub fn write_output(&mut self, name: &str, value: impl Into<PropertyValue>) -> Result<(), ExecutionError> {
        let path = self.output_path;
        self.write_property(path, name, value)
    }

    pub(crate) fn commit(mut self) -> Result<(), ExecutionError> {
        let session = self.session.take().ok_or(ExecutionError::SessionClosed)?;
        session.commit()
    }

    fn session(&self) -> Result<&dyn ContentSession, ExecutionError> {
        self.session.as_deref().ok_or(ExecutionError::SessionClosed)
    }

    fn session_mut(&mut self) -> Result<&mut (dyn ContentSession + 'static), ExecutionError> {
        self.session.as_deref_mut().ok_or(ExecutionError::SessionClosed)
    }
}

impl Drop for ExecutionContext<'_> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            debug!(job_id = %self.job_id, "rolling back session of unfinished job");
            session.rollback();
        }
    }
}

fn checked_path(path: &str) -> Result<String, ExecutionError> {
    if !path.starts_with('/') {
        return Err(ExecutionError::InvalidPath {
            path: path.to_string(),
            reason: "must be absolute".to_string(),
        });
    }
    Ok(path::normalize(path))
}

type Node = BTreeMap<String, PropertyValue>;
type Workspace = BTreeMap<String, Node>;

#[derive(Debug, Default)]
struct ContentState {
    workspaces: HashMap<String, Workspace>,
}

#[derive(Debug, Default)]
struct ContentInner {
    state: RwLock<ContentState>,
    open_sessions: AtomicUsize,
    commits: AtomicU64,
    rollbacks: AtomicU64,
}

/// Thread-safe in-memory content store.
///
/// Cloning yields another handle to the same content.
#[derive(Debug, Clone, Default)]
pub struct InMemoryContentStore {
    inner: Arc<ContentInner>,
}

impl InMemoryContentStore {
    /// Create a store with a single `default` workspace.
    #[must_use]
    pub fn new() -> Self {
        let store = Self::default();
        store.create_workspace("default");
        store
    }

    pub fn create_workspace(&self, name: &str) {
        if let Ok(mut state) = self.inner.state.write() {
            state.workspaces.entry(name.to_string()).or_insert_with(root_workspace);
        }
    }

    /// Writes a property directly, outside any session.
    pub fn set_property(
        &self,
        workspace: &str,
        path: &str,
        name: &str,
        value: impl Into<PropertyValue>,
    ) -> Result<(), ExecutionError> {
        let path = checked_path(path)?;
        let mut state = self.inner.state.write().map_err(|_| store_err("content.set_property"))?;
        let ws = workspace_mut(&mut state, workspace)?;
        insert_node(ws, &path);
        ws.entry(path).or_default().insert(name.to_string(), value.into());
        Ok(())
    }

    #[must_use]
    pub fn property(&self, workspace: &str, path: &str, name: &str) -> Option<PropertyValue> {
        let state = self.inner.state.read().ok()?;
        state.workspaces.get(workspace)?.get(path)?.get(name).cloned()
    }

    #[must_use]
    pub fn node_exists(&self, workspace: &str, path: &str) -> bool {
        self.inner
            .state
            .read()
            .map(|s| s.workspaces.get(workspace).is_some_and(|ws| ws.contains_key(path)))
            .unwrap_or(false)
    }

    /// Sessions currently open.
    #[must_use]
    pub fn open_sessions(&self) -> usize {
        self.inner.open_sessions.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn commits(&self) -> u64 {
        self.inner.commits.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn rollbacks(&self) -> u64 {
        self.inner.rollbacks.load(Ordering::Relaxed)
    }
}

impl ContentStore for InMemoryContentStore {
    fn open_session(&self, workspace: &str) -> Result<Box<dyn ContentSession>, ExecutionError> {
        let state = self.inner.state.read().map_err(|_| store_err("content.open_session"))?;
        if !state.workspaces.contains_key(workspace) {
            return Err(ExecutionError::SessionUnavailable {
                workspace: workspace.to_string(),
                message: "no such workspace".to_string(),
            });
        }
        drop(state);

        self.inner.open_sessions.fetch_add(1, Ordering::AcqRel);
        Ok(Box::new(InMemorySession {
            inner: Arc::clone(&self.inner),
            workspace: workspace.to_string(),
            staged: Workspace::new(),
            finished: false,
        }))
    }
}

struct InMemorySession {
    inner: Arc<ContentInner>,
    workspace: String,
    staged: Workspace,
    finished: bool,
}

impl InMemorySession {
    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            self.inner.open_sessions.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl ContentSession for InMemorySession {
    fn read_property(&self, path: &str, name: &str) -> Result<Option<PropertyValue>, ExecutionError> {
        if let Some(value) = self.staged.get(path).and_then(|n| n.get(name)) {
            return Ok(Some(value.clone()));
        }
        let state = self.inner.state.read().map_err(|_| store_err("session.read_property"))?;
        Ok(state
            .workspaces
            .get(&self.workspace)
            .and_then(|ws| ws.get(path))
            .and_then(|n| n.get(name))
            .cloned())
    }

    fn node_exists(&self, path: &str) -> Result<bool, ExecutionError> {
        if self.staged.contains_key(path) {
            return Ok(true);
        }
        let state = self.inner.state.read().map_err(|_| store_err("session.node_exists"))?;
        Ok(state
            .workspaces
            .get(&self.workspace)
            .is_some_and(|ws| ws.contains_key(path)))
    }

    fn ensure_node(&mut self, path: &str) -> Result<(), ExecutionError> {
        insert_node(&mut self.staged, path);
        Ok(())
    }

    fn set_property(&mut self, path: &str, name: &str, value: PropertyValue) -> Result<(), ExecutionError> {
        insert_node(&mut self.staged, path);
        self.staged
            .entry(path.to_string())
            .or_default()
            .insert(name.to_string(), value);
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> Result<(), ExecutionError> {
        let staged = std::mem::take(&mut self.staged);
        let result = apply_staged(&self.inner, &self.workspace, staged);
        if result.is_ok() {
            self.inner.commits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.rollbacks.fetch_add(1, Ordering::Relaxed);
        }
        self.finish();
        result
    }

    fn rollback(mut self: Box<Self>) {
        self.staged.clear();
        self.inner.rollbacks.fetch_add(1, Ordering::Relaxed);
        self.finish();
    }
}

impl Drop for InMemorySession {
    fn drop(&mut self) {
        if !self.finished {
            self.inner.rollbacks.fetch_add(1, Ordering::Relaxed);
            self.finish();
        }
    }
}

fn apply_staged(inner: &ContentInner, workspace: &str, staged: Workspace) -> Result<(), ExecutionError> {
    let mut state = inner.state.write().map_err(|_| ExecutionError::CommitFailed {
        message: "content store lock poisoned".to_string(),
    })?;
    let ws = workspace_mut(&mut state, workspace)?;
    for (path, props) in staged {
        ws.entry(path).or_default().extend(props);
    }
    Ok(())
}

fn root_workspace() -> Workspace {
    let mut ws = Workspace::new();
    ws.insert("/".to_string(), Node::new());
    ws
}

fn workspace_mut<'s>(state: &'s mut ContentState, name: &str) -> Result<&'s mut Workspace, ExecutionError> {
    state
        .workspaces
        .get_mut(name)
        .ok_or_else(|| ExecutionError::SessionUnavailable {
            workspace: name.to_string(),
            message: "no such workspace".to_string(),
        })
}

/// Inserts `path` and every missing ancestor.
fn insert_node(ws: &mut Workspace, path: &str) {
    let mut current = String::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        current.push('/');
        current.push_str(segment);
        ws.entry(current.clone()).or_default();
    }
    ws.entry("/".to_string()).or_default();
}

fn store_err(context: &str) -> ExecutionError {
    ExecutionError::Storage {
        message: format!("lock poisoned: {context}"),
    }
}

/// Thread-safe in-memory binary store keyed by content hash.
#[derive(Debug, Default)]
pub struct InMemoryBinaryStore {
    values: RwLock<HashMap<BinaryKey, Arc<[u8]>>>,
}

impl InMemoryBinaryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.read().map(|v| v.len()).unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BinaryStore for InMemoryBinaryStore {
    fn get(&self, key: &BinaryKey) -> Result<Option<Arc<[u8]>>, ExecutionError> {
        let values = self.values.read().map_err(|_| store_err("binary.get"))?;
        Ok(values.get(key).cloned())
    }

    fn put(&self, bytes: &[u8]) -> Result<BinaryKey, ExecutionError> {
        let key = BinaryKey::for_content(bytes);
        let mut values = self.values.write().map_err(|_| store_err("binary.put"))?;
        values.entry(key).or_insert_with(|| Arc::from(bytes));
        Ok(key)
    }
}
