//! Handler registry: a tree of handlers addressed by dot-separated job types.

use crate::background_job::BackgroundJob;
use crate::events::QueueEvent;
use crate::job::Job;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// Type-erased job handler.
pub type HandlerFn = dyn Fn(Job) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync;
/// Hook receiving every [`QueueEvent`].
pub type EventHook = dyn Fn(QueueEvent, &Job) + Send + Sync;
/// Hook receiving handler errors and failed jobs.
pub type ErrorHook = dyn Fn(&anyhow::Error, &Job) + Send + Sync;
/// Hook awaited when the processing loop shuts down.
pub type ShutdownHook = dyn Fn() -> BoxFuture<'static, ()> + Send + Sync;

/// Names reserved for registry hooks.
///
/// Handlers cannot be registered under these top-level keys and they are never
/// reported as claimable types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservedKey {
    /// [`HandlerRegistry::on_event`]
    EventHook,
    /// [`HandlerRegistry::on_error`]
    ErrorHook,
    /// [`HandlerRegistry::on_shutdown`]
    ShutdownHook,
}

impl ReservedKey {
    /// All reserved keys.
    pub const ALL: [ReservedKey; 3] = [Self::EventHook, Self::ErrorHook, Self::ShutdownHook];

    /// The reserved name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EventHook => "onEvent",
            Self::ErrorHook => "onError",
            Self::ShutdownHook => "onShutdown",
        }
    }

    /// Look up a reserved key by name.
    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|reserved| reserved.as_str() == key)
    }
}

/// A node of the registry tree.
#[derive(Clone)]
pub enum Entry {
    /// A callable leaf.
    Handler(Arc<HandlerFn>),
    /// A namespace holding further entries.
    Namespace(BTreeMap<String, Entry>),
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Handler(_) => f.write_str("Handler(<function>)"),
            Self::Namespace(children) => f.debug_tuple("Namespace").field(children).finish(),
        }
    }
}

/// Maps job types to handlers and holds the lifecycle hooks.
///
/// A job type such as `email.welcome` is resolved by walking the `email`
/// namespace down to its `welcome` handler. If that fails, the whole string is
/// looked up as a single flat key.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    entries: BTreeMap<String, Entry>,
    on_event: Option<Arc<EventHook>>,
    on_error: Option<Arc<ErrorHook>>,
    on_shutdown: Option<Arc<ShutdownHook>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler at a dotted path, creating namespaces on the way.
    ///
    /// If the path runs through an existing handler, the new handler is stored
    /// under the full path as a flat key instead.
    pub fn handler<F, Fut>(mut self, path: &str, handler: F) -> Self
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.insert(path, Entry::Handler(boxed(handler)));
        self
    }

    /// Register a handler under `key` without splitting it on dots.
    pub fn flat<F, Fut>(mut self, key: &str, handler: F) -> Self
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if !is_reserved(key) {
            self.entries
                .insert(key.to_string(), Entry::Handler(boxed(handler)));
        }
        self
    }

    /// Graft the handlers of `registry` under `path`. Its hooks are ignored.
    pub fn namespace(mut self, path: &str, registry: HandlerRegistry) -> Self {
        self.insert(path, Entry::Namespace(registry.entries));
        self
    }

    /// Register a typed [`BackgroundJob`] under its `JOB_TYPE`.
    pub fn register<J: BackgroundJob>(self) -> Self {
        self.handler(J::JOB_TYPE, |job: Job| async move {
            let payload: J = job.payload()?;
            payload.run(&job).await
        })
    }

    /// Set the hook that observes every [`QueueEvent`].
    pub fn on_event(mut self, hook: impl Fn(QueueEvent, &Job) + Send + Sync + 'static) -> Self {
        self.on_event = Some(Arc::new(hook));
        self
    }

    /// Set the hook called whenever a handler errors or a job fails.
    pub fn on_error(
        mut self,
        hook: impl Fn(&anyhow::Error, &Job) + Send + Sync + 'static,
    ) -> Self {
        self.on_error = Some(Arc::new(hook));
        self
    }

    /// Set the hook awaited when the processing loop stops.
    pub fn on_shutdown<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_shutdown = Some(Arc::new(move || hook().boxed()));
        self
    }

    /// Merge `other` into `self`. Entries and hooks of `other` win.
    pub fn merge(&mut self, other: HandlerRegistry) {
        merge_entries(&mut self.entries, other.entries);
        if other.on_event.is_some() {
            self.on_event = other.on_event;
        }
        if other.on_error.is_some() {
            self.on_error = other.on_error;
        }
        if other.on_shutdown.is_some() {
            self.on_shutdown = other.on_shutdown;
        }
    }

    /// Find the handler for `job_type`.
    pub fn resolve(&self, job_type: &str) -> Option<Arc<HandlerFn>> {
        self.resolve_nested(job_type)
            .or_else(|| match self.entries.get(job_type) {
                Some(Entry::Handler(handler)) if !is_reserved(job_type) => Some(handler.clone()),
                _ => None,
            })
    }

    fn resolve_nested(&self, job_type: &str) -> Option<Arc<HandlerFn>> {
        let mut segments = job_type.split('.').peekable();
        if segments.peek().copied().is_some_and(is_reserved) {
            return None;
        }

        let mut current = &self.entries;
        while let Some(segment) = segments.next() {
            match current.get(segment)? {
                Entry::Handler(handler) if segments.peek().is_none() => {
                    return Some(handler.clone());
                }
                Entry::Handler(_) => return None,
                Entry::Namespace(children) => current = children,
            }
        }
        None
    }

    /// Every job type that resolves to a handler, in sorted order.
    pub fn available_types(&self) -> Vec<String> {
        let mut types = Vec::new();
        for (key, entry) in &self.entries {
            if !is_reserved(key) {
                collect_types(key.clone(), entry, &mut types);
            }
        }
        types.sort();
        types
    }

    /// Whether no handlers are registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn event_hook(&self) -> Option<&Arc<EventHook>> {
        self.on_event.as_ref()
    }

    pub(crate) fn error_hook(&self) -> Option<&Arc<ErrorHook>> {
        self.on_error.as_ref()
    }

    pub(crate) fn shutdown_hook(&self) -> Option<&Arc<ShutdownHook>> {
        self.on_shutdown.as_ref()
    }

    fn insert(&mut self, path: &str, entry: Entry) {
        let segments: Vec<&str> = path.split('.').collect();
        if segments.first().copied().is_some_and(is_reserved) {
            warn!(path, "Refusing to register a handler under a reserved hook name");
            return;
        }
        if segments.iter().any(|segment| segment.is_empty()) {
            debug!(path, "Path has empty segments, registering as a flat key");
            self.entries.insert(path.to_string(), entry);
            return;
        }
        if let Err(entry) = insert_nested(&mut self.entries, &segments, entry) {
            debug!(path, "Path runs through a handler, registering as a flat key");
            self.entries.insert(path.to_string(), entry);
        }
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("types", &self.available_types())
            .field("on_event", &self.on_event.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_shutdown", &self.on_shutdown.is_some())
            .finish()
    }
}

fn boxed<F, Fut>(handler: F) -> Arc<HandlerFn>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |job| handler(job).boxed())
}

fn is_reserved(key: &str) -> bool {
    ReservedKey::from_key(key).is_some()
}

/// Returns the entry back if the path is blocked by a handler.
fn insert_nested(
    entries: &mut BTreeMap<String, Entry>,
    segments: &[&str],
    entry: Entry,
) -> Result<(), Entry> {
    match segments {
        [] => Err(entry),
        [last] => {
            merge_entry(entries, (*last).to_string(), entry);
            Ok(())
        }
        [first, rest @ ..] => {
            let node = entries
                .entry((*first).to_string())
                .or_insert_with(|| Entry::Namespace(BTreeMap::new()));
            match node {
                Entry::Namespace(children) => insert_nested(children, rest, entry),
                Entry::Handler(_) => Err(entry),
            }
        }
    }
}

fn merge_entries(into: &mut BTreeMap<String, Entry>, from: BTreeMap<String, Entry>) {
    for (key, entry) in from {
        merge_entry(into, key, entry);
    }
}

/// Namespaces meeting namespaces are merged, anything else replaces.
fn merge_entry(into: &mut BTreeMap<String, Entry>, key: String, entry: Entry) {
    let Entry::Namespace(incoming) = entry else {
        into.insert(key, entry);
        return;
    };
    match into.get_mut(&key) {
        Some(Entry::Namespace(existing)) => merge_entries(existing, incoming),
        _ => {
            into.insert(key, Entry::Namespace(incoming));
        }
    }
}

fn collect_types(path: String, entry: &Entry, out: &mut Vec<String>) {
    match entry {
        Entry::Handler(_) => out.push(path),
        Entry::Namespace(children) => {
            for (key, child) in children {
                collect_types(format!("{path}.{key}"), child, out);
            }
        }
    }
}
