//! Change events and the adapter that normalizes raw content-store notifications.
//!
//! The adapter performs translation only. It never blocks and never touches the
//! dispatch queue; a notification that cannot be translated is dropped with a
//! warning because sequencing is fire-and-forget relative to the mutation.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::path;

/// Kind of property mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Added,
    Changed,
    Removed,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Added => "added",
            Self::Changed => "changed",
            Self::Removed => "removed",
        };
        f.write_str(s)
    }
}

/// Identifies the content-store session that produced a mutation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionHandle {
    /// Workspace the mutation happened in.
    pub workspace: String,
    /// Opaque identifier of the originating session, if the store provides one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl SessionHandle {
    #[must_use]
    pub fn new(workspace: impl Into<String>) -> Self {
        Self {
            workspace: workspace.into(),
            session_id: None,
        }
    }

    #[must_use]
    pub fn with_session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }
}

/// A notification exactly as the content store delivers it.
#[allow(missing_docs)]
#[derive(Debug, Clone)]
pub struct RawNotification {
    pub path: String,
    pub property: Option<String>,
    pub kind: EventKind,
    pub session: SessionHandle,
}

impl RawNotification {
    /// Convenience constructor for a property-level notification.
    #[must_use]
    pub fn property(
        kind: EventKind,
        path: impl Into<String>,
        property: impl Into<String>,
        session: SessionHandle,
    ) -> Self {
        Self {
            path: path.into(),
            property: Some(property.into()),
            kind,
            session,
        }
    }
}

/// A normalized, immutable change event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    path: String,
    property: String,
    kind: EventKind,
    session: SessionHandle,
    observed_at: DateTime<Utc>,
}

impl ChangeEvent {
    /// Absolute, normalized node path.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn property(&self) -> &str {
        &self.property
    }

    #[must_use]
    pub const fn kind(&self) -> EventKind {
        self.kind
    }

    #[must_use]
    pub const fn session(&self) -> &SessionHandle {
        &self.session
    }

    #[must_use]
    pub fn workspace(&self) -> &str {
        &self.session.workspace
    }

    #[must_use]
    pub const fn observed_at(&self) -> DateTime<Utc> {
        self.observed_at
    }
}

/// Translates raw notifications into `ChangeEvent`s.
#[derive(Debug, Default, Clone, Copy)]
pub struct EventSource;

impl EventSource {
    /// Normalizes a notification. Returns `None` for notifications that carry no
    /// usable path or property name.
    #[must_use]
    pub fn normalize(&self, raw: RawNotification) -> Option<Arc<ChangeEvent>> {
        let RawNotification {
            path: raw_path,
            property,
            kind,
            session,
        } = raw;

        if !raw_path.starts_with('/') {
            warn!(path = %raw_path, %kind, "discarding notification with a relative path");
            return None;
        }

        let property = match property.map(|p| p.trim().to_string()) {
            Some(p) if !p.is_empty() => p,
            _ => {
                warn!(path = %raw_path, %kind, "unable to find the property name in {kind} event");
                return None;
            }
        };

        let path = path::normalize(&raw_path);
        trace!(%path, %property, %kind, workspace = %session.workspace, "normalized change event");

        Some(Arc::new(ChangeEvent {
            path,
            property,
            kind,
            session,
            observed_at: Utc::now(),
        }))
    }
}
