//! Core identity types for the tapestry runtime
//!
//! Ids are session scoped: every `IdGenerator` draws a random session id and
//! numbers everything it hands out, so ids from different processes never
//! collide while ids from one session stay readable.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Hierarchical identifier, rendered as `!{root}:{segment}:...`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id {
    root: String,
    segments: Vec<String>,
}

impl Id {
    /// Id rooted at `root` with the given path
    pub fn new(root: impl Into<String>, segments: Vec<String>) -> Self {
        Self {
            root: root.into(),
            segments,
        }
    }

    /// Session root this id was generated under
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Last path segment, or the root for a bare id
    pub fn leaf(&self) -> &str {
        self.segments.last().map(String::as_str).unwrap_or(&self.root)
    }

    /// Child id one segment below this one
    pub fn child(&self, segment: impl Into<String>) -> Id {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Id::new(self.root.clone(), segments)
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "!{}", self.root)?;
        for segment in &self.segments {
            write!(f, ":{}", segment)?;
        }
        Ok(())
    }
}

/// Session-scoped id source
///
/// Clones share the same counter.
#[derive(Debug, Clone)]
pub struct IdGenerator {
    session: String,
    next: Arc<AtomicU64>,
}

impl IdGenerator {
    /// Generator for a fresh random session
    pub fn new_session() -> Self {
        let session = Uuid::new_v4().simple().to_string();
        Self::with_session(&session[..12])
    }

    /// Generator with a fixed session id, for reproducible tests
    pub fn with_session(session: impl Into<String>) -> Self {
        Self {
            session: session.into(),
            next: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    /// A new arc id named `name`
    pub fn new_arc_id(&self, name: &str) -> Id {
        Id::new(self.session.clone(), vec![format!("{}{}", name, self.bump())])
    }

    /// A new id below `parent`, named `name` plus a session counter
    pub fn new_child_id(&self, parent: &Id, name: &str) -> Id {
        parent.child(format!("{}{}", name, self.bump()))
    }

    /// A new entity id string scoped to `handle_name`
    pub fn new_entity_id(&self, handle_name: &str) -> String {
        format!("!{}:{}:{}", self.session, handle_name, self.bump())
    }

    fn bump(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new_session()
    }
}

/// Key for callbacks registered on a storage proxy
///
/// One particle may own several handles on the same proxy, so callbacks are
/// keyed by both.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallbackIdentifier {
    /// Handle the callback was registered for
    pub handle_name: String,
    /// Particle (or other namespace) that owns the handle
    pub namespace: Option<String>,
}

impl CallbackIdentifier {
    pub fn new(handle_name: impl Into<String>, namespace: Option<String>) -> Self {
        Self {
            handle_name: handle_name.into(),
            namespace,
        }
    }
}

impl fmt::Display for CallbackIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{}/{}", namespace, self.handle_name),
            None => write!(f, "{}", self.handle_name),
        }
    }
}

/// Store subscription identifier
///
/// Returned when subscribing to a store and used to suppress echoing a
/// proxy's own ops back to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

static SUBSCRIPTION_COUNTER: AtomicU64 = AtomicU64::new(1);

impl SubscriptionId {
    /// Create a new unique subscription ID
    pub fn new() -> Self {
        Self(SUBSCRIPTION_COUNTER.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub:{}", self.0)
    }
}
