//! Storage keys and the key parser registry
//!
//! Keys render as `protocol://location`. A reference-mode key embeds a
//! backing key and a pointer key:
//!
//! ```text
//! reference-mode://ram:\/\/people-backing/ram:\/\/people
//! ```
//!
//! `\` and `/` inside an embedded key are escaped so the separator between
//! the two halves is the first unescaped `/`.

use crate::error::{StorageError, StorageResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

pub const REFERENCE_MODE_PROTOCOL: &str = "reference-mode";
pub const FOREIGN_PROTOCOL: &str = "foreign";

/// Where a CRDT lives
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum StorageKey {
    /// Any single-location key, e.g. `ram://people`
    Opaque { protocol: String, location: String },
    /// Entities split into a pointer store and a shared backing store
    ReferenceMode(ReferenceModeStorageKey),
    /// Entities owned by a system outside the engine, keyed by schema name
    Foreign(String),
}

/// Backing and pointer halves of a reference-mode key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReferenceModeStorageKey {
    pub backing_key: Box<StorageKey>,
    pub storage_key: Box<StorageKey>,
}

impl StorageKey {
    pub fn new(protocol: impl Into<String>, location: impl Into<String>) -> Self {
        StorageKey::Opaque {
            protocol: protocol.into(),
            location: location.into(),
        }
    }

    /// In-memory key
    pub fn ram(location: impl Into<String>) -> Self {
        Self::new("ram", location)
    }

    pub fn reference_mode(backing: StorageKey, storage: StorageKey) -> Self {
        StorageKey::ReferenceMode(ReferenceModeStorageKey {
            backing_key: Box::new(backing),
            storage_key: Box::new(storage),
        })
    }

    /// Reference-mode key named `name` with both halves on `protocol`
    pub fn reference_mode_for(name: &str, protocol: &str) -> Self {
        Self::reference_mode(
            Self::new(protocol, format!("{}-backing", name)),
            Self::new(protocol, name),
        )
    }

    pub fn foreign(schema_name: impl Into<String>) -> Self {
        StorageKey::Foreign(schema_name.into())
    }

    pub fn protocol(&self) -> &str {
        match self {
            StorageKey::Opaque { protocol, .. } => protocol,
            StorageKey::ReferenceMode(_) => REFERENCE_MODE_PROTOCOL,
            StorageKey::Foreign(_) => FOREIGN_PROTOCOL,
        }
    }

    pub fn is_reference_mode(&self) -> bool {
        matches!(self, StorageKey::ReferenceMode(_))
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageKey::Opaque { protocol, location } => write!(f, "{}://{}", protocol, location),
            StorageKey::ReferenceMode(key) => write!(
                f,
                "{}://{}/{}",
                REFERENCE_MODE_PROTOCOL,
                embed(&key.backing_key.to_string()),
                embed(&key.storage_key.to_string())
            ),
            StorageKey::Foreign(name) => write!(f, "{}://{}", FOREIGN_PROTOCOL, name),
        }
    }
}

impl From<StorageKey> for String {
    fn from(key: StorageKey) -> String {
        key.to_string()
    }
}

impl TryFrom<String> for StorageKey {
    type Error = StorageError;

    fn try_from(value: String) -> StorageResult<Self> {
        StorageKeyParser::new().parse(&value)
    }
}

fn embed(key: &str) -> String {
    key.replace('\\', "\\\\").replace('/', "\\/")
}

/// Split at the first unescaped `/`, unescaping both halves
fn split_embedded(text: &str) -> Option<(String, String)> {
    let mut first = String::new();
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => first.push(chars.next()?),
            '/' => {
                let rest = unescape(chars.as_str())?;
                return Some((first, rest));
            }
            c => first.push(c),
        }
    }
    None
}

fn unescape(text: &str) -> Option<String> {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => out.push(chars.next()?),
            '/' => return None,
            c => out.push(c),
        }
    }
    Some(out)
}

/// Parses the location part of a key for one protocol
pub type KeyParserFn =
    Arc<dyn Fn(&str, &str, &StorageKeyParser) -> StorageResult<StorageKey> + Send + Sync>;

/// Registry of key parsers by protocol
///
/// Starts with `ram`, `memdb`, `volatile`, `reference-mode` and `foreign`.
#[derive(Clone)]
pub struct StorageKeyParser {
    parsers: HashMap<String, KeyParserFn>,
}

impl StorageKeyParser {
    pub fn new() -> Self {
        let mut parser = Self {
            parsers: HashMap::new(),
        };
        parser.reset();
        parser
    }

    /// Register (or replace) the parser for `protocol`
    pub fn register(&mut self, protocol: impl Into<String>, parse: KeyParserFn) {
        self.parsers.insert(protocol.into(), parse);
    }

    /// Forget custom registrations and restore the built-in protocols
    pub fn reset(&mut self) {
        self.parsers.clear();
        for protocol in ["ram", "memdb", "volatile"] {
            self.register(protocol, Arc::new(parse_opaque));
        }
        self.register(REFERENCE_MODE_PROTOCOL, Arc::new(parse_reference_mode));
        self.register(
            FOREIGN_PROTOCOL,
            Arc::new(|_: &str, location: &str, _: &StorageKeyParser| {
                Ok(StorageKey::foreign(location))
            }),
        );
    }

    pub fn is_registered(&self, protocol: &str) -> bool {
        self.parsers.contains_key(protocol)
    }

    pub fn parse(&self, key: &str) -> StorageResult<StorageKey> {
        let (protocol, location) = key.split_once("://").ok_or_else(|| StorageError::InvalidKey {
            key: key.to_string(),
            reason: "missing protocol".to_string(),
        })?;
        let parse = self
            .parsers
            .get(protocol)
            .ok_or_else(|| StorageError::UnknownProtocol(protocol.to_string()))?;
        parse(protocol, location, self)
    }
}

impl Default for StorageKeyParser {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StorageKeyParser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut protocols: Vec<_> = self.parsers.keys().collect();
        protocols.sort();
        f.debug_struct("StorageKeyParser")
            .field("protocols", &protocols)
            .finish()
    }
}

fn parse_opaque(protocol: &str, location: &str, _: &StorageKeyParser) -> StorageResult<StorageKey> {
    if location.is_empty() {
        return Err(StorageError::InvalidKey {
            key: format!("{}://", protocol),
            reason: "empty location".to_string(),
        });
    }
    Ok(StorageKey::new(protocol, location))
}

fn parse_reference_mode(
    _: &str,
    location: &str,
    parser: &StorageKeyParser,
) -> StorageResult<StorageKey> {
    let invalid = |reason: &str| StorageError::InvalidKey {
        key: format!("{}://{}", REFERENCE_MODE_PROTOCOL, location),
        reason: reason.to_string(),
    };
    let (backing, storage) =
        split_embedded(location).ok_or_else(|| invalid("expected <backing>/<storage>"))?;
    let backing = parser.parse(&backing)?;
    let storage = parser.parse(&storage)?;
    if backing.is_reference_mode() || storage.is_reference_mode() {
        return Err(invalid("reference-mode keys cannot be nested"));
    }
    Ok(StorageKey::reference_mode(backing, storage))
}
