use crate::error::HandleError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// What a handle may do with its storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HandleMode {
    Read,
    Write,
    ReadWrite,
    Query,
    ReadQuery,
    WriteQuery,
    ReadWriteQuery,
}

impl HandleMode {
    pub fn can_read(self) -> bool {
        matches!(
            self,
            HandleMode::Read
                | HandleMode::ReadWrite
                | HandleMode::ReadQuery
                | HandleMode::ReadWriteQuery
        )
    }

    pub fn can_write(self) -> bool {
        matches!(
            self,
            HandleMode::Write
                | HandleMode::ReadWrite
                | HandleMode::WriteQuery
                | HandleMode::ReadWriteQuery
        )
    }

    pub fn can_query(self) -> bool {
        matches!(
            self,
            HandleMode::Query
                | HandleMode::ReadQuery
                | HandleMode::WriteQuery
                | HandleMode::ReadWriteQuery
        )
    }
}

impl fmt::Display for HandleMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HandleContainerType {
    Singleton,
    Collection,
}

impl fmt::Display for HandleContainerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandleContainerType::Singleton => f.write_str("singleton"),
            HandleContainerType::Collection => f.write_str("collection"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HandleDataType {
    Entity,
    Reference,
}

/// Everything needed to pick and build a handle
#[derive(Debug)]
pub struct HandleSpec<S> {
    pub name: String,
    pub mode: HandleMode,
    pub container: HandleContainerType,
    pub data_type: HandleDataType,
    pub entity_spec: Arc<S>,
}

impl<S> HandleSpec<S> {
    /// Validate the combination of mode, container and data type
    pub fn new(
        name: impl Into<String>,
        mode: HandleMode,
        container: HandleContainerType,
        data_type: HandleDataType,
        entity_spec: Arc<S>,
    ) -> Result<Self, HandleError> {
        if container == HandleContainerType::Singleton && mode.can_query() {
            return Err(HandleError::Construction(format!(
                "Singleton Handles do not support mode {}",
                mode
            )));
        }
        Ok(Self {
            name: name.into(),
            mode,
            container,
            data_type,
            entity_spec,
        })
    }
}

impl<S> Clone for HandleSpec<S> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            mode: self.mode,
            container: self.container,
            data_type: self.data_type,
            entity_spec: self.entity_spec.clone(),
        }
    }
}
