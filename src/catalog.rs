//! Versioned snapshot of the tools offered by the provider.
//!
//! The catalog is replaced wholesale on every refresh. Readers take an
//! `Arc<Catalog>` snapshot and never observe a mix of two generations.

use crate::provider::ToolDescriptor;
use crate::schema;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::warn;

/// A tool the agent can invoke.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    pub description: String,
    pub parameter_schema: Value,
}

impl Tool {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameter_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameter_schema,
        }
    }

    /// Whether the tool declares any parameters.
    pub fn has_parameters(&self) -> bool {
        schema::has_parameters(&self.parameter_schema)
    }
}

impl From<ToolDescriptor> for Tool {
    fn from(descriptor: ToolDescriptor) -> Self {
        Self {
            name: descriptor.name,
            description: descriptor.description.unwrap_or_default(),
            parameter_schema: descriptor
                .input_schema
                .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
        }
    }
}

/// One immutable generation of the tool catalog.
#[derive(Debug, Default)]
pub struct Catalog {
    tools: Vec<Arc<Tool>>,
    index: HashMap<String, usize>,
    last_refreshed: Option<DateTime<Utc>>,
    generation: u64,
}

impl Catalog {
    fn build(tools: Vec<Tool>, generation: u64, refreshed_at: Option<DateTime<Utc>>) -> Self {
        let mut catalog = Catalog {
            tools: Vec::with_capacity(tools.len()),
            index: HashMap::with_capacity(tools.len()),
            last_refreshed: refreshed_at,
            generation,
        };

        for tool in tools {
            if catalog.index.contains_key(&tool.name) {
                warn!("Duplicate tool '{}' in provider listing, keeping the first", tool.name);
                continue;
            }
            catalog.index.insert(tool.name.clone(), catalog.tools.len());
            catalog.tools.push(Arc::new(tool));
        }

        catalog
    }

    pub fn get(&self, name: &str) -> Option<Arc<Tool>> {
        self.index.get(name).map(|&i| Arc::clone(&self.tools[i]))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Tools in provider listing order.
    pub fn list(&self) -> Vec<Arc<Tool>> {
        self.tools.clone()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn last_refreshed(&self) -> Option<DateTime<Utc>> {
        self.last_refreshed
    }

    /// Generation counter; 0 means the catalog was never loaded.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Shared slot holding the current catalog generation.
#[derive(Debug, Default)]
pub struct CatalogHandle {
    current: RwLock<Arc<Catalog>>,
}

impl CatalogHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current generation, consistent for as long as the caller holds it.
    pub fn snapshot(&self) -> Arc<Catalog> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<Tool>> {
        self.snapshot().get(name)
    }

    pub fn list(&self) -> Vec<Arc<Tool>> {
        self.snapshot().list()
    }

    pub fn names(&self) -> Vec<String> {
        self.snapshot().names().into_iter().map(str::to_string).collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    pub fn last_refreshed(&self) -> Option<DateTime<Utc>> {
        self.snapshot().last_refreshed()
    }

    pub fn generation(&self) -> u64 {
        self.snapshot().generation()
    }

    /// Install a new generation built from `tools`.
    pub(crate) fn replace(&self, tools: Vec<Tool>) -> Arc<Catalog> {
        let mut slot = self.current.write().unwrap_or_else(|e| e.into_inner());
        let next = Arc::new(Catalog::build(tools, slot.generation + 1, Some(Utc::now())));
        *slot = Arc::clone(&next);
        next
    }

    /// Install an empty generation.
    pub(crate) fn clear(&self) {
        let mut slot = self.current.write().unwrap_or_else(|e| e.into_inner());
        let generation = slot.generation + 1;
        *slot = Arc::new(Catalog::build(Vec::new(), generation, None));
    }
}
