//! Typed per-id metadata with interned field keys.
//!
//! Values are a closed sum {string, number, boolean, string-array}. Field
//! names are interned to 32-bit ids by a per-store [`FieldBuilder`]; the
//! mapping is stable for the process lifetime. The table persists as a
//! flat JSON sidecar (`<index>.meta.json`) whose top-level keys are entry
//! ids; the prototype-pollution keys `__proto__`, `constructor`, and
//! `prototype` are rejected on load.

pub mod filter;

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{EngramError, Result};
use crate::paths::validate_path;

pub use filter::{FilterExpr, FilterOp, FilterPredicate, MAX_FILTER_LEAVES};

/// Hard cap on metadata rows per store
pub const MAX_METADATA_ENTRIES: usize = 10_000_000;

/// Field keys that are never accepted from disk or callers
const FORBIDDEN_KEYS: &[&str] = &["__proto__", "constructor", "prototype"];

/// A metadata value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Boolean flag
    Bool(bool),
    /// Numeric attribute
    Number(f64),
    /// Free-form string
    Str(String),
    /// List of strings (tags and the like)
    StrList(Vec<String>),
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

/// A metadata map as callers see it
pub type Metadata = HashMap<String, Value>;

// ============================================================================
// FIELD INTERNING
// ============================================================================

/// Interns field names to sequential 32-bit ids
#[derive(Debug, Default, Clone)]
pub struct FieldBuilder {
    ids: HashMap<String, u32>,
    names: Vec<String>,
}

impl FieldBuilder {
    /// New empty intern table
    pub fn new() -> Self {
        Self::default()
    }

    /// Id for a field name, allocating on first sight
    pub fn intern(&mut self, name: &str) -> Result<u32> {
        if FORBIDDEN_KEYS.contains(&name) {
            return Err(EngramError::validation(format!("forbidden metadata key: {name}")));
        }
        if let Some(&id) = self.ids.get(name) {
            return Ok(id);
        }
        let id = self.names.len() as u32;
        self.ids.insert(name.to_string(), id);
        self.names.push(name.to_string());
        Ok(id)
    }

    /// Id for an already-interned name
    pub fn lookup(&self, name: &str) -> Option<u32> {
        self.ids.get(name).copied()
    }

    /// Name for an id
    pub fn name(&self, id: u32) -> Option<&str> {
        self.names.get(id as usize).map(String::as_str)
    }

    /// Number of interned fields
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// True when no fields are interned
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

// ============================================================================
// STORE
// ============================================================================

/// Side table of per-id typed attributes
#[derive(Debug)]
pub struct MetadataStore {
    fields: FieldBuilder,
    rows: HashMap<String, HashMap<u32, Value>>,
}

impl MetadataStore {
    /// New empty table
    pub fn new() -> Self {
        Self {
            fields: FieldBuilder::new(),
            rows: HashMap::new(),
        }
    }

    /// Row count
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// True when no rows are held
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// The intern table
    pub fn fields(&self) -> &FieldBuilder {
        &self.fields
    }

    /// Replace the metadata for an id
    pub fn set(&mut self, id: &str, metadata: Metadata) -> Result<()> {
        if !self.rows.contains_key(id) && self.rows.len() >= MAX_METADATA_ENTRIES {
            return Err(EngramError::Capacity(format!(
                "metadata store full at {MAX_METADATA_ENTRIES} entries"
            )));
        }
        let mut row = HashMap::with_capacity(metadata.len());
        for (name, value) in metadata {
            let key = self.fields.intern(&name)?;
            row.insert(key, value);
        }
        self.rows.insert(id.to_string(), row);
        Ok(())
    }

    /// Merge keys into an existing row, creating it if absent
    pub fn patch(&mut self, id: &str, patch: Metadata) -> Result<()> {
        if !self.rows.contains_key(id) {
            return self.set(id, patch);
        }
        let mut interned = Vec::with_capacity(patch.len());
        for (name, value) in patch {
            interned.push((self.fields.intern(&name)?, value));
        }
        let row = self.rows.get_mut(id).expect("checked above");
        for (key, value) in interned {
            row.insert(key, value);
        }
        Ok(())
    }

    /// Metadata for an id, with field names restored
    pub fn get(&self, id: &str) -> Option<Metadata> {
        let row = self.rows.get(id)?;
        Some(
            row.iter()
                .filter_map(|(&key, value)| {
                    self.fields.name(key).map(|n| (n.to_string(), value.clone()))
                })
                .collect(),
        )
    }

    /// Drop a row; returns whether it was present
    pub fn remove(&mut self, id: &str) -> bool {
        self.rows.remove(id).is_some()
    }

    /// Evaluate a filter against one id's row
    pub fn matches(&self, id: &str, expr: &FilterExpr) -> bool {
        match self.get(id) {
            Some(meta) => expr.evaluate(&meta),
            None => false,
        }
    }

    /// Write the table as a flat JSON sidecar
    pub fn save(&self, path: &Path) -> Result<()> {
        validate_path(path)?;
        let flat: HashMap<&String, Metadata> = self
            .rows
            .keys()
            .map(|id| (id, self.get(id).unwrap_or_default()))
            .collect();
        let json = serde_json::to_string(&flat)?;
        std::fs::write(path, json).map_err(|e| {
            EngramError::backend(
                format!("write {}: {e}", path.display()),
                "check that the target directory exists and is writable",
            )
        })
    }

    /// Load a sidecar written by [`Self::save`].
    ///
    /// A missing file is not an error and yields an empty table.
    pub fn load(path: &Path) -> Result<Self> {
        validate_path(path)?;
        if !path.exists() {
            return Ok(Self::new());
        }
        let raw = std::fs::read_to_string(path).map_err(|e| {
            EngramError::corrupt(path.display().to_string(), format!("unreadable: {e}"))
        })?;
        let flat: HashMap<String, Metadata> = serde_json::from_str(&raw)
            .map_err(|e| EngramError::corrupt(path.display().to_string(), e.to_string()))?;

        let mut store = Self::new();
        for (id, metadata) in flat {
            for key in metadata.keys() {
                if FORBIDDEN_KEYS.contains(&key.as_str()) {
                    return Err(EngramError::corrupt(
                        path.display().to_string(),
                        format!("forbidden metadata key: {key}"),
                    ));
                }
            }
            store.set(&id, metadata)?;
        }
        Ok(store)
    }
}

impl Default for MetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================
