// src/bit.rs

use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

/// The node kinds a flow can be composed of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum BitKind {
    Trigger,
    Action,
    Filter,
    Enrich,
    Delay,
    Route,
    Emit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum BitScope {
    Panel,
    Global,
}

/// A registered node-type definition. Immutable once registered; bits are
/// created by an operator action, never mutated at runtime.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Bit {
    pub id: String,
    pub name: String,
    pub kind: BitKind,
    /// JSON-Schema for the node `params` object, if the bit constrains them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<String>,
    pub scope: BitScope,
}

impl Bit {
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: BitKind, scope: BitScope) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind,
            config_schema: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            scope,
        }
    }

    pub fn with_config_schema(mut self, schema: Value) -> Self {
        self.config_schema = Some(schema);
        self
    }

    pub fn with_io(mut self, inputs: Vec<String>, outputs: Vec<String>) -> Self {
        self.inputs = inputs;
        self.outputs = outputs;
        self
    }

    /// Validate a node's `params` against this bit's config schema.
    pub fn validate_params(&self, params: &Value) -> Result<(), String> {
        let Some(schema) = &self.config_schema else {
            return Ok(());
        };
        let validator = jsonschema::validator_for(schema)
            .map_err(|e| format!("invalid config schema: {e}"))?;
        validator.validate(params).map_err(|e| e.to_string())
    }
}

#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    #[error("bit `{0}` is already registered")]
    Duplicate(String),
}

/// Static catalog of bits. Reads are lock-free clones out of a concurrent
/// map; registration is rare and admin-only.
#[derive(Debug, Default)]
pub struct BitRegistry {
    bits: DashMap<String, Bit>,
}

impl BitRegistry {
    pub fn new() -> Self {
        Self { bits: DashMap::new() }
    }

    /// A registry pre-loaded with the builtin catalog every panel gets.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        for bit in builtin_bits() {
            registry
                .register(bit)
                .expect("builtin bit ids are unique");
        }
        registry
    }

    pub fn register(&self, bit: Bit) -> Result<(), RegistryError> {
        match self.bits.entry(bit.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(RegistryError::Duplicate(bit.id)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(bit);
                Ok(())
            }
        }
    }

    pub fn get(&self, bit_id: &str) -> Option<Bit> {
        self.bits.get(bit_id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, bit_id: &str) -> bool {
        self.bits.contains_key(bit_id)
    }

    pub fn list(&self, scope: Option<BitScope>) -> Vec<Bit> {
        let mut out: Vec<Bit> = self
            .bits
            .iter()
            .filter(|entry| scope.is_none_or(|s| entry.value().scope == s))
            .map(|entry| entry.value().clone())
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }
}

fn builtin_bits() -> Vec<Bit> {
    vec![
        Bit::new("Trigger.NewPost", "New wall post", BitKind::Trigger, BitScope::Global)
            .with_io(vec![], vec!["post".into()]),
        Bit::new("Trigger.Manual", "Manual run", BitKind::Trigger, BitScope::Global),
        Bit::new("Action.NHA.Invoke", "Invoke non-human agent", BitKind::Action, BitScope::Global)
            .with_config_schema(json!({
                "type": "object",
                "required": ["agent"],
                "properties": {
                    "agent": { "type": "string" },
                    "payload": {},
                    "text": { "type": "string" }
                }
            }))
            .with_io(vec!["payload".into()], vec!["result_ref".into()]),
        Bit::new("Action.PostComment", "Append a comment to a post", BitKind::Action, BitScope::Global)
            .with_config_schema(json!({
                "type": "object",
                "required": ["post_id", "text"],
                "properties": {
                    "post_id": { "type": "string" },
                    "text": { "type": "string" }
                }
            }))
            .with_io(vec!["post_id".into(), "text".into()], vec!["comment_id".into()]),
        Bit::new("Filter.Match", "Match fields against a predicate", BitKind::Filter, BitScope::Global)
            .with_config_schema(json!({
                "type": "object",
                "required": ["match"],
                "properties": { "match": { "type": "object" } }
            })),
        Bit::new("Enrich.Merge", "Merge fields into the working payload", BitKind::Enrich, BitScope::Global)
            .with_config_schema(json!({
                "type": "object",
                "required": ["with"],
                "properties": { "with": { "type": "object" } }
            })),
        Bit::new("Delay.For", "Pause this branch", BitKind::Delay, BitScope::Global)
            .with_config_schema(json!({
                "type": "object",
                "required": ["ms"],
                "properties": { "ms": { "type": "integer", "minimum": 0 } }
            })),
        Bit::new("Route.ByField", "Pick a branch label from a field value", BitKind::Route, BitScope::Global)
            .with_config_schema(json!({
                "type": "object",
                "required": ["field", "routes"],
                "properties": {
                    "field": { "type": "string" },
                    "routes": { "type": "object" },
                    "default": { "type": "string" }
                }
            })),
        Bit::new("Emit.Event", "Publish an event on the bus", BitKind::Emit, BitScope::Global)
            .with_config_schema(json!({
                "type": "object",
                "required": ["name"],
                "properties": {
                    "name": { "type": "string" },
                    "payload": {}
                }
            })),
    ]
}
