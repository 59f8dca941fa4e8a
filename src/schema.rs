// src/schema.rs

use std::fs;
use std::path::{Path, PathBuf};

use schemars::schema_for;

use crate::flow::FlowDoc;

/// Emit the JSON schema for the flow document into `<out_dir>/flow.schema.json`
/// so panel editors can validate before submitting.
pub fn write_schema(out_dir: &Path) -> anyhow::Result<PathBuf> {
    fs::create_dir_all(out_dir)?;
    let schema = schema_for!(FlowDoc);
    let path = out_dir.join("flow.schema.json");
    fs::write(&path, serde_json::to_string_pretty(&schema)?)?;
    Ok(path)
}
