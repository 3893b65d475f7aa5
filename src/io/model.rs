//! Read/write fitted models as JSON.
//!
//! The file is the serde representation of [`FittedModel`] wrapped with a
//! small header, so a model fitted once can be reloaded to produce centiles
//! for new ages without refitting.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{FitError, Result};
use crate::fit::FittedModel;

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ModelFile {
    tool: String,
    version: u32,
    model: FittedModel,
}

pub fn model_to_json(model: &FittedModel) -> Result<String> {
    serde_json::to_string_pretty(&wrap(model))
        .map_err(|e| FitError::Serialization(format!("failed to encode model: {e}")))
}

pub fn model_from_json(text: &str) -> Result<FittedModel> {
    let file: ModelFile = serde_json::from_str(text)
        .map_err(|e| FitError::Serialization(format!("invalid model JSON: {e}")))?;
    unwrap_file(file)
}

/// Write a model JSON file.
pub fn write_model_json(path: &Path, model: &FittedModel) -> Result<()> {
    let file = File::create(path)
        .map_err(|e| FitError::Io(format!("failed to create model JSON '{}': {e}", path.display())))?;
    serde_json::to_writer_pretty(BufWriter::new(file), &wrap(model))
        .map_err(|e| FitError::Serialization(format!("failed to write model JSON: {e}")))
}

/// Read a model JSON file.
pub fn read_model_json(path: &Path) -> Result<FittedModel> {
    let file = File::open(path)
        .map_err(|e| FitError::Io(format!("failed to open model JSON '{}': {e}", path.display())))?;
    let parsed: ModelFile = serde_json::from_reader(BufReader::new(file))
        .map_err(|e| FitError::Serialization(format!("invalid model JSON: {e}")))?;
    unwrap_file(parsed)
}

fn wrap(model: &FittedModel) -> ModelFile {
    ModelFile {
        tool: env!("CARGO_PKG_NAME").to_string(),
        version: FORMAT_VERSION,
        model: model.clone(),
    }
}

fn unwrap_file(file: ModelFile) -> Result<FittedModel> {
    if file.version != FORMAT_VERSION {
        return Err(FitError::Serialization(format!(
            "unsupported model format version {} (expected {FORMAT_VERSION})",
            file.version
        )));
    }
    Ok(file.model)
}
