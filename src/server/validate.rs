//! Field rules for inbound bodies. The registry trusts what passes here,
//! except for release dates which it checks itself.

use serde_json::{Map, Value};

use super::error::AppError;
use crate::registry::Registration;

pub(crate) const MAX_MODELS: usize = 12;

fn invalid<T>(msg: impl Into<String>) -> Result<T, AppError> {
    Err(AppError::Validation(msg.into()))
}

fn non_negative(name: &str, value: Option<f64>) -> Result<(), AppError> {
    match value {
        Some(v) if !v.is_finite() || v < 0.0 => {
            invalid(format!("{} must be a non-negative number", name))
        }
        _ => Ok(()),
    }
}

pub(crate) fn registration(reg: &Registration) -> Result<(), AppError> {
    if reg.address.trim().is_empty() {
        return invalid("address is required");
    }

    if reg.models.is_empty() || reg.models.len() > MAX_MODELS {
        return invalid(format!("between 1 and {} models are required", MAX_MODELS));
    }

    for (i, model) in reg.models.iter().enumerate() {
        let fields = [
            ("name", &model.name),
            ("backend_id", &model.backend_id),
            ("quantization", &model.quantization),
        ];

        if let Some((field, _)) = fields.iter().find(|(_, value)| value.trim().is_empty()) {
            return invalid(format!("models[{}].{} must not be empty", i, field));
        }

        if model.context_length == 0 {
            return invalid(format!("models[{}].context_length must be positive", i));
        }
    }

    if reg.max_clients == Some(0) {
        return invalid("max_clients must be at least 1");
    }

    non_negative("avg_tokens_per_second", reg.avg_tokens_per_second)?;
    non_negative("vram_gb", reg.vram_gb)?;

    Ok(())
}

pub(crate) fn stats(avg_tokens_per_second: f64) -> Result<(), AppError> {
    non_negative("avg_tokens_per_second", Some(avg_tokens_per_second))
}

/// Blank values are rejected but returned untouched otherwise.
fn required_str<'b>(body: &'b Map<String, Value>, field: &str) -> Result<&'b str, AppError> {
    match body.get(field).and_then(Value::as_str) {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => invalid(format!("{} is required", field)),
    }
}

/// Returns the prompt, verbatim, and the trimmed alias of a completion body.
pub(crate) fn completion(body: &Map<String, Value>) -> Result<(&str, &str), AppError> {
    Ok((
        required_str(body, "prompt")?,
        required_str(body, "model")?.trim(),
    ))
}
