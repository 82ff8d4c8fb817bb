//! Tool argument validation against provider-declared JSON schemas.
//!
//! Every schema is validated as if it were closed: object schemas that declare
//! `properties` reject anything they do not declare unless they say otherwise.
//! A schema that does not compile is a provider bug, reported as
//! [`GatewayError::SchemaConfiguration`] rather than a validation failure.

use crate::error::{GatewayError, Result};
use jsonschema::{Draft, JSONSchema};
use serde_json::Value;

/// Whether the schema declares at least one parameter.
///
/// Schemas without properties are treated as "no parameters" and are never validated.
pub fn has_parameters(schema: &Value) -> bool {
    schema
        .get("properties")
        .and_then(Value::as_object)
        .is_some_and(|props| !props.is_empty())
}

/// Return a copy of `schema` with `additionalProperties: false` added to every
/// object schema that declares `properties` and does not set it explicitly.
pub fn close_schema(schema: &Value) -> Value {
    let mut closed = schema.clone();
    close_in_place(&mut closed);
    closed
}

fn close_in_place(schema: &mut Value) {
    let Some(obj) = schema.as_object_mut() else {
        return;
    };

    if let Some(Value::Object(props)) = obj.get_mut("properties") {
        for prop in props.values_mut() {
            close_in_place(prop);
        }
        if !obj.contains_key("additionalProperties") {
            obj.insert("additionalProperties".to_string(), Value::Bool(false));
        }
    }

    if let Some(items) = obj.get_mut("items") {
        match items {
            Value::Array(list) => list.iter_mut().for_each(close_in_place),
            other => close_in_place(other),
        }
    }
}

/// Validate `args` against the parameter schema of `tool`.
///
/// Returns [`GatewayError::Validation`] with every violation joined by `"; "`,
/// or [`GatewayError::SchemaConfiguration`] if the schema itself is invalid.
pub fn validate(tool: &str, schema: &Value, args: &Value) -> Result<()> {
    if !has_parameters(schema) {
        return Ok(());
    }

    let closed = close_schema(schema);
    let compiled = JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(&closed)
        .map_err(|e| GatewayError::SchemaConfiguration {
            tool: tool.to_string(),
            message: e.to_string(),
        })?;

    let result = compiled.validate(args);
    if let Err(errors) = result {
        let messages: Vec<String> = errors
            .map(|e| {
                let path = e.instance_path.to_string();
                if path.is_empty() {
                    e.to_string()
                } else {
                    format!("{}: {}", path, e)
                }
            })
            .collect();
        return Err(GatewayError::Validation(messages.join("; ")));
    }

    Ok(())
}
