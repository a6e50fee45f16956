// packages/proclaunch/src/remote/schema.rs
//! Optional JSON-schema checks on launcher frames
//!
//! Supports the subset of JSON Schema the launcher documents use:
//!
//! - structure: `type`, `enum`, `const`, `required`, `properties`,
//!   `additionalProperties`, `items`
//! - combinators: `oneOf`, `anyOf`, `allOf`, `not`
//! - bounds: `minimum`, `maximum`, `exclusiveMinimum`, `exclusiveMaximum`,
//!   `minLength`, `maxLength`, `minItems`, `maxItems`
//! - local references: `$ref` into `definitions` / `$defs`
//!
//! A document using any other keyword is rejected when loaded rather than
//! half-enforced. A frame that fails its schema is either dropped with a
//! warning or closes the connection, depending on [`ValidationMode`].

use crate::utils::config::LauncherSection;
use crate::utils::errors::{LaunchError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use tracing::warn;

/// `$ref` chains deeper than this are treated as cycles
const MAX_DEPTH: usize = 64;

/// Keywords that carry no constraint
const ANNOTATIONS: &[&str] = &[
    "$schema",
    "$id",
    "$comment",
    "title",
    "description",
    "default",
    "examples",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationMode {
    /// Schemas are ignored
    #[default]
    Off,
    /// Invalid frames are dropped
    Warn,
    /// An invalid frame closes the connection
    Close,
}

/// What to do with a frame after validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Drop,
    Close,
}

/// A parsed schema document
#[derive(Debug, Clone)]
pub struct Schema {
    root: Value,
}

impl Schema {
    /// Accept `root` only if every keyword in it is enforced
    pub fn from_value(root: Value) -> Result<Self> {
        if !matches!(root, Value::Object(_) | Value::Bool(_)) {
            return Err(LaunchError::InvalidConfiguration(
                "schema must be an object or a boolean".into(),
            ));
        }
        audit(&root, &root, "#").map_err(LaunchError::InvalidConfiguration)?;
        Ok(Self { root })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_value(serde_json::from_str(&text)?)
    }

    pub fn validate(&self, instance: &Value) -> Result<()> {
        Checker { root: &self.root }
            .check(&self.root, instance, "$", 0)
            .map_err(LaunchError::SchemaViolation)
    }
}

/// Walk a schema document, rejecting what the checker would not enforce
fn audit(root: &Value, schema: &Value, at: &str) -> std::result::Result<(), String> {
    let schema = match schema {
        Value::Bool(_) => return Ok(()),
        Value::Object(schema) => schema,
        other => return Err(format!("{}: expected a schema, found {}", at, other)),
    };

    for (keyword, value) in schema {
        let here = format!("{}/{}", at, keyword);
        match keyword.as_str() {
            k if ANNOTATIONS.contains(&k) => {}
            "type" => {
                let names: Vec<&Value> = match value {
                    Value::Array(names) => names.iter().collect(),
                    name => vec![name],
                };
                for name in names {
                    match name.as_str() {
                        Some(n) if is_type_name(n) => {}
                        _ => return Err(format!("{}: unknown type {}", here, name)),
                    }
                }
            }
            "enum" | "required" => {
                let Value::Array(items) = value else {
                    return Err(format!("{}: expected an array", here));
                };
                if keyword == "required" && !items.iter().all(Value::is_string) {
                    return Err(format!("{}: expected property names", here));
                }
            }
            "const" => {}
            "properties" | "definitions" | "$defs" => {
                let Value::Object(children) = value else {
                    return Err(format!("{}: expected an object", here));
                };
                for (name, child) in children {
                    audit(root, child, &format!("{}/{}", here, name))?;
                }
            }
            "additionalProperties" | "items" | "not" => audit(root, value, &here)?,
            "oneOf" | "anyOf" | "allOf" => {
                let Value::Array(variants) = value else {
                    return Err(format!("{}: expected an array", here));
                };
                for (index, variant) in variants.iter().enumerate() {
                    audit(root, variant, &format!("{}/{}", here, index))?;
                }
            }
            "minimum" | "maximum" | "exclusiveMinimum" | "exclusiveMaximum" => {
                if !value.is_number() {
                    return Err(format!("{}: expected a number", here));
                }
            }
            "minLength" | "maxLength" | "minItems" | "maxItems" => {
                if value.as_u64().is_none() {
                    return Err(format!("{}: expected a non-negative integer", here));
                }
            }
            "$ref" => {
                resolve(root, value)?;
            }
            other => return Err(format!("{}: unsupported keyword '{}'", at, other)),
        }
    }
    Ok(())
}

/// Local reference target (`#/definitions/...`)
fn resolve<'a>(root: &'a Value, reference: &Value) -> std::result::Result<&'a Value, String> {
    let Some(reference) = reference.as_str() else {
        return Err(format!("$ref must be a string, found {}", reference));
    };
    let Some(pointer) = reference.strip_prefix('#') else {
        return Err(format!("only local references are supported: {}", reference));
    };
    root.pointer(pointer)
        .ok_or_else(|| format!("unresolved reference {}", reference))
}

struct Checker<'a> {
    root: &'a Value,
}

impl Checker<'_> {
    fn check(
        &self,
        schema: &Value,
        instance: &Value,
        path: &str,
        depth: usize,
    ) -> std::result::Result<(), String> {
        if depth > MAX_DEPTH {
            return Err(format!("{}: schema references nest too deeply", path));
        }
        let schema = match schema {
            Value::Bool(true) => return Ok(()),
            Value::Bool(false) => return Err(format!("{}: no value is allowed here", path)),
            Value::Object(schema) => schema,
            _ => return Ok(()),
        };

        if let Some(reference) = schema.get("$ref") {
            let target = resolve(self.root, reference)?;
            self.check(target, instance, path, depth + 1)?;
        }

        if let Some(expected) = schema.get("type") {
            let allowed: Vec<&str> = match expected {
                Value::String(name) => vec![name.as_str()],
                Value::Array(names) => names.iter().filter_map(Value::as_str).collect(),
                _ => vec![],
            };
            if !allowed.is_empty() && !allowed.iter().any(|name| has_type(instance, name)) {
                return Err(format!("{}: expected {}", path, allowed.join(" or ")));
            }
        }

        if let Some(Value::Array(options)) = schema.get("enum") {
            if !options.contains(instance) {
                return Err(format!("{}: {} is not one of the allowed values", path, instance));
            }
        }

        if let Some(constant) = schema.get("const") {
            if constant != instance {
                return Err(format!("{}: expected {}", path, constant));
            }
        }

        check_bounds(schema, instance, path)?;

        if let Value::Object(fields) = instance {
            self.check_object(schema, fields, path, depth)?;
        }

        if let (Some(items), Value::Array(elements)) = (schema.get("items"), instance) {
            for (index, element) in elements.iter().enumerate() {
                self.check(items, element, &format!("{}[{}]", path, index), depth + 1)?;
            }
        }

        if let Some(Value::Array(variants)) = schema.get("oneOf") {
            let matching = variants
                .iter()
                .filter(|variant| self.check(variant, instance, path, depth + 1).is_ok())
                .count();
            if matching != 1 {
                return Err(format!(
                    "{}: matches {} of the oneOf alternatives, expected exactly 1",
                    path, matching
                ));
            }
        }

        if let Some(Value::Array(variants)) = schema.get("anyOf") {
            if !variants
                .iter()
                .any(|variant| self.check(variant, instance, path, depth + 1).is_ok())
            {
                return Err(format!("{}: matches none of the anyOf alternatives", path));
            }
        }

        if let Some(Value::Array(variants)) = schema.get("allOf") {
            for variant in variants {
                self.check(variant, instance, path, depth + 1)?;
            }
        }

        if let Some(negated) = schema.get("not") {
            if self.check(negated, instance, path, depth + 1).is_ok() {
                return Err(format!("{}: matches a forbidden schema", path));
            }
        }

        Ok(())
    }

    fn check_object(
        &self,
        schema: &Map<String, Value>,
        fields: &Map<String, Value>,
        path: &str,
        depth: usize,
    ) -> std::result::Result<(), String> {
        if let Some(Value::Array(required)) = schema.get("required") {
            for key in required.iter().filter_map(Value::as_str) {
                if !fields.contains_key(key) {
                    return Err(format!("{}: missing required key '{}'", path, key));
                }
            }
        }

        let properties = match schema.get("properties") {
            Some(Value::Object(properties)) => Some(properties),
            _ => None,
        };

        for (key, value) in fields {
            let field_path = format!("{}.{}", path, key);
            match properties.and_then(|properties| properties.get(key)) {
                Some(property) => self.check(property, value, &field_path, depth + 1)?,
                None => {
                    if let Some(additional) = schema.get("additionalProperties") {
                        self.check(additional, value, &field_path, depth + 1)?;
                    }
                }
            }
        }
        Ok(())
    }
}

fn check_bounds(
    schema: &Map<String, Value>,
    instance: &Value,
    path: &str,
) -> std::result::Result<(), String> {
    let limit = |keyword: &str| schema.get(keyword).and_then(Value::as_f64);

    if let Some(number) = instance.as_f64() {
        if let Some(min) = limit("minimum") {
            if number < min {
                return Err(format!("{}: {} is below the minimum {}", path, number, min));
            }
        }
        if let Some(max) = limit("maximum") {
            if number > max {
                return Err(format!("{}: {} is above the maximum {}", path, number, max));
            }
        }
        if let Some(min) = limit("exclusiveMinimum") {
            if number <= min {
                return Err(format!("{}: {} must be greater than {}", path, number, min));
            }
        }
        if let Some(max) = limit("exclusiveMaximum") {
            if number >= max {
                return Err(format!("{}: {} must be less than {}", path, number, max));
            }
        }
    }

    let length = match instance {
        Value::String(text) => Some((text.chars().count(), "minLength", "maxLength")),
        Value::Array(items) => Some((items.len(), "minItems", "maxItems")),
        _ => None,
    };
    if let Some((len, min_key, max_key)) = length {
        let len = len as u64;
        if let Some(min) = schema.get(min_key).and_then(Value::as_u64) {
            if len < min {
                return Err(format!("{}: length {} is below {} {}", path, len, min_key, min));
            }
        }
        if let Some(max) = schema.get(max_key).and_then(Value::as_u64) {
            if len > max {
                return Err(format!("{}: length {} is above {} {}", path, len, max_key, max));
            }
        }
    }
    Ok(())
}

fn is_type_name(name: &str) -> bool {
    matches!(
        name,
        "object" | "array" | "string" | "number" | "integer" | "boolean" | "null"
    )
}

fn has_type(instance: &Value, name: &str) -> bool {
    match name {
        "object" => instance.is_object(),
        "array" => instance.is_array(),
        "string" => instance.is_string(),
        "number" => instance.is_number(),
        "integer" => instance.is_i64() || instance.is_u64(),
        "boolean" => instance.is_boolean(),
        "null" => instance.is_null(),
        _ => false,
    }
}

/// Per-connection validation policy
#[derive(Debug, Clone, Default)]
pub struct FrameValidator {
    mode: ValidationMode,
    inbound: Option<Schema>,
    outbound: Option<Schema>,
}

impl FrameValidator {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn new(mode: ValidationMode, inbound: Option<Schema>, outbound: Option<Schema>) -> Self {
        Self {
            mode,
            inbound,
            outbound,
        }
    }

    /// Load the schema documents named in the launcher section
    pub fn from_config(section: &LauncherSection) -> Result<Self> {
        if section.validation == ValidationMode::Off {
            return Ok(Self::disabled());
        }
        let inbound = section.inbound_schema.as_deref().map(Schema::load).transpose()?;
        let outbound = section.outbound_schema.as_deref().map(Schema::load).transpose()?;
        Ok(Self::new(section.validation, inbound, outbound))
    }

    pub fn check_inbound(&self, frame: &Value) -> Verdict {
        self.check(self.inbound.as_ref(), frame, "inbound")
    }

    pub fn check_outbound(&self, frame: &Value) -> Verdict {
        self.check(self.outbound.as_ref(), frame, "outbound")
    }

    fn check(&self, schema: Option<&Schema>, frame: &Value, direction: &str) -> Verdict {
        let Some(schema) = schema else {
            return Verdict::Accept;
        };
        match (self.mode, schema.validate(frame)) {
            (ValidationMode::Off, _) | (_, Ok(())) => Verdict::Accept,
            (ValidationMode::Warn, Err(e)) => {
                warn!("Dropping {} frame: {}", direction, e);
                Verdict::Drop
            }
            (ValidationMode::Close, Err(e)) => {
                warn!("Closing connection on {} frame: {}", direction, e);
                Verdict::Close
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn command_schema() -> Schema {
        Schema::from_value(json!({
            "type": "object",
            "oneOf": [
                {"required": ["command"]},
                {"required": ["event"]}
            ],
            "properties": {
                "command": {"enum": ["start", "stop", "write", "set"]},
                "id": {"type": "integer"},
                "data": {"type": "object"}
            },
            "additionalProperties": false
        }))
        .unwrap()
    }

    #[test]
    fn test_accepts_valid_frames() {
        let schema = command_schema();
        assert!(schema
            .validate(&json!({"command": "stop", "id": 1, "data": {"timeout": 500}}))
            .is_ok());
    }

    #[test]
    fn test_rejections() {
        let schema = command_schema();
        for frame in [
            json!([]),
            json!({"command": "reboot", "id": 1}),
            json!({"command": "stop", "id": "one"}),
            json!({"command": "stop", "event": "started", "id": 1}),
            json!({"id": 1}),
            json!({"command": "stop", "id": 1, "extra": 1}),
        ] {
            assert!(
                matches!(schema.validate(&frame), Err(LaunchError::SchemaViolation(_))),
                "accepted {}",
                frame
            );
        }
    }

    #[test]
    fn test_items_and_any_of() {
        let schema = Schema::from_value(json!({
            "type": "array",
            "items": {"anyOf": [{"type": "integer"}, {"type": "null"}]}
        }))
        .unwrap();
        assert!(schema.validate(&json!([1, null, 3])).is_ok());
        assert!(schema.validate(&json!([1, "two"])).is_err());
    }

    #[test]
    fn test_bounds_and_references() {
        let schema = Schema::from_value(json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "definitions": {
                "id": {"type": "integer", "minimum": 0}
            },
            "type": "object",
            "required": ["command", "id"],
            "properties": {
                "command": {"type": "string", "minLength": 1, "maxLength": 16},
                "id": {"$ref": "#/definitions/id"},
                "data": {"not": {"type": "number"}}
            }
        }))
        .unwrap();

        assert!(schema.validate(&json!({"command": "start", "id": 3})).is_ok());
        for frame in [
            json!({"command": "reboot-everything", "id": 1}),
            json!({"command": "stop", "id": -7}),
            json!({"command": "", "id": 1}),
            json!({"command": "stop", "id": 1, "data": 42}),
        ] {
            assert!(schema.validate(&frame).is_err(), "accepted {}", frame);
        }
    }

    #[test]
    fn test_unenforced_keywords_rejected() {
        for document in [
            json!({"properties": {"command": {"pattern": "^[a-z]+$"}}}),
            json!({"format": "uri"}),
            json!({"$ref": "#/definitions/missing"}),
            json!({"$ref": "other.json#/id"}),
            json!({"type": "integer", "minimum": "zero"}),
            json!({"type": "float"}),
        ] {
            assert!(
                matches!(Schema::from_value(document.clone()), Err(LaunchError::InvalidConfiguration(_))),
                "loaded {}",
                document
            );
        }
    }

    #[test]
    fn test_self_reference_is_bounded() {
        let schema = Schema::from_value(json!({"$ref": "#"})).unwrap();
        assert!(schema.validate(&json!(1)).is_err());
    }

    #[test]
    fn test_validator_modes() {
        let bad = json!({"command": "reboot"});

        let warn = FrameValidator::new(ValidationMode::Warn, Some(command_schema()), None);
        assert_eq!(warn.check_inbound(&bad), Verdict::Drop);
        assert_eq!(warn.check_outbound(&bad), Verdict::Accept);

        let close = FrameValidator::new(ValidationMode::Close, Some(command_schema()), None);
        assert_eq!(close.check_inbound(&bad), Verdict::Close);

        let off = FrameValidator::new(ValidationMode::Off, Some(command_schema()), None);
        assert_eq!(off.check_inbound(&bad), Verdict::Accept);
    }

    #[test]
    fn test_load_from_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", json!({"required": ["event"]})).unwrap();

        let mut section = LauncherSection::default();
        section.validation = ValidationMode::Close;
        section.outbound_schema = Some(file.path().to_path_buf());

        let validator = FrameValidator::from_config(&section).unwrap();
        assert_eq!(validator.check_outbound(&json!({"command": "x"})), Verdict::Close);
        assert_eq!(validator.check_outbound(&json!({"event": "x"})), Verdict::Accept);
    }
}
