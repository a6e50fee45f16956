// packages/proclaunch/src/runtime/process_info.rs
//! Process configuration record
//!
//! `ProcessInfo` describes one launch: what to run and under which
//! credentials and resource hints. It behaves like a key/value record (see
//! [`ProcessInfo::value`] / [`ProcessInfo::set_value`]) so that matchers can
//! key on arbitrary attributes, while the recognized fields stay strongly
//! typed. Unrecognized keys are kept in [`ProcessInfo::extra`].

use crate::utils::errors::{LaunchError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Recognized keys
pub mod keys {
    pub const IDENTIFIER: &str = "identifier";
    pub const PROGRAM: &str = "program";
    pub const ARGUMENTS: &str = "arguments";
    pub const ENVIRONMENT: &str = "environment";
    pub const WORKING_DIRECTORY: &str = "workingDirectory";
    pub const UID: &str = "uid";
    pub const GID: &str = "gid";
    pub const UMASK: &str = "umask";
    pub const DROP_CAPABILITIES: &str = "dropCapabilities";
    pub const PRIORITY: &str = "priority";
    pub const OOM_ADJUSTMENT: &str = "oomAdjustment";
    pub const START_OUTPUT_PATTERN: &str = "startOutputPattern";
}

/// Raw bytes carried in JSON
///
/// Serialized as a string when the bytes are valid UTF-8, otherwise as an
/// array of byte values, so binary payloads survive the wire unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ByteString(pub Vec<u8>);

impl ByteString {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for ByteString {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for ByteString {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl From<&str> for ByteString {
    fn from(text: &str) -> Self {
        Self(text.as_bytes().to_vec())
    }
}

impl Serialize for ByteString {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match std::str::from_utf8(&self.0) {
            Ok(text) => serializer.serialize_str(text),
            Err(_) => serializer.collect_seq(self.0.iter()),
        }
    }
}

impl<'de> Deserialize<'de> for ByteString {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Text(String),
            Raw(Vec<u8>),
        }

        Ok(match Repr::deserialize(deserializer)? {
            Repr::Text(text) => ByteString(text.into_bytes()),
            Repr::Raw(bytes) => ByteString(bytes),
        })
    }
}

/// Description of a process to launch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInfo {
    /// Caller-assigned identifier, used only for reporting
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,

    /// Program to execute (resolved through `PATH` when not absolute)
    #[serde(default)]
    pub program: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<String>,

    /// Merged over the inherited environment
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub umask: Option<u32>,

    /// Capability bounding-set bits to drop before exec (Linux)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drop_capabilities: Option<u64>,

    /// Nice value, -20 (highest) to 19 (lowest)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,

    /// Linux `oom_score_adj`, -1000 to 1000
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oom_adjustment: Option<i32>,

    /// The process only counts as started once this appears on stdout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_output_pattern: Option<ByteString>,

    /// Any other attributes, preserved verbatim
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl ProcessInfo {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    pub fn with_arguments<I, S>(mut self, arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments = arguments.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn with_working_directory(mut self, dir: impl Into<String>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_oom_adjustment(mut self, oom: i32) -> Self {
        self.oom_adjustment = Some(oom);
        self
    }

    pub fn with_start_output_pattern(mut self, pattern: impl Into<Vec<u8>>) -> Self {
        self.start_output_pattern = Some(ByteString(pattern.into()));
        self
    }

    pub fn start_output_pattern(&self) -> Option<&[u8]> {
        self.start_output_pattern
            .as_ref()
            .map(ByteString::as_bytes)
            .filter(|pattern| !pattern.is_empty())
    }

    /// All attributes as a JSON object
    pub fn to_map(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }

    pub fn from_map(map: Map<String, Value>) -> Result<Self> {
        serde_json::from_value(Value::Object(map))
            .map_err(|e| LaunchError::InvalidConfiguration(e.to_string()))
    }

    pub fn keys(&self) -> Vec<String> {
        self.to_map().keys().cloned().collect()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.to_map().contains_key(key)
    }

    pub fn value(&self, key: &str) -> Option<Value> {
        self.to_map().remove(key)
    }

    /// Set a single attribute; a value of the wrong type for a recognized
    /// key is rejected and leaves the record unchanged.
    pub fn set_value(&mut self, key: &str, value: Value) -> Result<()> {
        let mut map = self.to_map();
        if value.is_null() {
            map.remove(key);
        } else {
            map.insert(key.to_string(), value);
        }
        *self = Self::from_map(map)?;
        Ok(())
    }

    /// Merge every attribute of `data` into this record
    pub fn insert(&mut self, data: Map<String, Value>) -> Result<()> {
        let mut map = self.to_map();
        map.extend(data);
        *self = Self::from_map(map)?;
        Ok(())
    }

    /// Check what `start()` requires
    pub fn validate(&self) -> Result<()> {
        if self.program.trim().is_empty() {
            return Err(LaunchError::InvalidConfiguration("program is not set".into()));
        }
        if let Some(priority) = self.priority {
            if !(-20..=19).contains(&priority) {
                return Err(LaunchError::InvalidConfiguration(format!(
                    "priority {} outside -20..=19",
                    priority
                )));
            }
        }
        if let Some(oom) = self.oom_adjustment {
            if !(-1000..=1000).contains(&oom) {
                return Err(LaunchError::InvalidConfiguration(format!(
                    "oomAdjustment {} outside -1000..=1000",
                    oom
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_recognized_keys_serialize_camel_case() {
        let info = ProcessInfo::new("/bin/echo")
            .with_arguments(["a", "b"])
            .with_working_directory("/tmp")
            .with_oom_adjustment(500);
        let map = info.to_map();
        assert_eq!(map[keys::PROGRAM], json!("/bin/echo"));
        assert_eq!(map[keys::ARGUMENTS], json!(["a", "b"]));
        assert_eq!(map[keys::WORKING_DIRECTORY], json!("/tmp"));
        assert_eq!(map[keys::OOM_ADJUSTMENT], json!(500));
        assert!(!map.contains_key(keys::UID));
    }

    #[test]
    fn test_key_value_access() {
        let mut info = ProcessInfo::new("sleep");
        assert!(info.contains(keys::PROGRAM));
        assert!(!info.contains("pipe"));

        info.set_value("pipe", json!("true")).unwrap();
        assert_eq!(info.value("pipe"), Some(json!("true")));
        assert_eq!(info.extra.get("pipe"), Some(&json!("true")));

        info.set_value(keys::PRIORITY, json!(19)).unwrap();
        assert_eq!(info.priority, Some(19));

        info.set_value(keys::PRIORITY, Value::Null).unwrap();
        assert_eq!(info.priority, None);
    }

    #[test]
    fn test_set_value_rejects_wrong_type() {
        let mut info = ProcessInfo::new("sleep");
        assert!(info.set_value(keys::ARGUMENTS, json!(42)).is_err());
        assert_eq!(info, ProcessInfo::new("sleep"));
    }

    #[test]
    fn test_copy_is_independent() {
        let mut original = ProcessInfo::new("cat").with_env("A", "1");
        let handed_off = original.clone();
        original.environment.insert("B".into(), "2".into());
        assert_eq!(handed_off.environment.len(), 1);
    }

    #[test]
    fn test_byte_string_repr() {
        let text = ByteString::from("ready\n");
        assert_eq!(serde_json::to_value(&text).unwrap(), json!("ready\n"));

        let binary = ByteString(vec![0xff, 0x00, 0x41]);
        let value = serde_json::to_value(&binary).unwrap();
        assert_eq!(value, json!([255, 0, 65]));
        let back: ByteString = serde_json::from_value(value).unwrap();
        assert_eq!(back, binary);
    }

    #[test]
    fn test_start_output_pattern() {
        let info = ProcessInfo::new("sh").with_start_output_pattern("READY");
        assert_eq!(info.start_output_pattern(), Some(&b"READY"[..]));
        let empty = ProcessInfo::new("sh").with_start_output_pattern("");
        assert_eq!(empty.start_output_pattern(), None);
    }

    #[test]
    fn test_validate() {
        assert!(ProcessInfo::default().validate().is_err());
        assert!(ProcessInfo::new("true").validate().is_ok());
        assert!(ProcessInfo::new("true").with_priority(40).validate().is_err());
        assert!(ProcessInfo::new("true").with_oom_adjustment(-2000).validate().is_err());
    }
}
