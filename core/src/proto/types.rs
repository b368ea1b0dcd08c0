//! The structural summary produced by compiling IDL sources: messages,
//! fields, enums, services, and the label/type vocabulary used to drive the
//! mock materializer.
//!
//! Grounded on `protobuf/types.py` and `protobuf/definitions.py`.

use std::collections::HashMap;

use prost_reflect::Kind;
use serde_json::Value;

/// The 18 wire-level primitive/compound kinds a field can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtoType {
    Double,
    Float,
    Int64,
    Uint64,
    Int32,
    Fixed64,
    Fixed32,
    Bool,
    String,
    Group,
    Message,
    Bytes,
    Uint32,
    Enum,
    Sfixed32,
    Sfixed64,
    Sint32,
    Sint64,
}

impl ProtoType {
    pub fn from_kind(kind: &Kind) -> ProtoType {
        match kind {
            Kind::Double => ProtoType::Double,
            Kind::Float => ProtoType::Float,
            Kind::Int64 => ProtoType::Int64,
            Kind::Uint64 => ProtoType::Uint64,
            Kind::Int32 => ProtoType::Int32,
            Kind::Fixed64 => ProtoType::Fixed64,
            Kind::Fixed32 => ProtoType::Fixed32,
            Kind::Bool => ProtoType::Bool,
            Kind::String => ProtoType::String,
            Kind::Group(_) => ProtoType::Group,
            Kind::Message(_) => ProtoType::Message,
            Kind::Bytes => ProtoType::Bytes,
            Kind::Uint32 => ProtoType::Uint32,
            Kind::Enum(_) => ProtoType::Enum,
            Kind::Sfixed32 => ProtoType::Sfixed32,
            Kind::Sfixed64 => ProtoType::Sfixed64,
            Kind::Sint32 => ProtoType::Sint32,
            Kind::Sint64 => ProtoType::Sint64,
        }
    }

    /// Default value used when a mock is absent and no explicit default is
    /// configured (§4.4): numerics -> 0, bool -> false, string -> "",
    /// bytes -> empty.
    pub fn default_value(self) -> Value {
        match self {
            ProtoType::Bool => Value::Bool(false),
            ProtoType::String => Value::String(String::new()),
            ProtoType::Bytes => Value::String(String::new()),
            ProtoType::Message | ProtoType::Group | ProtoType::Enum => Value::Null,
            _ => Value::from(0),
        }
    }

    /// Render-then-cast coercion: interpret `value` (already rendered to a
    /// string or passed through) as this primitive type. On failure, the
    /// caller keeps `value` unchanged.
    pub fn coerce(self, value: &Value) -> Option<Value> {
        match self {
            ProtoType::Double | ProtoType::Float => value
                .as_f64()
                .or_else(|| value.as_str().and_then(|s| s.parse::<f64>().ok()))
                .map(Value::from),
            ProtoType::Int64 | ProtoType::Sint64 | ProtoType::Sfixed64 => value
                .as_i64()
                .or_else(|| value.as_str().and_then(|s| s.parse::<i64>().ok()))
                .map(Value::from),
            ProtoType::Uint64 | ProtoType::Fixed64 => value
                .as_u64()
                .or_else(|| value.as_str().and_then(|s| s.parse::<u64>().ok()))
                .map(Value::from),
            ProtoType::Int32 | ProtoType::Sint32 | ProtoType::Sfixed32 => value
                .as_i64()
                .or_else(|| value.as_str().and_then(|s| s.parse::<i64>().ok()))
                .map(|v| Value::from(v as i32)),
            ProtoType::Uint32 => value
                .as_u64()
                .or_else(|| value.as_str().and_then(|s| s.parse::<u64>().ok()))
                .map(|v| Value::from(v as u32)),
            ProtoType::Bool => value
                .as_bool()
                .or_else(|| value.as_str().and_then(|s| s.parse::<bool>().ok()))
                .map(Value::from),
            ProtoType::String | ProtoType::Bytes => {
                Some(Value::String(value.as_str().map(str::to_string).unwrap_or_else(|| {
                    value.to_string()
                })))
            }
            ProtoType::Message | ProtoType::Group | ProtoType::Enum => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyLabel {
    Optional,
    Repeated,
    Required,
}

#[derive(Debug, Clone)]
pub struct MessageField {
    pub name: String,
    pub number: i32,
    pub label: PropertyLabel,
    pub simple_type: ProtoType,
    pub message_type: Option<String>,
    pub enum_type: Option<String>,
    pub default: Option<Value>,
    pub is_map: bool,
}

#[derive(Debug, Clone)]
pub struct MessageData {
    pub name: String,
    pub full_name: String,
    pub parent_message: Option<String>,
    pub nested_messages: Vec<String>,
    pub nested_enums: Vec<String>,
    pub is_map: bool,
    pub fields: Vec<MessageField>,
}

#[derive(Debug, Clone)]
pub struct EnumField {
    pub name: String,
    pub number: i32,
}

#[derive(Debug, Clone)]
pub struct EnumData {
    pub name: String,
    pub full_name: String,
    pub parent_message: Option<String>,
    pub fields: Vec<EnumField>,
}

impl EnumData {
    pub fn first_value_name(&self) -> Option<&str> {
        self.fields.first().map(|f| f.name.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct InMethodMessageData {
    pub name: String,
    pub streaming: bool,
}

#[derive(Debug, Clone)]
pub struct MethodData {
    pub name: String,
    pub input_message: InMethodMessageData,
    pub output_message: InMethodMessageData,
}

#[derive(Debug, Clone)]
pub struct ServiceData {
    pub name: String,
    pub full_name: String,
    pub methods: HashMap<String, MethodData>,
}

#[derive(Debug, Clone, Default)]
pub struct ProtoFileStructure {
    pub package: Option<String>,
    pub messages: HashMap<String, MessageData>,
    pub services: HashMap<String, ServiceData>,
    pub enums: HashMap<String, EnumData>,
}

impl ProtoFileStructure {
    /// Merge another file's structure into this one. Entries with the same
    /// fully-qualified name are overwritten by the later file, matching the
    /// dict-union behaviour of `ProtoObjectResolver._summarize_proto_structure`.
    pub fn merge(&mut self, other: ProtoFileStructure) {
        self.services.extend(other.services);
        self.messages.extend(other.messages);
        self.enums.extend(other.enums);
    }
}

/// A message named `*Entry` with exactly two fields named `key`/`value` is a
/// synthesized map-entry message (Testable Property #2).
pub fn is_map_entry(name: &str, fields: &[MessageField]) -> bool {
    name.ends_with("Entry")
        && fields.len() == 2
        && fields.iter().any(|f| f.name == "key")
        && fields.iter().any(|f| f.name == "value")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(name: &str) -> MessageField {
        MessageField {
            name: name.to_string(),
            number: 1,
            label: PropertyLabel::Optional,
            simple_type: ProtoType::String,
            message_type: None,
            enum_type: None,
            default: None,
            is_map: false,
        }
    }

    #[test]
    fn map_entry_detection() {
        let fields = vec![field("key"), field("value")];
        assert!(is_map_entry("FooEntry", &fields));
        assert!(!is_map_entry("Foo", &fields));
        assert!(!is_map_entry("FooEntry", &[field("key")]));
    }

    #[test]
    fn primitive_defaults() {
        assert_eq!(ProtoType::Bool.default_value(), Value::Bool(false));
        assert_eq!(ProtoType::String.default_value(), Value::String(String::new()));
        assert_eq!(ProtoType::Int32.default_value(), Value::from(0));
    }

    #[test]
    fn coerce_string_to_int32() {
        let v = Value::String("42".to_string());
        assert_eq!(ProtoType::Int32.coerce(&v), Some(Value::from(42)));
    }

    #[test]
    fn coerce_invalid_returns_none() {
        let v = Value::String("not a number".to_string());
        assert_eq!(ProtoType::Int32.coerce(&v), None);
    }
}
