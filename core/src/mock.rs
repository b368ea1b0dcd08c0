//! Mock Materializer (C4): turns mock configuration (already template-rendered
//! into plain JSON) into a concrete `DynamicMessage`, following field
//! declarations from the type registry.
//!
//! Grounded on `server/processors/mock.py` (`get_message_value`,
//! `get_kv_message_value`, `_repeat_if_required`, `_fill_object`,
//! `get_enum_value`, `get_simple_value`, `set_trailing_metadata`).

use std::collections::HashMap;
use std::fmt;

use prost_reflect::{DynamicMessage, MapKey, Value as ProstValue};
use serde_json::Value as JsonValue;

use crate::proto::{MessageField, ProtoType, PropertyLabel};
use crate::registry::TypeRegistry;

/// A non-fatal failure while turning mock configuration into a message.
/// Callers (the request pipeline) turn this into an `INTERNAL` status and
/// log it; it never unwinds as a `MockServerError`.
#[derive(Debug)]
pub struct MaterializeError(pub String);

impl fmt::Display for MaterializeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for MaterializeError {}

type MResult<T> = std::result::Result<T, MaterializeError>;

fn missing(kind: &str, name: &str) -> MaterializeError {
    MaterializeError(format!("{kind} '{name}' not found while materializing mock data"))
}

/// Builds the top-level response message for a method's output type from a
/// rendered JSON mock value. Mirrors `get_service_message`.
pub fn materialize_service_message(
    registry: &TypeRegistry,
    message_name: &str,
    mock_value: Option<&JsonValue>,
) -> MResult<(JsonValue, DynamicMessage)> {
    let (raw, msg) = materialize_message(registry, None, message_name, mock_value)?;
    match msg {
        Some(m) => Ok((raw.unwrap_or(JsonValue::Object(Default::default())), m)),
        None => {
            let descriptor = registry
                .message_descriptor(message_name)
                .map_err(|e| MaterializeError(e.to_string()))?;
            Ok((JsonValue::Object(Default::default()), DynamicMessage::new(descriptor)))
        }
    }
}

fn materialize_message(
    registry: &TypeRegistry,
    parent_field: Option<&MessageField>,
    message_name: &str,
    mock_value: Option<&JsonValue>,
) -> MResult<(Option<JsonValue>, Option<DynamicMessage>)> {
    if let Some(pf) = parent_field {
        if pf.label == PropertyLabel::Optional && mock_value.is_none() {
            return Ok((None, None));
        }
    }

    let message_data = registry
        .message_data(message_name)
        .map_err(|_| missing("message", message_name))?;
    let descriptor = registry
        .message_descriptor(message_name)
        .map_err(|_| missing("message descriptor", message_name))?;

    let mock_object = mock_value.and_then(JsonValue::as_object);

    let mut raw_dict = serde_json::Map::new();
    let mut message = DynamicMessage::new(descriptor);

    for field_data in &message_data.fields {
        let field_mock = mock_object.and_then(|m| m.get(&field_data.name));

        match field_data.simple_type {
            ProtoType::Message if field_data.is_map => {
                let map_type = field_data
                    .message_type
                    .as_deref()
                    .ok_or_else(|| missing("map entry message", &field_data.name))?;
                if let Some((raw, prost_map)) =
                    materialize_map(registry, map_type, field_mock)?
                {
                    fill_object(field_data, raw.map(JsonValue::Object), &mut raw_dict, None);
                    message.set_field_by_name(&field_data.name, ProstValue::Map(prost_map));
                }
            }
            ProtoType::Message | ProtoType::Group => {
                let inner_name = field_data
                    .message_type
                    .as_deref()
                    .ok_or_else(|| missing("message type", &field_data.name))?;
                repeat_if_required_message(
                    registry,
                    field_data,
                    inner_name,
                    field_mock,
                    &mut raw_dict,
                    &mut message,
                )?;
            }
            ProtoType::Enum => {
                let enum_name = field_data
                    .enum_type
                    .as_deref()
                    .ok_or_else(|| missing("enum type", &field_data.name))?;
                repeat_if_required_enum(registry, field_data, enum_name, field_mock, &mut raw_dict, &mut message)?;
            }
            _ => {
                repeat_if_required_simple(field_data, field_mock, &mut raw_dict, &mut message);
            }
        }
    }

    Ok((Some(JsonValue::Object(raw_dict)), Some(message)))
}

fn fill_object(
    field_data: &MessageField,
    value: Option<JsonValue>,
    raw_dict: &mut serde_json::Map<String, JsonValue>,
    name_override: Option<&str>,
) {
    let name = name_override.unwrap_or(&field_data.name);
    if field_data.is_map && value.is_none() {
        return;
    }
    if field_data.label == PropertyLabel::Optional && value.is_none() {
        return;
    }
    raw_dict.insert(name.to_string(), value.unwrap_or(JsonValue::Null));
}

fn repeat_if_required_simple(
    field_data: &MessageField,
    mock_value: Option<&JsonValue>,
    raw_dict: &mut serde_json::Map<String, JsonValue>,
    message: &mut DynamicMessage,
) {
    if field_data.label == PropertyLabel::Repeated {
        let items = as_list(mock_value);
        if items.is_empty() {
            return;
        }
        let mut raw_items = Vec::new();
        let mut prost_items = Vec::new();
        for item in &items {
            let (raw, prost) = get_simple_value(field_data, Some(item));
            if let Some(r) = raw {
                raw_items.push(r);
            }
            if let Some(p) = prost {
                prost_items.push(p);
            }
        }
        raw_dict.insert(field_data.name.clone(), JsonValue::Array(raw_items));
        message.set_field_by_name(&field_data.name, ProstValue::List(prost_items));
    } else {
        let (raw, prost) = get_simple_value(field_data, mock_value);
        fill_object(field_data, raw, raw_dict, None);
        if let Some(p) = prost {
            message.set_field_by_name(&field_data.name, p);
        }
    }
}

fn repeat_if_required_enum(
    registry: &TypeRegistry,
    field_data: &MessageField,
    enum_name: &str,
    mock_value: Option<&JsonValue>,
    raw_dict: &mut serde_json::Map<String, JsonValue>,
    message: &mut DynamicMessage,
) -> MResult<()> {
    if field_data.label == PropertyLabel::Repeated {
        let items = as_list(mock_value);
        if items.is_empty() {
            return Ok(());
        }
        let mut raw_items = Vec::new();
        let mut prost_items = Vec::new();
        for item in &items {
            let (raw, number) = get_enum_value(registry, field_data, enum_name, Some(item))?;
            if let Some(r) = raw {
                raw_items.push(r);
            }
            if let Some(n) = number {
                prost_items.push(ProstValue::EnumNumber(n));
            }
        }
        raw_dict.insert(field_data.name.clone(), JsonValue::Array(raw_items));
        message.set_field_by_name(&field_data.name, ProstValue::List(prost_items));
    } else {
        let (raw, number) = get_enum_value(registry, field_data, enum_name, mock_value)?;
        fill_object(field_data, raw, raw_dict, None);
        if let Some(n) = number {
            message.set_field_by_name(&field_data.name, ProstValue::EnumNumber(n));
        }
    }
    Ok(())
}

fn repeat_if_required_message(
    registry: &TypeRegistry,
    field_data: &MessageField,
    inner_name: &str,
    mock_value: Option<&JsonValue>,
    raw_dict: &mut serde_json::Map<String, JsonValue>,
    message: &mut DynamicMessage,
) -> MResult<()> {
    if field_data.label == PropertyLabel::Repeated {
        let items = as_list(mock_value);
        if items.is_empty() {
            return Ok(());
        }
        let mut raw_items = Vec::new();
        let mut prost_items = Vec::new();
        for item in &items {
            let (raw, inner) =
                materialize_message(registry, Some(field_data), inner_name, Some(item))?;
            if let Some(r) = raw {
                raw_items.push(r);
            }
            if let Some(m) = inner {
                prost_items.push(ProstValue::Message(m));
            }
        }
        raw_dict.insert(field_data.name.clone(), JsonValue::Array(raw_items));
        message.set_field_by_name(&field_data.name, ProstValue::List(prost_items));
    } else {
        let (raw, inner) = materialize_message(registry, Some(field_data), inner_name, mock_value)?;
        fill_object(field_data, raw, raw_dict, None);
        if let Some(m) = inner {
            message.set_field_by_name(&field_data.name, ProstValue::Message(m));
        }
    }
    Ok(())
}

fn materialize_map(
    registry: &TypeRegistry,
    entry_message_name: &str,
    mock_value: Option<&JsonValue>,
) -> MResult<Option<(serde_json::Map<String, JsonValue>, HashMap<MapKey, ProstValue>)>> {
    let Some(mock_value) = mock_value else {
        return Ok(None);
    };
    let message_data = registry
        .message_data(entry_message_name)
        .map_err(|_| missing("map entry message", entry_message_name))?;
    let key_field = message_data
        .fields
        .first()
        .ok_or_else(|| missing("map key field", entry_message_name))?
        .clone();
    let value_field = message_data
        .fields
        .get(1)
        .ok_or_else(|| missing("map value field", entry_message_name))?
        .clone();

    let entries = mock_value.as_object().cloned().unwrap_or_default();

    let mut raw = serde_json::Map::new();
    let mut map = HashMap::new();

    for (property_key, property_value) in entries {
        let key_json = JsonValue::String(property_key.clone());
        let (_, key_prost) = get_simple_value(&key_field, Some(&key_json));
        let Some(key_prost) = key_prost else { continue };
        let Some(map_key) = prost_value_to_map_key(&key_prost) else {
            continue;
        };

        match value_field.simple_type {
            ProtoType::Message if !value_field.is_map => {
                let inner_name = value_field
                    .message_type
                    .as_deref()
                    .ok_or_else(|| missing("map value message type", &value_field.name))?;
                let (raw_value, inner) = materialize_message(
                    registry,
                    Some(&value_field),
                    inner_name,
                    Some(&property_value),
                )?;
                if let Some(r) = raw_value {
                    raw.insert(property_key.clone(), r);
                }
                if let Some(m) = inner {
                    map.insert(map_key, ProstValue::Message(m));
                }
            }
            ProtoType::Enum => {
                let enum_name = value_field
                    .enum_type
                    .as_deref()
                    .ok_or_else(|| missing("map value enum type", &value_field.name))?;
                let (raw_value, number) =
                    get_enum_value(registry, &value_field, enum_name, Some(&property_value))?;
                if let Some(r) = raw_value {
                    raw.insert(property_key.clone(), r);
                }
                if let Some(n) = number {
                    map.insert(map_key, ProstValue::EnumNumber(n));
                }
            }
            _ => {
                let (raw_value, prost_value) = get_simple_value(&value_field, Some(&property_value));
                if let Some(r) = raw_value {
                    raw.insert(property_key.clone(), r);
                }
                if let Some(p) = prost_value {
                    map.insert(map_key, p);
                }
            }
        }
    }

    Ok(Some((raw, map)))
}

fn prost_value_to_map_key(value: &ProstValue) -> Option<MapKey> {
    match value {
        ProstValue::Bool(b) => Some(MapKey::Bool(*b)),
        ProstValue::I32(v) => Some(MapKey::I32(*v)),
        ProstValue::I64(v) => Some(MapKey::I64(*v)),
        ProstValue::U32(v) => Some(MapKey::U32(*v)),
        ProstValue::U64(v) => Some(MapKey::U64(*v)),
        ProstValue::String(s) => Some(MapKey::String(s.clone())),
        _ => None,
    }
}

fn as_list(mock_value: Option<&JsonValue>) -> Vec<JsonValue> {
    match mock_value {
        None => vec![],
        Some(JsonValue::Array(items)) => items.clone(),
        Some(single) => vec![single.clone()],
    }
}

/// Resolves a scalar field's value, giving the rendered mock value priority
/// over the field's configured default, which in turn beats the wire-type
/// zero value. Mirrors `get_simple_value`.
fn get_simple_value(
    field_data: &MessageField,
    value: Option<&JsonValue>,
) -> (Option<JsonValue>, Option<ProstValue>) {
    if field_data.label == PropertyLabel::Optional && value.is_none() {
        return (None, None);
    }

    let mut result = field_data.simple_type.default_value();
    if let Some(default) = &field_data.default {
        result = default.clone();
    }
    if let Some(v) = value {
        if let Some(coerced) = field_data.simple_type.coerce(v) {
            result = coerced;
        }
    }

    let prost = to_prost_scalar(field_data.simple_type, &result);
    (Some(result), prost)
}

/// Resolves an enum field's value. Unlike `get_simple_value`, a configured
/// default overrides any given mock value outright, matching the asymmetry
/// in `get_enum_value`.
fn get_enum_value(
    registry: &TypeRegistry,
    field_data: &MessageField,
    enum_name: &str,
    value: Option<&JsonValue>,
) -> MResult<(Option<JsonValue>, Option<i32>)> {
    if field_data.label == PropertyLabel::Optional && value.is_none() {
        return Ok((None, None));
    }

    let enum_data = registry
        .enum_data(enum_name)
        .map_err(|_| missing("enum", enum_name))?;

    let mut effective = value.cloned();
    if let Some(default) = &field_data.default {
        effective = Some(default.clone());
    }

    if let Some(name) = effective.as_ref().and_then(JsonValue::as_str) {
        if let Some(ef) = enum_data.fields.iter().find(|f| f.name == name) {
            return Ok((Some(JsonValue::String(ef.name.clone())), Some(ef.number)));
        }
    }

    match enum_data.fields.first() {
        Some(first) => Ok((Some(JsonValue::String(first.name.clone())), Some(first.number))),
        None => Ok((None, None)),
    }
}

fn to_prost_scalar(proto_type: ProtoType, value: &JsonValue) -> Option<ProstValue> {
    match proto_type {
        ProtoType::Double => value.as_f64().map(ProstValue::F64),
        ProtoType::Float => value.as_f64().map(|v| ProstValue::F32(v as f32)),
        ProtoType::Int64 | ProtoType::Sint64 | ProtoType::Sfixed64 => {
            value.as_i64().map(ProstValue::I64)
        }
        ProtoType::Uint64 | ProtoType::Fixed64 => value.as_u64().map(ProstValue::U64),
        ProtoType::Int32 | ProtoType::Sint32 | ProtoType::Sfixed32 => {
            value.as_i64().map(|v| ProstValue::I32(v as i32))
        }
        ProtoType::Uint32 | ProtoType::Fixed32 => value.as_u64().map(|v| ProstValue::U32(v as u32)),
        ProtoType::Bool => value.as_bool().map(ProstValue::Bool),
        ProtoType::String => value.as_str().map(|s| ProstValue::String(s.to_string())),
        ProtoType::Bytes => value.as_str().and_then(|s| {
            use base64::Engine;
            base64::engine::general_purpose::STANDARD
                .decode(s)
                .ok()
                .map(|decoded| ProstValue::Bytes(bytes::Bytes::from(decoded)))
        }),
        ProtoType::Message | ProtoType::Group | ProtoType::Enum => None,
    }
}

/// Builds a `MetadataMap` from the (already rendered) trailing metadata
/// object, flattening list values into repeated entries. Mirrors
/// `set_trailing_metadata`.
pub fn build_trailing_metadata(
    trailing_meta: &JsonValue,
) -> MResult<tonic::metadata::MetadataMap> {
    let mut map = tonic::metadata::MetadataMap::new();
    let Some(object) = trailing_meta.as_object() else {
        return Ok(map);
    };
    for (key, value) in object {
        let values: Vec<String> = match value {
            JsonValue::Array(items) => items.iter().map(json_scalar_to_string).collect(),
            other => vec![json_scalar_to_string(other)],
        };
        for v in values {
            let key_parsed = tonic::metadata::MetadataKey::from_bytes(key.as_bytes())
                .map_err(|e| MaterializeError(format!("invalid trailing metadata key '{key}': {e}")))?;
            let value_parsed = tonic::metadata::MetadataValue::try_from(v.as_str())
                .map_err(|e| MaterializeError(format!("invalid trailing metadata value for '{key}': {e}")))?;
            map.append(key_parsed, value_parsed);
        }
    }
    Ok(map)
}

fn json_scalar_to_string(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Merges a configured mock override onto a proxied upstream response: `mock`
/// wins at any key it supplies, `proxy` fills in everything else; key sets
/// union, and a type mismatch between a mock leaf and its proxy counterpart
/// falls back to the proxy value. Mirrors the flat `merge_response_values`
/// used by the response pipeline.
pub fn merge_response_values(
    mock: Option<&JsonValue>,
    proxy: Option<&JsonValue>,
) -> Option<JsonValue> {
    let (mock, proxy) = match (mock, proxy) {
        (Some(m), Some(p)) => (m, p),
        (Some(m), None) => return Some(m.clone()),
        (None, Some(p)) => return Some(p.clone()),
        (None, None) => return None,
    };

    let (Some(mock_obj), Some(proxy_obj)) = (mock.as_object(), proxy.as_object()) else {
        // Top-level type mismatch: proxy value preserved.
        return Some(proxy.clone());
    };

    let mut result = proxy_obj.clone();
    for (k, mock_v) in mock_obj {
        match proxy_obj.get(k) {
            Some(proxy_v) => {
                if mock_v.is_object() && proxy_v.is_object() {
                    if let Some(merged) = merge_response_values(Some(mock_v), Some(proxy_v)) {
                        result.insert(k.clone(), merged);
                    }
                } else if mock_v.is_object() == proxy_v.is_object() {
                    result.insert(k.clone(), mock_v.clone());
                }
                // else: type mismatch at this leaf, proxy value stays.
            }
            None => {
                result.insert(k.clone(), mock_v.clone());
            }
        }
    }
    Some(JsonValue::Object(result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{compile, ProtoFilesPaths};
    use crate::registry::TypeRegistry;
    use std::fs;

    fn book_registry() -> (TypeRegistry, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("book.proto"),
            r#"
syntax = "proto3";
package book;

enum BookType { UNKNOWN = 0; NOVEL = 1; ENCYCLOPEDIA = 2; }

message Author {
  string first_name = 1;
  string last_name = 2;
}

message Book {
  int32 id = 1;
  string name = 2;
  BookType type = 3;
  Author author = 4;
  map<string, string> tags = 5;
}
"#,
        )
        .unwrap();

        let paths = ProtoFilesPaths {
            proto_files_abs: vec![dir.path().join("book.proto")],
            base_dir_abs: dir.path().to_path_buf(),
        };
        let (pool, structure) = compile(&paths).unwrap();
        (TypeRegistry::new(pool, structure), dir)
    }

    #[test]
    fn materializes_scalar_and_enum_and_map_fields() {
        let (registry, _dir) = book_registry();
        let mock = serde_json::json!({
            "id": 7,
            "name": "Dune",
            "type": "NOVEL",
            "tags": {"genre": "scifi"},
        });

        let (_raw, message) =
            materialize_service_message(&registry, "book.Book", Some(&mock)).unwrap();

        assert_eq!(
            message.get_field_by_name("id").unwrap().as_i32(),
            Some(7)
        );
        assert_eq!(
            message
                .get_field_by_name("name")
                .unwrap()
                .as_str()
                .map(str::to_string),
            Some("Dune".to_string())
        );
    }

    #[test]
    fn enum_falls_back_to_first_value_when_unmatched() {
        let (registry, _dir) = book_registry();
        let field = MessageField {
            name: "type".to_string(),
            number: 3,
            label: PropertyLabel::Required,
            simple_type: ProtoType::Enum,
            message_type: None,
            enum_type: Some("book.BookType".to_string()),
            default: None,
            is_map: false,
        };
        let (raw, number) =
            get_enum_value(&registry, &field, "book.BookType", Some(&serde_json::json!("NOPE")))
                .unwrap();
        assert_eq!(raw, Some(JsonValue::String("UNKNOWN".to_string())));
        assert_eq!(number, Some(0));
    }

    #[test]
    fn merge_prefers_mock_and_fills_missing_keys_from_proxy() {
        let mock = serde_json::json!({"name": "Overridden"});
        let proxy = serde_json::json!({"id": 1, "name": "Dune", "tags": {"genre": "scifi"}});
        let result = merge_response_values(Some(&mock), Some(&proxy)).unwrap();
        assert_eq!(result["id"], serde_json::json!(1));
        assert_eq!(result["name"], serde_json::json!("Overridden"));
        assert_eq!(result["tags"], serde_json::json!({"genre": "scifi"}));
    }

    #[test]
    fn merge_keeps_proxy_value_on_leaf_type_mismatch() {
        let mock = serde_json::json!({"tags": "not-an-object"});
        let proxy = serde_json::json!({"tags": {"genre": "scifi"}});
        let result = merge_response_values(Some(&mock), Some(&proxy)).unwrap();
        assert_eq!(result["tags"], serde_json::json!({"genre": "scifi"}));
    }
}
