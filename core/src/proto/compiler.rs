//! IDL Compiler (C1): turns a set of `.proto` sources into a descriptor pool
//! plus a merged `ProtoFileStructure` summary.
//!
//! Grounded on `protobuf/compilers.py` (`StructureParser`, `generate_descriptor_pool`)
//! and `protobuf/__init__.py` (`get_proto_files_paths`), adapted to compile
//! in-process via `protox` instead of shelling out to `protoc`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use prost_reflect::{Cardinality, DescriptorPool, FileDescriptor, Kind};

use crate::error::{MockServerError, Result};

use super::types::{
    is_map_entry, EnumData, EnumField, InMethodMessageData, MessageData, MessageField,
    MethodData, ProtoFileStructure, ProtoType, PropertyLabel, ServiceData,
};

/// Resolved, absolute proto file paths plus their shared import root.
#[derive(Debug, Clone)]
pub struct ProtoFilesPaths {
    pub proto_files_abs: Vec<PathBuf>,
    pub base_dir_abs: PathBuf,
}

/// Resolve `proto_files` (string or list, globs accepted) and
/// `proto_files_base_dir` relative to the directory containing the config
/// file (§4.1).
pub fn resolve_proto_files_paths(
    patterns: &[String],
    base_dir_override: Option<&str>,
    config_file_dir: &Path,
) -> Result<ProtoFilesPaths> {
    let mut resolved = Vec::new();
    for pattern in patterns {
        let absolute_pattern = resolve_relative(config_file_dir, pattern);
        let pattern_str = absolute_pattern.to_string_lossy().to_string();
        let mut matched_any = false;
        for entry in glob::glob(&pattern_str)
            .map_err(|e| MockServerError::ConfigLoad(format!("invalid proto glob '{pattern}': {e}")))?
        {
            let path = entry.map_err(|e| {
                MockServerError::ConfigLoad(format!("error expanding glob '{pattern}': {e}"))
            })?;
            matched_any = true;
            resolved.push(path);
        }
        if !matched_any && !has_glob_magic(pattern) {
            // A plain (non-glob) path that matched nothing is still recorded;
            // the missing-file error surfaces later from the compiler itself.
            resolved.push(absolute_pattern);
        }
    }

    let base_dir_abs = match base_dir_override {
        Some(dir) => resolve_relative(config_file_dir, dir),
        None => common_prefix_dir(&resolved),
    };

    Ok(ProtoFilesPaths {
        proto_files_abs: resolved,
        base_dir_abs,
    })
}

fn has_glob_magic(pattern: &str) -> bool {
    pattern.contains('*') || pattern.contains('?') || pattern.contains('[')
}

fn resolve_relative(base: &Path, path: &str) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base.join(p)
    }
}

fn common_prefix_dir(paths: &[PathBuf]) -> PathBuf {
    if paths.is_empty() {
        return PathBuf::from(".");
    }
    let strings: Vec<String> = paths.iter().map(|p| p.to_string_lossy().to_string()).collect();
    let mut prefix = strings[0].clone();
    for s in &strings[1..] {
        let common_len = prefix
            .chars()
            .zip(s.chars())
            .take_while(|(a, b)| a == b)
            .count();
        prefix.truncate(common_len);
    }
    let dir = Path::new(&prefix)
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    if dir.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        dir
    }
}

/// Compile the given proto files into a descriptor pool and the merged,
/// flattened structural summary used throughout the engine.
pub fn compile(paths: &ProtoFilesPaths) -> Result<(DescriptorPool, ProtoFileStructure)> {
    let includes = [paths.base_dir_abs.clone()];
    let fds = protox::compile(&paths.proto_files_abs, includes)
        .map_err(|e| MockServerError::ProtoCompileFailed(e.to_string()))?;

    let pool = DescriptorPool::from_file_descriptor_set(fds)
        .map_err(|e| MockServerError::ProtoCompileFailed(e.to_string()))?;

    let mut summary = ProtoFileStructure::default();
    for file in pool.files() {
        summary.merge(parse_file(&file));
    }

    Ok((pool, summary))
}

fn parse_file(file: &FileDescriptor) -> ProtoFileStructure {
    let mut messages = HashMap::new();
    let mut enums = HashMap::new();
    let mut services = HashMap::new();

    for message in file.messages() {
        parse_message(&message, &mut messages, &mut enums);
    }
    for en in file.enums() {
        parse_enum(&en, &mut enums);
    }
    for svc in file.services() {
        let mut methods = HashMap::new();
        for method in svc.methods() {
            methods.insert(
                method.name().to_string(),
                MethodData {
                    name: method.name().to_string(),
                    input_message: InMethodMessageData {
                        name: method.input().full_name().to_string(),
                        streaming: method.is_client_streaming(),
                    },
                    output_message: InMethodMessageData {
                        name: method.output().full_name().to_string(),
                        streaming: method.is_server_streaming(),
                    },
                },
            );
        }
        services.insert(
            svc.full_name().to_string(),
            ServiceData {
                name: svc.name().to_string(),
                full_name: svc.full_name().to_string(),
                methods,
            },
        );
    }

    ProtoFileStructure {
        package: file.package_name().to_string().into(),
        messages,
        services,
        enums,
    }
}

/// Depth-first so a map-entry message's `is_map` flag is recorded before any
/// field referencing it as `message_type` is processed (§4.1 ordering).
fn parse_message(
    message: &prost_reflect::MessageDescriptor,
    messages: &mut HashMap<String, MessageData>,
    enums: &mut HashMap<String, EnumData>,
) {
    if messages.contains_key(message.full_name()) {
        return;
    }

    let mut nested_messages = Vec::new();
    let mut nested_enums = Vec::new();
    for child in message.child_messages() {
        nested_messages.push(child.full_name().to_string());
    }
    for child in message.child_enums() {
        nested_enums.push(child.full_name().to_string());
    }

    messages.insert(
        message.full_name().to_string(),
        MessageData {
            name: message.name().to_string(),
            full_name: message.full_name().to_string(),
            parent_message: message.parent_message().map(|m| m.full_name().to_string()),
            nested_messages,
            nested_enums,
            is_map: false,
            fields: Vec::new(),
        },
    );

    let mut fields = Vec::new();
    for field in message.fields() {
        let mut message_type = None;
        let mut enum_type = None;

        match field.kind() {
            Kind::Message(inner) | Kind::Group(inner) => {
                message_type = Some(inner.full_name().to_string());
                parse_message(&inner, messages, enums);
            }
            Kind::Enum(inner) => {
                enum_type = Some(inner.full_name().to_string());
                parse_enum(&inner, enums);
            }
            _ => {}
        }

        let is_map = message_type
            .as_ref()
            .and_then(|name| messages.get(name))
            .map(|m| m.is_map)
            .unwrap_or(false);

        // FieldDescriptor's cardinality mirrors the raw descriptor LABEL, which
        // in proto3 is LABEL_OPTIONAL for every non-repeated field (LABEL_REQUIRED
        // only exists in proto2). `supports_presence()` answers a different
        // question (explicit `optional`/message/oneof tracking) and would wrongly
        // mark ordinary proto3 scalars as required.
        let label = match field.cardinality() {
            Cardinality::Repeated => PropertyLabel::Repeated,
            Cardinality::Required => PropertyLabel::Required,
            Cardinality::Optional => PropertyLabel::Optional,
        };

        fields.push(MessageField {
            name: field.name().to_string(),
            number: field.number() as i32,
            label,
            simple_type: ProtoType::from_kind(&field.kind()),
            message_type,
            enum_type,
            default: None,
            is_map,
        });
    }

    if let Some(entry) = messages.get_mut(message.full_name()) {
        entry.is_map = is_map_entry(&entry.name, &fields);
        entry.fields = fields;
    }
}

fn parse_enum(en: &prost_reflect::EnumDescriptor, enums: &mut HashMap<String, EnumData>) {
    if enums.contains_key(en.full_name()) {
        return;
    }
    let fields = en
        .values()
        .map(|v| EnumField {
            name: v.name().to_string(),
            number: v.number(),
        })
        .collect();
    enums.insert(
        en.full_name().to_string(),
        EnumData {
            name: en.name().to_string(),
            full_name: en.full_name().to_string(),
            parent_message: en.parent_message().map(|m| m.full_name().to_string()),
            fields,
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_proto(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn resolves_relative_and_glob_patterns() {
        let dir = tempfile::tempdir().unwrap();
        write_proto(dir.path(), "book.proto", "syntax = \"proto3\"; package book;");

        let paths = resolve_proto_files_paths(
            &["*.proto".to_string()],
            None,
            dir.path(),
        )
        .unwrap();

        assert_eq!(paths.proto_files_abs.len(), 1);
        assert!(paths.proto_files_abs[0].ends_with("book.proto"));
    }

    #[test]
    fn compiles_service_and_message_structure() {
        let dir = tempfile::tempdir().unwrap();
        write_proto(
            dir.path(),
            "book.proto",
            r#"
syntax = "proto3";
package book;

enum BookType { UNKNOWN = 0; NOVEL = 1; }

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

message GetBookReq { int32 id = 1; }

service BookService {
  rpc GetBook(GetBookReq) returns (Book);
}
"#,
        );

        let paths = ProtoFilesPaths {
            proto_files_abs: vec![dir.path().join("book.proto")],
            base_dir_abs: dir.path().to_path_buf(),
        };

        let (_, structure) = compile(&paths).unwrap();

        assert!(structure.services.contains_key("book.BookService"));
        let svc = &structure.services["book.BookService"];
        assert!(svc.methods.contains_key("GetBook"));

        let book = &structure.messages["book.Book"];
        assert!(!book.is_map);
        let tags_field = book.fields.iter().find(|f| f.name == "tags").unwrap();
        assert!(tags_field.is_map);

        let map_entry = &structure.messages["book.Book.TagsEntry"];
        assert!(map_entry.is_map);

        let enum_data = &structure.enums["book.BookType"];
        assert_eq!(enum_data.first_value_name(), Some("UNKNOWN"));
    }
}
