//! Proto descriptor compilation and the structural summary derived from it.

pub mod compiler;
pub mod types;

pub use compiler::{compile, resolve_proto_files_paths, ProtoFilesPaths};
pub use types::{
    is_map_entry, EnumData, EnumField, InMethodMessageData, MessageData, MessageField,
    MethodData, ProtoFileStructure, ProtoType, PropertyLabel, ServiceData,
};
