//! Type Registry (C2): resolves fully-qualified message/enum/service names
//! against a compiled descriptor pool.
//!
//! Grounded on `server/helpers.py`'s `ProtoObjectResolver` and
//! `get_grpc_status_code`.

use prost_reflect::{DescriptorPool, EnumDescriptor, MessageDescriptor};

use crate::error::{MockServerError, Result};
use crate::proto::{EnumData, MessageData, ProtoFileStructure, ServiceData};

/// Owns the compiled descriptor pool plus the structural summary, and
/// resolves either on demand by fully-qualified name.
pub struct TypeRegistry {
    pool: DescriptorPool,
    structure: ProtoFileStructure,
}

impl TypeRegistry {
    pub fn new(pool: DescriptorPool, structure: ProtoFileStructure) -> Self {
        TypeRegistry { pool, structure }
    }

    pub fn pool(&self) -> &DescriptorPool {
        &self.pool
    }

    pub fn structure(&self) -> &ProtoFileStructure {
        &self.structure
    }

    pub fn message_descriptor(&self, full_name: &str) -> Result<MessageDescriptor> {
        self.pool.get_message_by_name(full_name).ok_or_else(|| {
            MockServerError::DescriptorNotFound(format!("message '{full_name}' not found"))
        })
    }

    pub fn enum_descriptor(&self, full_name: &str) -> Result<EnumDescriptor> {
        self.pool.get_enum_by_name(full_name).ok_or_else(|| {
            MockServerError::DescriptorNotFound(format!("enum '{full_name}' not found"))
        })
    }

    pub fn message_data(&self, full_name: &str) -> Result<&MessageData> {
        self.structure
            .messages
            .get(full_name)
            .ok_or_else(|| MockServerError::UnknownType(full_name.to_string()))
    }

    pub fn enum_data(&self, full_name: &str) -> Result<&EnumData> {
        self.structure
            .enums
            .get(full_name)
            .ok_or_else(|| MockServerError::UnknownType(full_name.to_string()))
    }

    pub fn service_data(&self, full_name: &str) -> Result<&ServiceData> {
        self.structure
            .services
            .get(full_name)
            .ok_or_else(|| MockServerError::UnknownType(full_name.to_string()))
    }
}

/// Maps a configured/rendered integer status code onto a canonical gRPC
/// status. Anything outside 1..16 degrades to `Unknown`, matching
/// `get_grpc_status_code`'s linear-scan-with-fallback behaviour.
pub fn grpc_status_code(value: i32) -> tonic::Code {
    if (1..=16).contains(&value) {
        tonic::Code::from_i32(value)
    } else {
        tonic::Code::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_code_mapping() {
        assert_eq!(grpc_status_code(5), tonic::Code::NotFound);
        assert_eq!(grpc_status_code(16), tonic::Code::Unauthenticated);
        assert_eq!(grpc_status_code(0), tonic::Code::Unknown);
        assert_eq!(grpc_status_code(99), tonic::Code::Unknown);
    }
}
