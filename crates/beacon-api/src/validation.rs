//! Input validation utilities for Beacon
//!
//! Validation runs where a caller hands names to the control plane: node
//! registration, watch subscriptions and method binding.

use std::collections::HashMap;

use beacon_common::{INFO_IP, is_valid};
use validator::ValidationError;

/// Maximum length for service_name field
pub const MAX_SERVICE_NAME_LENGTH: usize = 512;

/// Maximum length for node_id field
pub const MAX_NODE_ID_LENGTH: usize = 256;

/// Maximum length for method field
pub const MAX_METHOD_LENGTH: usize = 128;

/// Validate service_name format
pub fn validate_service_name(service_name: &str) -> Result<(), ValidationError> {
    if service_name.is_empty() {
        return Err(ValidationError::new("service_name_empty"));
    }
    if service_name.len() > MAX_SERVICE_NAME_LENGTH {
        return Err(ValidationError::new("service_name_too_long"));
    }
    if !is_valid(service_name) {
        return Err(ValidationError::new("service_name_invalid_chars"));
    }
    Ok(())
}

/// Validate node_id format
///
/// Node ids become the tail of the store key, so `/` is not allowed.
pub fn validate_node_id(node_id: &str) -> Result<(), ValidationError> {
    if node_id.is_empty() {
        return Err(ValidationError::new("node_id_empty"));
    }
    if node_id.len() > MAX_NODE_ID_LENGTH {
        return Err(ValidationError::new("node_id_too_long"));
    }
    if node_id.contains('/') || !is_valid(node_id) {
        return Err(ValidationError::new("node_id_invalid_chars"));
    }
    Ok(())
}

/// Validate a request/notification method name
pub fn validate_method(method: &str) -> Result<(), ValidationError> {
    if method.is_empty() {
        return Err(ValidationError::new("method_empty"));
    }
    if method.len() > MAX_METHOD_LENGTH {
        return Err(ValidationError::new("method_too_long"));
    }
    Ok(())
}

/// Validate node info: keys must be non-empty and a resolved address present
pub fn validate_node_info(info: &HashMap<String, String>) -> Result<(), ValidationError> {
    if info.keys().any(|k| k.is_empty()) {
        return Err(ValidationError::new("node_info_empty_key"));
    }
    match info.get(INFO_IP) {
        Some(ip) if !ip.is_empty() => Ok(()),
        _ => Err(ValidationError::new("node_info_missing_ip")),
    }
}
