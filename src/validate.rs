//! Input validation
//!
//! Format rules for everything user-provided that ends up in a federated
//! record or a remote RPC. Rejections surface as `AppError::Validation` with
//! the message shown to the user verbatim.

use crate::error::{AppError, AppResult};
use crate::models::{ConcreteType, LabelDefinitionRecord, ValueFormat};

pub fn validate_did(did: &str) -> AppResult<()> {
    let rest = did
        .strip_prefix("did:")
        .ok_or_else(|| AppError::Validation(format!("not a DID: {did}")))?;
    let (method, id) = rest
        .split_once(':')
        .ok_or_else(|| AppError::Validation(format!("DID missing identifier: {did}")))?;
    if method.is_empty() || id.is_empty() {
        return Err(AppError::Validation(format!("malformed DID: {did}")));
    }
    if !method.bytes().all(|b| b.is_ascii_lowercase()) {
        return Err(AppError::Validation(format!("invalid DID method: {did}")));
    }
    if !id
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b'_' | b':' | b'%'))
    {
        return Err(AppError::Validation(format!("invalid DID identifier: {did}")));
    }
    Ok(())
}

pub fn validate_handle(handle: &str) -> AppResult<()> {
    if handle.len() > 253 || handle.is_empty() {
        return Err(AppError::Validation(format!("invalid handle: {handle}")));
    }
    let labels: Vec<&str> = handle.split('.').collect();
    if labels.len() < 2 {
        return Err(AppError::Validation(format!(
            "handle must contain at least one dot: {handle}"
        )));
    }
    for label in labels {
        if label.is_empty()
            || label.len() > 63
            || label.starts_with('-')
            || label.ends_with('-')
            || !label
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        {
            return Err(AppError::Validation(format!("invalid handle: {handle}")));
        }
    }
    Ok(())
}

/// A handle or a DID, as accepted by the login form.
pub fn validate_identifier(identifier: &str) -> AppResult<()> {
    if identifier.starts_with("did:") {
        validate_did(identifier)
    } else {
        validate_handle(identifier.trim_start_matches('@'))
    }
}

pub fn validate_repo_name(name: &str) -> AppResult<()> {
    if name.is_empty() || name.len() > 100 {
        return Err(AppError::Validation(
            "repository names must be 1-100 characters".into(),
        ));
    }
    if name == "." || name == ".." || name.starts_with('.') {
        return Err(AppError::Validation(format!("invalid repository name: {name}")));
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b'_'))
    {
        return Err(AppError::Validation(format!(
            "repository names may only contain letters, digits, '.', '-' and '_': {name}"
        )));
    }
    Ok(())
}

pub fn validate_topic(topic: &str) -> AppResult<()> {
    if topic.is_empty() || topic.len() > 50 {
        return Err(AppError::Validation(
            "topics must be 1-50 characters".into(),
        ));
    }
    if !topic
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
    {
        return Err(AppError::Validation(format!(
            "topics may only contain lowercase letters, digits and '-': {topic}"
        )));
    }
    Ok(())
}

pub fn validate_website(url: &str) -> AppResult<()> {
    let parsed = url::Url::parse(url)
        .map_err(|_| AppError::Validation(format!("invalid website URL: {url}")))?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(AppError::Validation(format!(
            "website URLs must be http(s): {url}"
        )));
    }
    Ok(())
}

pub fn validate_nsid(nsid: &str) -> AppResult<()> {
    let segments: Vec<&str> = nsid.split('.').collect();
    if segments.len() < 3 {
        return Err(AppError::Validation(format!("invalid collection: {nsid}")));
    }
    for segment in segments {
        if segment.is_empty()
            || !segment
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-')
        {
            return Err(AppError::Validation(format!("invalid collection: {nsid}")));
        }
    }
    Ok(())
}

pub fn validate_label_name(name: &str) -> AppResult<()> {
    if name.is_empty() || name.len() > 50 {
        return Err(AppError::Validation(
            "label names must be 1-50 characters".into(),
        ));
    }
    if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(AppError::Validation(format!("invalid label name: {name}")));
    }
    Ok(())
}

pub fn validate_label_definition(def: &LabelDefinitionRecord) -> AppResult<()> {
    validate_label_name(&def.name)?;
    if def.scope.is_empty() {
        return Err(AppError::Validation(
            "label definitions must name at least one scope collection".into(),
        ));
    }
    for collection in &def.scope {
        validate_nsid(collection)?;
    }
    if let Some(color) = &def.color {
        let hex = color.strip_prefix('#').unwrap_or(color);
        if hex.len() != 6 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(AppError::Validation(format!("invalid label color: {color}")));
        }
    }
    match def.value_type.concrete_type {
        ConcreteType::Null => {
            if !def.value_type.enum_values.is_empty() {
                return Err(AppError::Validation(
                    "null-valued labels cannot enumerate values".into(),
                ));
            }
            if def.value_type.format == ValueFormat::Did {
                return Err(AppError::Validation(
                    "null-valued labels cannot require the did format".into(),
                ));
            }
        }
        ConcreteType::Integer => {
            for v in &def.value_type.enum_values {
                if v.parse::<i64>().is_err() {
                    return Err(AppError::Validation(format!(
                        "enum value is not an integer: {v}"
                    )));
                }
            }
            if def.value_type.format == ValueFormat::Did {
                return Err(AppError::Validation(
                    "integer labels cannot require the did format".into(),
                ));
            }
        }
        ConcreteType::String => {}
    }
    Ok(())
}

/// Validate one label value against its definition.
pub fn validate_label_value(def: &LabelDefinitionRecord, value: &str) -> AppResult<()> {
    match def.value_type.concrete_type {
        ConcreteType::Null => {
            if !value.is_empty() {
                return Err(AppError::Validation(format!(
                    "label {} does not take a value",
                    def.name
                )));
            }
            return Ok(());
        }
        ConcreteType::Integer => {
            if value.parse::<i64>().is_err() {
                return Err(AppError::Validation(format!(
                    "label {} takes an integer value, got {value}",
                    def.name
                )));
            }
        }
        ConcreteType::String => {
            if value.is_empty() {
                return Err(AppError::Validation(format!(
                    "label {} requires a value",
                    def.name
                )));
            }
            if def.value_type.format == ValueFormat::Did {
                validate_did(value)?;
            }
        }
    }
    if !def.value_type.enum_values.is_empty()
        && !def.value_type.enum_values.iter().any(|v| v.as_str() == value)
    {
        return Err(AppError::Validation(format!(
            "label {} does not allow the value {value}",
            def.name
        )));
    }
    Ok(())
}

pub fn validate_rkey(rkey: &str) -> AppResult<()> {
    if rkey.is_empty() || rkey.len() > 512 || rkey == "." || rkey == ".." {
        return Err(AppError::Validation(format!("invalid rkey: {rkey}")));
    }
    if !rkey
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b'_' | b':' | b'~'))
    {
        return Err(AppError::Validation(format!("invalid rkey: {rkey}")));
    }
    Ok(())
}

/// Secret keys follow environment-variable conventions.
pub fn validate_secret_key(key: &str) -> AppResult<()> {
    if key.is_empty() || key.len() > 128 {
        return Err(AppError::Validation(
            "secret names must be 1-128 characters".into(),
        ));
    }
    let first = key.as_bytes()[0];
    if !(first.is_ascii_uppercase() || first == b'_') {
        return Err(AppError::Validation(format!("invalid secret name: {key}")));
    }
    if !key
        .bytes()
        .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || b == b'_')
    {
        return Err(AppError::Validation(format!("invalid secret name: {key}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LabelValueType;
    use chrono::Utc;

    fn def(concrete: ConcreteType, format: ValueFormat, enums: &[&str]) -> LabelDefinitionRecord {
        LabelDefinitionRecord {
            name: "status".into(),
            value_type: LabelValueType {
                concrete_type: concrete,
                format,
                enum_values: enums.iter().map(|s| s.to_string()).collect(),
            },
            scope: vec!["sh.tangled.repo".into()],
            color: None,
            multiple: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn handles() {
        assert!(validate_handle("alice.example.com").is_ok());
        assert!(validate_handle("a-b.tld").is_ok());
        assert!(validate_handle("alice").is_err());
        assert!(validate_handle("Alice.example.com").is_err());
        assert!(validate_handle("-alice.example.com").is_err());
        assert!(validate_handle("").is_err());
    }

    #[test]
    fn dids() {
        assert!(validate_did("did:plc:44ybard66vv644n2yxrkungu").is_ok());
        assert!(validate_did("did:web:knot.example.com").is_ok());
        assert!(validate_did("plc:nope").is_err());
        assert!(validate_did("did:plc:").is_err());
    }

    #[test]
    fn repo_names() {
        assert!(validate_repo_name("demo").is_ok());
        assert!(validate_repo_name("my-repo_2.x").is_ok());
        assert!(validate_repo_name(".hidden").is_err());
        assert!(validate_repo_name("a/b").is_err());
        assert!(validate_repo_name("").is_err());
    }

    #[test]
    fn topics() {
        assert!(validate_topic("rust").is_ok());
        assert!(validate_topic("web-dev").is_ok());
        assert!(validate_topic("Has Space").is_err());
    }

    #[test]
    fn enum_labels_restrict_values() {
        let d = def(ConcreteType::String, ValueFormat::Any, &["open", "closed"]);
        assert!(validate_label_value(&d, "open").is_ok());
        assert!(validate_label_value(&d, "wontfix").is_err());
    }

    #[test]
    fn null_labels_take_no_value() {
        let d = def(ConcreteType::Null, ValueFormat::Any, &[]);
        assert!(validate_label_value(&d, "").is_ok());
        assert!(validate_label_value(&d, "x").is_err());
    }

    #[test]
    fn integer_labels_parse() {
        let d = def(ConcreteType::Integer, ValueFormat::Any, &[]);
        assert!(validate_label_value(&d, "42").is_ok());
        assert!(validate_label_value(&d, "-7").is_ok());
        assert!(validate_label_value(&d, "4.2").is_err());
    }

    #[test]
    fn did_format_labels() {
        let d = def(ConcreteType::String, ValueFormat::Did, &[]);
        assert!(validate_label_value(&d, "did:plc:abc123").is_ok());
        assert!(validate_label_value(&d, "alice").is_err());
    }

    #[test]
    fn definition_consistency() {
        let bad = def(ConcreteType::Null, ValueFormat::Any, &["x"]);
        assert!(validate_label_definition(&bad).is_err());
        let bad = def(ConcreteType::Integer, ValueFormat::Any, &["abc"]);
        assert!(validate_label_definition(&bad).is_err());
        let good = def(ConcreteType::String, ValueFormat::Any, &["open"]);
        assert!(validate_label_definition(&good).is_ok());
    }

    #[test]
    fn secret_keys() {
        assert!(validate_secret_key("DEPLOY_TOKEN").is_ok());
        assert!(validate_secret_key("_PRIVATE").is_ok());
        assert!(validate_secret_key("lowercase").is_err());
        assert!(validate_secret_key("1LEADING").is_err());
    }
}
