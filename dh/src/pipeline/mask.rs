//! Mask stage
//!
//! Applies masking template bindings. Masked output always carries the
//! field's declared data type; pseudonyms are deterministic under the
//! per-task salt so the same input always maps to the same stand-in.

use serde_json::Value;
use sha2::{Digest, Sha256};

use super::batch::RecordBatch;
use crate::domain::{DataType, Field, MaskAction, MaskingRule, canonical_json};
use crate::error::SyncError;

/// Apply the enabled masking rules to a batch
pub fn apply_rules(
    batch: &RecordBatch,
    rules: &[MaskingRule],
    fields: &[Field],
    salt: &str,
) -> Result<RecordBatch, SyncError> {
    let enabled: Vec<&MaskingRule> = rules.iter().filter(|r| r.enabled).collect();
    if enabled.is_empty() {
        return Ok(batch.clone());
    }

    let declared_type = |name: &str| {
        fields
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.data_type)
            .unwrap_or(DataType::String)
    };

    let mut rows = batch.rows.clone();
    for rule in enabled {
        let data_type = declared_type(&rule.field);
        for row in rows.iter_mut() {
            let Some(value) = row.get(&rule.field) else { continue };
            if value.is_null() {
                continue;
            }
            let masked = mask_value(&rule.action, value, data_type, salt)?;
            row.insert(rule.field.clone(), masked);
        }
    }
    Ok(batch.with_rows(rows))
}

fn mask_value(action: &MaskAction, value: &Value, data_type: DataType, salt: &str) -> Result<Value, SyncError> {
    match action {
        MaskAction::Mask {
            keep_prefix,
            keep_suffix,
            mask_char,
        } => match value.as_str() {
            Some(s) => Ok(Value::String(char_mask(s, *keep_prefix, *keep_suffix, *mask_char))),
            // Only strings can be partially blanked; other types get a
            // deterministic stand-in so the declared type survives
            None => Ok(pseudonym(value, data_type, salt)),
        },
        MaskAction::Replace { value: replacement } => data_type
            .coerce(replacement)
            .map_err(|e| SyncError::Config(format!("mask replacement does not fit declared type: {e}"))),
        MaskAction::Encrypt => match data_type {
            DataType::String | DataType::Json => Ok(Value::String(digest_hex(value, salt))),
            _ => Ok(pseudonym(value, data_type, salt)),
        },
        MaskAction::Pseudonymize => Ok(pseudonym(value, data_type, salt)),
    }
}

fn char_mask(s: &str, keep_prefix: usize, keep_suffix: usize, mask_char: char) -> String {
    let chars: Vec<char> = s.chars().collect();
    if keep_prefix + keep_suffix >= chars.len() {
        return mask_char.to_string().repeat(chars.len());
    }
    let mut out = String::with_capacity(s.len());
    for (i, c) in chars.iter().enumerate() {
        if i < keep_prefix || i >= chars.len() - keep_suffix {
            out.push(*c);
        } else {
            out.push(mask_char);
        }
    }
    out
}

fn digest_bytes(value: &Value, salt: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(canonical_json(value).as_bytes());
    hasher.finalize().into()
}

fn digest_hex(value: &Value, salt: &str) -> String {
    hex::encode(digest_bytes(value, salt))
}

/// Deterministic stand-in value of the declared type
fn pseudonym(value: &Value, data_type: DataType, salt: &str) -> Value {
    let digest = digest_bytes(value, salt);
    let head = u64::from_be_bytes(digest[..8].try_into().expect("8 bytes"));
    match data_type {
        DataType::String => Value::String(format!("anon_{}", &hex::encode(digest)[..16])),
        DataType::Integer => Value::from((head & (i64::MAX as u64)) as i64),
        DataType::Float => serde_json::Number::from_f64((head as f64) / (u64::MAX as f64))
            .map(Value::Number)
            .unwrap_or(Value::Null),
        DataType::Boolean => Value::Bool(head & 1 == 1),
        DataType::Timestamp => {
            // Stable synthetic instant in a plausible range (2000-2031)
            let secs = 946_684_800 + (head % 1_000_000_000) as i64;
            match chrono::DateTime::from_timestamp(secs, 0) {
                Some(dt) => Value::String(dt.to_rfc3339()),
                None => Value::Null,
            }
        }
        DataType::Json => Value::String(format!("anon_{}", &hex::encode(digest)[..16])),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn batch(rows: Vec<Vec<(&str, Value)>>) -> RecordBatch {
        RecordBatch::new(
            "if-1",
            rows.into_iter()
                .map(|pairs| pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
                .collect(),
        )
    }

    fn string_field(name: &str) -> Field {
        Field::new(name, DataType::String)
    }

    #[test]
    fn test_char_mask_keeps_ends() {
        assert_eq!(char_mask("4111111111111111", 4, 4, '*'), "4111********1111");
        // Degenerate keep window blanks everything
        assert_eq!(char_mask("abc", 2, 2, '*'), "***");
    }

    #[test]
    fn test_mask_rule_applies() {
        let rules = vec![MaskingRule::new(
            "card",
            MaskAction::Mask {
                keep_prefix: 0,
                keep_suffix: 4,
                mask_char: '*',
            },
        )];
        let fields = vec![string_field("card")];
        let b = batch(vec![vec![("card", json!("4111111111111111"))]]);
        let out = apply_rules(&b, &rules, &fields, "salt").unwrap();
        assert_eq!(out.rows[0]["card"], json!("************1111"));
    }

    #[test]
    fn test_pseudonymize_deterministic_per_salt() {
        let rules = vec![MaskingRule::new("email", MaskAction::Pseudonymize)];
        let fields = vec![string_field("email")];
        let b = batch(vec![vec![("email", json!("ada@example.com"))]]);

        let a = apply_rules(&b, &rules, &fields, "salt-1").unwrap();
        let b2 = apply_rules(&b, &rules, &fields, "salt-1").unwrap();
        let c = apply_rules(&b, &rules, &fields, "salt-2").unwrap();

        assert_eq!(a.rows[0]["email"], b2.rows[0]["email"]);
        assert_ne!(a.rows[0]["email"], c.rows[0]["email"]);
        assert!(a.rows[0]["email"].as_str().unwrap().starts_with("anon_"));
    }

    #[test]
    fn test_pseudonymize_preserves_integer_type() {
        let rules = vec![MaskingRule::new("ssn", MaskAction::Pseudonymize)];
        let fields = vec![Field::new("ssn", DataType::Integer)];
        let b = batch(vec![vec![("ssn", json!(123456789))]]);
        let out = apply_rules(&b, &rules, &fields, "s").unwrap();
        assert!(out.rows[0]["ssn"].is_i64());
        assert!(out.rows[0]["ssn"].as_i64().unwrap() >= 0);
    }

    #[test]
    fn test_pseudonymize_timestamp_stays_timestamp() {
        let rules = vec![MaskingRule::new("born", MaskAction::Pseudonymize)];
        let fields = vec![Field::new("born", DataType::Timestamp)];
        let b = batch(vec![vec![("born", json!("1990-01-01T00:00:00Z"))]]);
        let out = apply_rules(&b, &rules, &fields, "s").unwrap();
        let s = out.rows[0]["born"].as_str().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(s).is_ok());
    }

    #[test]
    fn test_replace_coerces_to_declared_type() {
        let rules = vec![MaskingRule::new("age", MaskAction::Replace { value: json!("0") })];
        let fields = vec![Field::new("age", DataType::Integer)];
        let b = batch(vec![vec![("age", json!(44))]]);
        let out = apply_rules(&b, &rules, &fields, "s").unwrap();
        assert_eq!(out.rows[0]["age"], json!(0));
    }

    #[test]
    fn test_replace_type_mismatch_rejected() {
        let rules = vec![MaskingRule::new("age", MaskAction::Replace { value: json!("redacted") })];
        let fields = vec![Field::new("age", DataType::Integer)];
        let b = batch(vec![vec![("age", json!(44))]]);
        assert!(apply_rules(&b, &rules, &fields, "s").is_err());
    }

    #[test]
    fn test_null_values_untouched() {
        let rules = vec![MaskingRule::new("email", MaskAction::Pseudonymize)];
        let fields = vec![string_field("email")];
        let b = batch(vec![vec![("email", Value::Null)]]);
        let out = apply_rules(&b, &rules, &fields, "s").unwrap();
        assert!(out.rows[0]["email"].is_null());
    }

    #[test]
    fn test_encrypt_hexes_strings() {
        let rules = vec![MaskingRule::new("note", MaskAction::Encrypt)];
        let fields = vec![string_field("note")];
        let b = batch(vec![vec![("note", json!("secret"))]]);
        let out = apply_rules(&b, &rules, &fields, "s").unwrap();
        let s = out.rows[0]["note"].as_str().unwrap();
        assert_eq!(s.len(), 64);
    }
}
