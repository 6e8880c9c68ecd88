//! Pluggable match-key extraction.
//!
//! A method is resolved by name once, when a configuration is stored or
//! loaded, and then extracts ordered key strings from a record's payloads.
//! Failures are reported as [`Error::MatchKey`], never swallowed.

use serde_json::Value;

use crate::error::{Error, Result};
use crate::marc::CanonicalRecord;
use crate::marc::Field;

/// A configured match-key extraction capability.
pub trait MatchKeyMethod: Send + Sync {
    fn name(&self) -> &'static str;

    /// Apply method parameters. Called once per configuration.
    fn configure(&mut self, params: &Value) -> Result<()>;

    /// Extract ordered keys from the MARC payload (canonical JSON form) and
    /// the inventory payload.
    fn extract_keys(&self, marc_payload: &Value, inventory_payload: &Value)
        -> Result<Vec<String>>;
}

/// Resolve a method by name and configure it. Unknown names are a
/// configuration error.
pub fn method_for(name: &str, params: &Value) -> Result<Box<dyn MatchKeyMethod>> {
    let mut method: Box<dyn MatchKeyMethod> = match name {
        "marc-field" => Box::new(MarcFieldMethod::default()),
        _ => {
            return Err(Error::MatchKey(format!(
                "unknown match key method \"{}\"",
                name
            )))
        }
    };
    method.configure(params)?;
    Ok(method)
}

/// Extracts keys from one MARC field, configured as
/// `{"tag": "020", "subfield": "a"}`. For control field tags the
/// `subfield` parameter is ignored. Values are trimmed; empty values are
/// dropped.
#[derive(Default)]
pub struct MarcFieldMethod {
    tag: String,
    subfield: Option<char>,
}

impl MatchKeyMethod for MarcFieldMethod {
    fn name(&self) -> &'static str {
        "marc-field"
    }

    fn configure(&mut self, params: &Value) -> Result<()> {
        self.tag = params
            .get("tag")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::MatchKey("marc-field: missing \"tag\" parameter".into()))?
            .to_string();
        self.subfield = params
            .get("subfield")
            .and_then(Value::as_str)
            .and_then(|s| s.chars().next());
        if self.tag.as_str() >= "010" && self.subfield.is_none() {
            return Err(Error::MatchKey(
                "marc-field: data field tag needs a \"subfield\" parameter".into(),
            ));
        }
        Ok(())
    }

    fn extract_keys(&self, marc_payload: &Value, _inventory_payload: &Value) -> Result<Vec<String>> {
        let record = CanonicalRecord::from_json(marc_payload)
            .map_err(|e| Error::MatchKey(format!("marc payload: {}", e)))?;
        let mut keys = Vec::new();
        for field in &record.fields {
            match field {
                Field::Control { tag, value } if *tag == self.tag => {
                    push_trimmed(&mut keys, value);
                }
                Field::Data { tag, subfields, .. } if *tag == self.tag => {
                    for sf in subfields {
                        if Some(sf.code) == self.subfield {
                            push_trimmed(&mut keys, &sf.value);
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(keys)
    }
}

fn push_trimmed(keys: &mut Vec<String>, value: &str) {
    let trimmed = value.trim();
    if !trimmed.is_empty() {
        keys.push(trimmed.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_method_is_a_configuration_error() {
        assert!(matches!(
            method_for("jsonpath", &json!({})),
            Err(Error::MatchKey(_))
        ));
    }

    #[test]
    fn data_field_tag_requires_subfield() {
        assert!(method_for("marc-field", &json!({"tag": "020"})).is_err());
        assert!(method_for("marc-field", &json!({"tag": "020", "subfield": "a"})).is_ok());
        assert!(method_for("marc-field", &json!({"tag": "001"})).is_ok());
    }

    #[test]
    fn extracts_keys_in_field_order() {
        let method = method_for("marc-field", &json!({"tag": "020", "subfield": "a"})).unwrap();
        let marc = json!({
            "leader": "ldr",
            "fields": [
                {"001": "id1"},
                {"020": {"ind1": " ", "ind2": " ", "subfields": [
                    {"a": " 9780316769488 "}, {"q": "pbk"}, {"a": "0316769487"}
                ]}}
            ]
        });
        let keys = method.extract_keys(&marc, &json!({})).unwrap();
        assert_eq!(keys, vec!["9780316769488", "0316769487"]);
    }
}
