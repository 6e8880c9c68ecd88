//! Canonical MARC record model and its JSON form.
//!
//! The canonical JSON form is MARC-in-JSON as exchanged on the ingest wire:
//! `{"leader": "...", "fields": [{"001": "v"}, {"245": {"ind1": "1",
//! "ind2": " ", "subfields": [{"a": "v"}]}}]}`. Field order is significant
//! and is kept in ascending tag order by the assembler.

pub mod assembler;
pub mod binary;
pub mod fragment;
pub mod xml;

use serde_json::{json, Map, Value};

use crate::error::{Error, Result};

/// A single subfield of a data field. Codes may repeat; order is preserved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subfield {
    pub code: char,
    pub value: String,
}

impl Subfield {
    pub fn new(code: char, value: impl Into<String>) -> Self {
        Subfield {
            code,
            value: value.into(),
        }
    }
}

/// A field of a MARC record: control fields (tags below "010") carry a plain
/// value, data fields carry indicators and subfields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field {
    Control {
        tag: String,
        value: String,
    },
    Data {
        tag: String,
        ind1: char,
        ind2: char,
        subfields: Vec<Subfield>,
    },
}

impl Field {
    pub fn tag(&self) -> &str {
        match self {
            Field::Control { tag, .. } | Field::Data { tag, .. } => tag,
        }
    }
}

/// A leader plus ordered fields. Instances are transient: built per source
/// record, annotated, serialized and dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CanonicalRecord {
    pub leader: String,
    pub fields: Vec<Field>,
}

impl CanonicalRecord {
    pub fn new(leader: impl Into<String>) -> Self {
        CanonicalRecord {
            leader: leader.into(),
            fields: Vec::new(),
        }
    }

    /// Serialize to the canonical JSON form. The `fields` array is omitted
    /// entirely when the record has no fields.
    pub fn to_json(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("leader".to_string(), json!(self.leader));
        if !self.fields.is_empty() {
            let fields: Vec<Value> = self.fields.iter().map(field_to_json).collect();
            obj.insert("fields".to_string(), Value::Array(fields));
        }
        Value::Object(obj)
    }

    /// Parse the canonical JSON form. A missing `fields` array yields a
    /// leader-only record; a malformed field entry fails with
    /// [`Error::InvalidFieldTag`].
    pub fn from_json(value: &Value) -> Result<Self> {
        let leader = value
            .get("leader")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let mut record = CanonicalRecord::new(leader);
        if let Some(fields) = value.get("fields") {
            let fields = fields
                .as_array()
                .ok_or_else(|| Error::InvalidFieldTag("fields is not an array".into()))?;
            for field in fields {
                record.fields.push(field_from_json(field)?);
            }
        }
        Ok(record)
    }
}

fn field_to_json(field: &Field) -> Value {
    match field {
        Field::Control { tag, value } => json!({ tag.as_str(): value }),
        Field::Data {
            tag,
            ind1,
            ind2,
            subfields,
        } => {
            let subfields: Vec<Value> = subfields
                .iter()
                .map(|sf| json!({ sf.code.to_string(): sf.value }))
                .collect();
            json!({ tag.as_str(): {
                "ind1": ind1.to_string(),
                "ind2": ind2.to_string(),
                "subfields": subfields,
            }})
        }
    }
}

fn field_from_json(field: &Value) -> Result<Field> {
    let obj = field
        .as_object()
        .filter(|o| o.len() == 1)
        .ok_or_else(|| Error::InvalidFieldTag(field.to_string()))?;
    let (tag, content) = obj.iter().next().expect("one entry");
    match content {
        Value::String(value) => Ok(Field::Control {
            tag: tag.clone(),
            value: value.clone(),
        }),
        Value::Object(content) => {
            let indicator = |key: &str| -> char {
                content
                    .get(key)
                    .and_then(Value::as_str)
                    .and_then(|s| s.chars().next())
                    .unwrap_or(' ')
            };
            let mut subfields = Vec::new();
            if let Some(list) = content.get("subfields").and_then(Value::as_array) {
                for sf in list {
                    let sf = sf
                        .as_object()
                        .filter(|o| o.len() == 1)
                        .ok_or_else(|| Error::InvalidFieldTag(format!("subfield {}", sf)))?;
                    let (code, value) = sf.iter().next().expect("one entry");
                    subfields.push(Subfield {
                        code: code.chars().next().unwrap_or(' '),
                        value: value.as_str().unwrap_or_default().to_string(),
                    });
                }
            }
            Ok(Field::Data {
                tag: tag.clone(),
                ind1: indicator("ind1"),
                ind2: indicator("ind2"),
                subfields,
            })
        }
        _ => Err(Error::InvalidFieldTag(tag.clone())),
    }
}
