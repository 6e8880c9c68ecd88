//! Ordered field mutations applied to a record before serialization.
//!
//! One primitive, insert-or-find by ascending tag, carries the three
//! server-side annotations: system identifier (999), match-key values (99X)
//! and recomputed holdings locations (852).

use serde_json::Value;

use crate::marc::{CanonicalRecord, Field, Subfield};

/// Find the data field with an exactly matching tag, or insert a new empty
/// one at the position preserving ascending tag order, and return its
/// subfield list for appending.
pub fn merge_field<'a>(
    record: &'a mut CanonicalRecord,
    tag: &str,
    ind1: char,
    ind2: char,
) -> &'a mut Vec<Subfield> {
    let mut insert_at = record.fields.len();
    let mut existing = None;
    for (i, field) in record.fields.iter().enumerate() {
        match tag.cmp(field.tag()) {
            std::cmp::Ordering::Equal => {
                if matches!(field, Field::Data { .. }) {
                    existing = Some(i);
                } else {
                    // Control field with the same tag: insert the data
                    // field right after it.
                    insert_at = i + 1;
                }
                break;
            }
            std::cmp::Ordering::Less => {
                insert_at = i;
                break;
            }
            std::cmp::Ordering::Greater => {}
        }
    }
    if let Some(i) = existing {
        match &mut record.fields[i] {
            Field::Data { subfields, .. } => return subfields,
            _ => unreachable!(),
        }
    }
    record.fields.insert(
        insert_at,
        Field::Data {
            tag: tag.to_string(),
            ind1,
            ind2,
            subfields: Vec::new(),
        },
    );
    match &mut record.fields[insert_at] {
        Field::Data { subfields, .. } => subfields,
        _ => unreachable!(),
    }
}

/// Attach the harvest identifier as tag 999 subfield `i`.
pub fn add_identifier(record: &mut CanonicalRecord, identifier: &str) {
    let subfields = merge_field(record, "999", ' ', ' ');
    subfields.push(Subfield::new('i', identifier));
}

/// Attach match-key values as tag 99X, one subfield `a` per value, in the
/// order storage returned them.
pub fn add_match_values(record: &mut CanonicalRecord, values: &[String]) {
    let subfields = merge_field(record, "99X", ' ', ' ');
    for value in values {
        subfields.push(Subfield::new('a', value.clone()));
    }
}

/// Replace the holdings location field (tag 852) wholesale with one
/// subfield `b` per permanent location found in the member inventory
/// payloads. Holdings are recomputed fully on every harvest read, so the
/// existing list is cleared, never appended to.
pub fn set_holdings(record: &mut CanonicalRecord, inventories: &[&Value]) {
    let mut locations = Vec::new();
    for inventory in inventories {
        let Some(holdings) = inventory.get("holdingsRecords").and_then(Value::as_array) else {
            continue;
        };
        for holding in holdings {
            // Items arriving through the XML-to-JSON mapping are wrapped in
            // a single-key object named after the item element.
            let holding = if holding.get("permanentLocationDeref").is_some() {
                holding
            } else {
                holding
                    .as_object()
                    .filter(|o| o.len() == 1)
                    .and_then(|o| o.values().next())
                    .unwrap_or(holding)
            };
            if let Some(location) = holding
                .get("permanentLocationDeref")
                .and_then(Value::as_str)
            {
                locations.push(location.to_string());
            }
        }
    }
    let subfields = merge_field(record, "852", '0', ' ');
    subfields.clear();
    for location in locations {
        subfields.push(Subfield::new('b', location));
    }
}
