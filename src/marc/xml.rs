//! MARC-XML parsing and serialization, plus the inventory XML to JSON
//! mapping used for transform pipeline output.
//!
//! Element matching is namespace-agnostic: only local names are considered.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::marc::{CanonicalRecord, Field, Subfield};

pub const MARCXML_NAMESPACE: &str = "http://www.loc.gov/MARC21/slim";

/// Escape text for inclusion in XML element content or attribute values.
pub fn encode_xml_text(s: &str) -> String {
    let mut res = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '<' => res.push_str("&lt;"),
            '>' => res.push_str("&gt;"),
            '&' => res.push_str("&amp;"),
            '"' => res.push_str("&quot;"),
            '\'' => res.push_str("&apos;"),
            _ => res.push(c),
        }
    }
    res
}

/// Parse a single MARC-XML `<record>`, or a `<collection>` wrapping exactly
/// one, into a canonical record.
///
/// A collection with more than one record fails with
/// [`Error::MultipleRecords`]; any other shape fails with
/// [`Error::NoRecordFound`]. A `<record>` nested inside another `<record>`
/// is field-level content, not a second record.
pub fn marcxml_to_record(xml: &str) -> Result<CanonicalRecord> {
    let mut reader = Reader::from_str(xml);
    let mut record: Option<CanonicalRecord> = None;
    let mut in_collection = false;
    loop {
        match reader.read_event()? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"record" => {
                    if record.is_some() {
                        return Err(Error::MultipleRecords);
                    }
                    record = Some(parse_record(&mut reader)?);
                }
                b"collection" if !in_collection && record.is_none() => {
                    in_collection = true;
                }
                _ => skip_element(&mut reader)?,
            },
            Event::Empty(e) => {
                if e.local_name().as_ref() == b"record" {
                    if record.is_some() {
                        return Err(Error::MultipleRecords);
                    }
                    record = Some(CanonicalRecord::default());
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    record.ok_or(Error::NoRecordFound)
}

fn parse_record(reader: &mut Reader<&[u8]>) -> Result<CanonicalRecord> {
    let mut record = CanonicalRecord::default();
    loop {
        match reader.read_event()? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"leader" => record.leader = read_text(reader)?,
                b"controlfield" => {
                    let tag = attribute(&e, b"tag")?.unwrap_or_default();
                    let value = read_text(reader)?;
                    record.fields.push(Field::Control { tag, value });
                }
                b"datafield" => {
                    record.fields.push(parse_datafield(reader, &e, false)?);
                }
                _ => skip_element(reader)?,
            },
            Event::Empty(e) => match e.local_name().as_ref() {
                b"controlfield" => {
                    let tag = attribute(&e, b"tag")?.unwrap_or_default();
                    record.fields.push(Field::Control {
                        tag,
                        value: String::new(),
                    });
                }
                b"datafield" => {
                    record.fields.push(parse_datafield(reader, &e, true)?);
                }
                _ => {}
            },
            Event::End(_) => return Ok(record),
            Event::Eof => return Err(Error::Xml("unexpected end of record".into())),
            _ => {}
        }
    }
}

fn parse_datafield(reader: &mut Reader<&[u8]>, e: &BytesStart, empty: bool) -> Result<Field> {
    let tag = attribute(e, b"tag")?.unwrap_or_default();
    let indicator = |name: &[u8]| -> Result<char> {
        Ok(attribute(e, name)?
            .and_then(|s| s.chars().next())
            .unwrap_or(' '))
    };
    let ind1 = indicator(b"ind1")?;
    let ind2 = indicator(b"ind2")?;
    let mut subfields = Vec::new();
    if !empty {
        loop {
            match reader.read_event()? {
                Event::Start(e) => {
                    if e.local_name().as_ref() == b"subfield" {
                        let code = attribute(&e, b"code")?
                            .and_then(|s| s.chars().next())
                            .unwrap_or(' ');
                        subfields.push(Subfield {
                            code,
                            value: read_text(reader)?,
                        });
                    } else {
                        skip_element(reader)?;
                    }
                }
                Event::Empty(e) => {
                    if e.local_name().as_ref() == b"subfield" {
                        let code = attribute(&e, b"code")?
                            .and_then(|s| s.chars().next())
                            .unwrap_or(' ');
                        subfields.push(Subfield::new(code, ""));
                    }
                }
                Event::End(_) => break,
                Event::Eof => return Err(Error::Xml("unexpected end of datafield".into())),
                _ => {}
            }
        }
    }
    Ok(Field::Data {
        tag,
        ind1,
        ind2,
        subfields,
    })
}

/// Collect unescaped character data until the current element closes.
/// Nested element tags are ignored, their text is kept (the original uses
/// DOM `getTextContent` semantics here).
fn read_text(reader: &mut Reader<&[u8]>) -> Result<String> {
    let mut out = String::new();
    let mut depth = 1usize;
    loop {
        match reader.read_event()? {
            Event::Start(_) => depth += 1,
            Event::End(_) => {
                depth -= 1;
                if depth == 0 {
                    return Ok(out);
                }
            }
            Event::Text(t) => out.push_str(&t.unescape()?),
            Event::CData(t) => out.push_str(&String::from_utf8_lossy(&t.into_inner())),
            Event::Eof => return Err(Error::Xml("unexpected end of element".into())),
            _ => {}
        }
    }
}

fn skip_element(reader: &mut Reader<&[u8]>) -> Result<()> {
    let mut depth = 1usize;
    loop {
        match reader.read_event()? {
            Event::Start(_) => depth += 1,
            Event::End(_) => {
                depth -= 1;
                if depth == 0 {
                    return Ok(());
                }
            }
            Event::Eof => return Err(Error::Xml("unexpected end of element".into())),
            _ => {}
        }
    }
}

fn attribute(e: &BytesStart, name: &[u8]) -> Result<Option<String>> {
    for attr in e.attributes() {
        let attr = attr.map_err(|e| Error::Xml(e.to_string()))?;
        if attr.key.local_name().as_ref() == name {
            return Ok(Some(attr.unescape_value()?.into_owned()));
        }
    }
    Ok(None)
}

/// Serialize a canonical record back to MARC-XML with the attribute shape
/// the parser accepts, so parse/serialize round-trips.
pub fn record_to_marcxml(record: &CanonicalRecord) -> String {
    let mut out = String::new();
    out.push_str(&format!("<record xmlns=\"{}\">\n", MARCXML_NAMESPACE));
    out.push_str(&format!(
        "  <leader>{}</leader>\n",
        encode_xml_text(&record.leader)
    ));
    for field in &record.fields {
        match field {
            Field::Control { tag, value } => {
                out.push_str(&format!(
                    "  <controlfield tag=\"{}\">{}</controlfield>\n",
                    encode_xml_text(tag),
                    encode_xml_text(value)
                ));
            }
            Field::Data {
                tag,
                ind1,
                ind2,
                subfields,
            } => {
                out.push_str(&format!(
                    "  <datafield tag=\"{}\" ind1=\"{}\" ind2=\"{}\">\n",
                    encode_xml_text(tag),
                    encode_xml_text(&ind1.to_string()),
                    encode_xml_text(&ind2.to_string())
                ));
                for sf in subfields {
                    out.push_str(&format!(
                        "    <subfield code=\"{}\">{}</subfield>\n",
                        encode_xml_text(&sf.code.to_string()),
                        encode_xml_text(&sf.value)
                    ));
                }
                out.push_str("  </datafield>\n");
            }
        }
    }
    out.push_str("</record>");
    out
}

/// Map inventory XML (transform pipeline output) to JSON.
///
/// The root element's content becomes the result object. An element whose
/// content is an `<arr>` maps to a JSON array, each item element becoming a
/// single-key object. An element named `original` is dropped wholesale (it
/// carries the untransformed source record). Text-only elements become
/// strings.
pub fn inventory_xml_to_json(xml: &str) -> Result<Value> {
    let mut reader = Reader::from_str(xml);
    loop {
        match reader.read_event()? {
            Event::Start(_) => {
                let value = json_element_content(&mut reader)?;
                return match value {
                    Value::Object(_) => Ok(value),
                    _ => Err(Error::Xml("inventory XML is not an object".into())),
                };
            }
            Event::Empty(_) => return Ok(Value::Object(Map::new())),
            Event::Eof => return Err(Error::Xml("no inventory element found".into())),
            _ => {}
        }
    }
}

fn json_element_content(reader: &mut Reader<&[u8]>) -> Result<Value> {
    let mut object: Option<Map<String, Value>> = None;
    let mut array: Option<Vec<Value>> = None;
    let mut text = String::new();
    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                if name == "original" {
                    skip_element(reader)?;
                } else if name == "arr" {
                    array = Some(json_array_items(reader)?);
                } else {
                    let value = json_element_content(reader)?;
                    object.get_or_insert_with(Map::new).insert(name, value);
                }
            }
            Event::Empty(e) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                if name == "arr" {
                    array = Some(Vec::new());
                } else if name != "original" {
                    object.get_or_insert_with(Map::new).insert(name, Value::Null);
                }
            }
            Event::Text(t) => text.push_str(&t.unescape()?),
            Event::End(_) => break,
            Event::Eof => return Err(Error::Xml("unexpected end of element".into())),
            _ => {}
        }
    }
    if let Some(items) = array {
        return Ok(Value::Array(items));
    }
    if let Some(map) = object {
        return Ok(Value::Object(map));
    }
    let trimmed = text.trim();
    if trimmed.is_empty() {
        Ok(Value::Null)
    } else {
        Ok(Value::String(text))
    }
}

fn json_array_items(reader: &mut Reader<&[u8]>) -> Result<Vec<Value>> {
    let mut items = Vec::new();
    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                let value = json_element_content(reader)?;
                let mut item = Map::new();
                item.insert(name, value);
                items.push(Value::Object(item));
            }
            Event::Empty(e) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                let mut item = Map::new();
                item.insert(name, Value::Null);
                items.push(Value::Object(item));
            }
            Event::End(_) => return Ok(items),
            Event::Eof => return Err(Error::Xml("unexpected end of arr".into())),
            _ => {}
        }
    }
}
