//! Streaming extraction of self-contained XML fragments.
//!
//! Pulls the serialized subtree of the next element with a requested local
//! name out of a forward-only token stream, without buffering the enclosing
//! document. Only local names, attributes and character data are dealt with;
//! the one namespace concession is that the outermost captured element
//! re-declares its effective default namespace URI.

use std::io::BufRead;

use quick_xml::events::{BytesEnd, BytesStart, Event};
use quick_xml::name::ResolveResult;
use quick_xml::NsReader;

use crate::error::{Error, Result};
use crate::marc::xml::encode_xml_text;

/// Restartable fragment extractor over a positioned XML token stream.
/// Each call to [`FragmentExtractor::next_fragment`] advances the cursor,
/// so successive calls yield successive sibling fragments.
pub struct FragmentExtractor<R: BufRead> {
    reader: NsReader<R>,
    buf: Vec<u8>,
}

impl<R: BufRead> FragmentExtractor<R> {
    pub fn new(inner: R) -> Self {
        FragmentExtractor {
            reader: NsReader::from_reader(inner),
            buf: Vec::new(),
        }
    }

    /// Scan forward to the next element whose local name equals
    /// `local_name` and return its verbatim serialization. Nesting of
    /// same-named descendants is tracked, so the fragment spans them.
    /// Returns `Ok(None)` when the stream ends without a further match.
    pub fn next_fragment(&mut self, local_name: &str) -> Result<Option<String>> {
        let mut out = String::new();
        let mut depth = 0usize;
        loop {
            self.buf.clear();
            match self.reader.read_event_into(&mut self.buf)? {
                Event::Start(e) => {
                    if depth > 0 {
                        depth += 1;
                        write_start(&self.reader, &e, false, &mut out)?;
                    } else if e.local_name().as_ref() == local_name.as_bytes() {
                        depth = 1;
                        write_start(&self.reader, &e, true, &mut out)?;
                    }
                }
                Event::Empty(e) => {
                    if depth > 0 {
                        write_start(&self.reader, &e, false, &mut out)?;
                        write_empty_end(&e, &mut out);
                    } else if e.local_name().as_ref() == local_name.as_bytes() {
                        write_start(&self.reader, &e, true, &mut out)?;
                        write_empty_end(&e, &mut out);
                        return Ok(Some(out));
                    }
                }
                Event::End(e) => {
                    if depth > 0 {
                        depth -= 1;
                        write_end(&e, &mut out);
                        if depth == 0 {
                            return Ok(Some(out));
                        }
                    }
                }
                Event::Text(t) => {
                    if depth > 0 {
                        out.push_str(&encode_xml_text(&t.unescape()?));
                    }
                }
                Event::CData(t) => {
                    if depth > 0 {
                        out.push_str(&encode_xml_text(&String::from_utf8_lossy(
                            &t.into_inner(),
                        )));
                    }
                }
                Event::Eof => {
                    return if depth == 0 {
                        Ok(None)
                    } else {
                        Err(Error::Xml("stream ended inside fragment".into()))
                    };
                }
                // Prologue (declaration, DOCTYPE), comments and processing
                // instructions are not structural.
                _ => {}
            }
        }
    }
}

fn write_start<R: BufRead>(
    reader: &NsReader<R>,
    e: &BytesStart,
    outermost: bool,
    out: &mut String,
) -> Result<()> {
    out.push('<');
    out.push_str(&String::from_utf8_lossy(e.local_name().as_ref()));
    if outermost {
        let (resolution, _) = reader.resolve_element(e.name());
        if let ResolveResult::Bound(ns) = resolution {
            out.push_str(" xmlns=\"");
            out.push_str(&encode_xml_text(&String::from_utf8_lossy(ns.as_ref())));
            out.push('"');
        }
    }
    for attr in e.attributes() {
        let attr = attr.map_err(|e| Error::Xml(e.to_string()))?;
        // Namespace declarations are re-derived, not copied.
        if attr.key.as_ref() == b"xmlns" || attr.key.prefix().map_or(false, |p| p.as_ref() == b"xmlns")
        {
            continue;
        }
        out.push(' ');
        out.push_str(&String::from_utf8_lossy(attr.key.local_name().as_ref()));
        out.push_str("=\"");
        out.push_str(&encode_xml_text(&attr.unescape_value()?));
        out.push('"');
    }
    out.push('>');
    Ok(())
}

fn write_end(e: &BytesEnd, out: &mut String) {
    out.push_str("</");
    out.push_str(&String::from_utf8_lossy(e.local_name().as_ref()));
    out.push('>');
}

fn write_empty_end(e: &BytesStart, out: &mut String) {
    out.push_str("</");
    out.push_str(&String::from_utf8_lossy(e.local_name().as_ref()));
    out.push('>');
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor(xml: &'static str) -> FragmentExtractor<&'static [u8]> {
        FragmentExtractor::new(xml.as_bytes())
    }

    #[test]
    fn fragment_fidelity_with_namespaces() {
        let mut ex = extractor(
            "<a xmlns=\"http://foo.com\">\n<b type=\"1\"><c/></b><b xmlns=\"http://bar.com\"/></a>",
        );
        assert_eq!(
            ex.next_fragment("b").unwrap().unwrap(),
            "<b xmlns=\"http://foo.com\" type=\"1\"><c></c></b>"
        );
        assert_eq!(
            ex.next_fragment("b").unwrap().unwrap(),
            "<b xmlns=\"http://bar.com\"></b>"
        );
        assert!(ex.next_fragment("b").unwrap().is_none());
    }

    #[test]
    fn sibling_records_are_pulled_one_at_a_time() {
        let first = "<record>\n <leader>1234&lt;&gt;&quot;&apos;</leader>\n   <record>abc</record> </record>";
        let second = "<record><controlfield tag=\"001\">a1</controlfield></record>";
        let xml = format!("<collection>\n{}To be <ignored/>{}\n</collection>", first, second);
        let mut ex = FragmentExtractor::new(std::io::Cursor::new(xml.into_bytes()));
        let doc1 = ex.next_fragment("record").unwrap().unwrap();
        // Nested same-named element is spanned, not terminated at.
        assert!(doc1.contains("<record>abc</record>"));
        assert!(doc1.ends_with("</record>"));
        let doc2 = ex.next_fragment("record").unwrap().unwrap();
        assert_eq!(doc2, second);
        assert!(ex.next_fragment("record").unwrap().is_none());
    }

    #[test]
    fn doctype_prologue_is_not_structural() {
        let mut ex = extractor("<!DOCTYPE tag []><tag>x</tag>");
        assert_eq!(ex.next_fragment("tag").unwrap().unwrap(), "<tag>x</tag>");
    }

    #[test]
    fn no_match_returns_none_not_error() {
        let mut ex = extractor("<tag>x</tag>");
        assert!(ex.next_fragment("other").unwrap().is_none());
    }
}
