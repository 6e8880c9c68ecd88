//! Streaming reader for binary ISO 2709 MARC records.
//!
//! Records whose leader carries a blank character-coding-scheme flag are
//! legacy ANSEL/MARC-8 encoded: the flag is rewritten to `'a'` (UTF-8) on
//! output and field values are transliterated to Unicode while reading.

use std::io::Read;

use crate::error::{Error, Result};
use crate::marc::{CanonicalRecord, Field, Subfield};

const FIELD_TERMINATOR: u8 = 0x1E;
const SUBFIELD_DELIMITER: u8 = 0x1F;

/// Leader position of the character coding scheme.
const CODING_SCHEME_POS: usize = 9;

/// Reads one record at a time from a continuous binary stream.
pub struct BinaryReader<R: Read> {
    reader: R,
}

impl<R: Read> BinaryReader<R> {
    pub fn new(reader: R) -> Self {
        BinaryReader { reader }
    }

    /// Read the next record. `Ok(None)` signals a clean end of input;
    /// a malformed record is an error, never silently skipped.
    pub fn next_record(&mut self) -> Result<Option<CanonicalRecord>> {
        let mut leader = [0u8; 24];
        match self.reader.read_exact(&mut leader) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(Error::Io(e)),
        }

        let record_length = parse_digits(&leader[0..5])
            .ok_or_else(|| Error::MalformedBinaryRecord("bad record length".into()))?;
        let base_address = parse_digits(&leader[12..17])
            .ok_or_else(|| Error::MalformedBinaryRecord("bad base address".into()))?;
        if record_length < 25 || base_address < 25 || base_address > record_length {
            return Err(Error::MalformedBinaryRecord(format!(
                "inconsistent lengths: record {} base {}",
                record_length, base_address
            )));
        }

        let mut body = vec![0u8; record_length - 24];
        self.reader
            .read_exact(&mut body)
            .map_err(|_| Error::MalformedBinaryRecord("truncated record".into()))?;

        let legacy = leader[CODING_SCHEME_POS] == b' ';
        let mut leader_out = leader;
        if legacy {
            leader_out[CODING_SCHEME_POS] = b'a';
        }
        let mut record = CanonicalRecord::new(String::from_utf8_lossy(&leader_out).into_owned());

        let directory = &body[..base_address - 24];
        let data = &body[base_address - 24..];

        let mut pos = 0;
        while pos < directory.len() && directory[pos] != FIELD_TERMINATOR {
            if pos + 12 > directory.len() {
                return Err(Error::MalformedBinaryRecord(
                    "incomplete directory entry".into(),
                ));
            }
            let entry = &directory[pos..pos + 12];
            let tag = String::from_utf8_lossy(&entry[0..3]).into_owned();
            let length = parse_digits(&entry[3..7])
                .ok_or_else(|| Error::MalformedBinaryRecord(format!("field {}: bad length", tag)))?;
            let start = parse_digits(&entry[7..12])
                .ok_or_else(|| Error::MalformedBinaryRecord(format!("field {}: bad offset", tag)))?;
            pos += 12;

            let end = start + length;
            if end > data.len() {
                return Err(Error::MalformedBinaryRecord(format!(
                    "field {} exceeds data area",
                    tag
                )));
            }
            let mut content = &data[start..end];
            if content.last() == Some(&FIELD_TERMINATOR) {
                content = &content[..content.len() - 1];
            }
            record.fields.push(parse_field(tag, content, legacy)?);
        }

        Ok(Some(record))
    }
}

fn parse_field(tag: String, content: &[u8], legacy: bool) -> Result<Field> {
    if tag.as_str() < "010" {
        return Ok(Field::Control {
            tag,
            value: decode_text(content, legacy),
        });
    }
    if content.len() < 2 {
        return Err(Error::MalformedBinaryRecord(format!(
            "field {}: missing indicators",
            tag
        )));
    }
    let ind1 = content[0] as char;
    let ind2 = content[1] as char;
    let mut subfields = Vec::new();
    for chunk in content[2..].split(|b| *b == SUBFIELD_DELIMITER) {
        if chunk.is_empty() {
            continue;
        }
        subfields.push(Subfield {
            code: chunk[0] as char,
            value: decode_text(&chunk[1..], legacy),
        });
    }
    Ok(Field::Data {
        tag,
        ind1,
        ind2,
        subfields,
    })
}

fn parse_digits(bytes: &[u8]) -> Option<usize> {
    let s = std::str::from_utf8(bytes).ok()?;
    s.parse().ok()
}

fn decode_text(bytes: &[u8], legacy: bool) -> String {
    if legacy {
        ansel_to_unicode(bytes)
    } else {
        String::from_utf8_lossy(bytes).into_owned()
    }
}

/// Transliterate ANSEL (the MARC-8 extended Latin set) to Unicode.
///
/// ANSEL places combining diacritics before the base character; Unicode puts
/// them after, so pending diacritics are held back and emitted once the base
/// character has been pushed.
pub fn ansel_to_unicode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    let mut pending: Vec<char> = Vec::new();
    for &b in bytes {
        if b < 0x80 {
            out.push(b as char);
            out.extend(pending.drain(..));
        } else if let Some(c) = ansel_combining(b) {
            pending.push(c);
        } else {
            out.push(ansel_spacing(b));
            out.extend(pending.drain(..));
        }
    }
    // Diacritics with no following base character.
    out.extend(pending.drain(..));
    out
}

fn ansel_spacing(b: u8) -> char {
    match b {
        0xA1 => '\u{0141}', // L with stroke
        0xA2 => '\u{00D8}', // O with stroke
        0xA3 => '\u{0110}', // D with stroke
        0xA4 => '\u{00DE}', // Thorn
        0xA5 => '\u{00C6}', // AE
        0xA6 => '\u{0152}', // OE
        0xA7 => '\u{02B9}', // soft sign
        0xA8 => '\u{00B7}', // middle dot
        0xA9 => '\u{266D}', // flat
        0xAA => '\u{00AE}',
        0xAB => '\u{00B1}',
        0xAC => '\u{01A0}', // O with horn
        0xAD => '\u{01AF}', // U with horn
        0xAE => '\u{02BC}', // alif
        0xB0 => '\u{02BB}', // ayn
        0xB1 => '\u{0142}',
        0xB2 => '\u{00F8}',
        0xB3 => '\u{0111}',
        0xB4 => '\u{00FE}',
        0xB5 => '\u{00E6}',
        0xB6 => '\u{0153}',
        0xB7 => '\u{02BA}', // hard sign
        0xB8 => '\u{0131}', // dotless i
        0xB9 => '\u{00A3}',
        0xBA => '\u{00F0}', // eth
        0xBC => '\u{01A1}',
        0xBD => '\u{01B0}',
        0xC0 => '\u{00B0}',
        0xC1 => '\u{2113}', // script l
        0xC2 => '\u{2117}',
        0xC3 => '\u{00A9}',
        0xC4 => '\u{266F}', // sharp
        0xC5 => '\u{00BF}',
        0xC6 => '\u{00A1}',
        0xC8 => '\u{20AC}',
        _ => '\u{FFFD}',
    }
}

fn ansel_combining(b: u8) -> Option<char> {
    let c = match b {
        0xE0 => '\u{0309}', // hook above
        0xE1 => '\u{0300}', // grave
        0xE2 => '\u{0301}', // acute
        0xE3 => '\u{0302}', // circumflex
        0xE4 => '\u{0303}', // tilde
        0xE5 => '\u{0304}', // macron
        0xE6 => '\u{0306}', // breve
        0xE7 => '\u{0307}', // dot above
        0xE8 => '\u{0308}', // diaeresis
        0xE9 => '\u{030C}', // caron
        0xEA => '\u{030A}', // ring above
        0xEB => '\u{FE20}', // ligature left half
        0xEC => '\u{FE21}', // ligature right half
        0xED => '\u{0315}', // comma above right
        0xEE => '\u{030B}', // double acute
        0xEF => '\u{0310}', // candrabindu
        0xF0 => '\u{0327}', // cedilla
        0xF1 => '\u{0328}', // ogonek
        0xF2 => '\u{0323}', // dot below
        0xF3 => '\u{0324}', // double dot below
        0xF4 => '\u{0325}', // ring below
        0xF5 => '\u{0333}', // double low line
        0xF6 => '\u{0332}', // low line
        0xF7 => '\u{0326}', // comma below
        0xF8 => '\u{031C}', // left half ring below
        0xF9 => '\u{032E}', // breve below
        0xFA => '\u{FE22}', // double tilde left half
        0xFB => '\u{FE23}', // double tilde right half
        0xFE => '\u{0313}', // comma above
        _ => return None,
    };
    Some(c)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Build a minimal binary record with the given coding scheme flag.
    fn make_record(flag: u8, title: &[u8]) -> Vec<u8> {
        // Data area: one control field and one data field.
        let f001 = {
            let mut v = b"rec1".to_vec();
            v.push(FIELD_TERMINATOR);
            v
        };
        let f245 = {
            let mut v = vec![b'1', b' ', SUBFIELD_DELIMITER, b'a'];
            v.extend_from_slice(title);
            v.push(FIELD_TERMINATOR);
            v
        };
        let mut directory = Vec::new();
        directory.extend_from_slice(format!("001{:04}{:05}", f001.len(), 0).as_bytes());
        directory
            .extend_from_slice(format!("245{:04}{:05}", f245.len(), f001.len()).as_bytes());
        directory.push(FIELD_TERMINATOR);

        let base = 24 + directory.len();
        let total = base + f001.len() + f245.len() + 1;
        let mut leader = format!("{:05}nam a22{:05} a 4500", total, base).into_bytes();
        leader[CODING_SCHEME_POS] = flag;
        assert_eq!(leader.len(), 24);

        let mut rec = leader;
        rec.extend_from_slice(&directory);
        rec.extend_from_slice(&f001);
        rec.extend_from_slice(&f245);
        rec.push(0x1D);
        rec
    }

    #[test]
    fn reads_utf8_record_stream() {
        let mut data = make_record(b'a', b"First");
        data.extend_from_slice(&make_record(b'a', b"Second"));
        let mut reader = BinaryReader::new(Cursor::new(data));

        let r1 = reader.next_record().unwrap().unwrap();
        assert_eq!(r1.fields[0], Field::Control { tag: "001".into(), value: "rec1".into() });
        let r2 = reader.next_record().unwrap().unwrap();
        match &r2.fields[1] {
            Field::Data { subfields, .. } => assert_eq!(subfields[0].value, "Second"),
            f => panic!("unexpected field {:?}", f),
        }
        assert!(reader.next_record().unwrap().is_none());
    }

    #[test]
    fn blank_coding_scheme_is_rewritten_and_transliterated() {
        // 0xE2 = combining acute, precedes 'e' in ANSEL.
        let data = make_record(b' ', &[b'r', 0xE2, b'e', b's', 0xB2]);
        let mut reader = BinaryReader::new(Cursor::new(data));
        let record = reader.next_record().unwrap().unwrap();
        assert_eq!(record.leader.as_bytes()[CODING_SCHEME_POS], b'a');
        match &record.fields[1] {
            Field::Data { subfields, .. } => {
                assert_eq!(subfields[0].value, "re\u{0301}s\u{00F8}");
            }
            f => panic!("unexpected field {:?}", f),
        }
    }

    #[test]
    fn truncated_record_is_malformed_not_eof() {
        let mut data = make_record(b'a', b"Title");
        data.truncate(data.len() - 10);
        let mut reader = BinaryReader::new(Cursor::new(data));
        assert!(matches!(
            reader.next_record(),
            Err(Error::MalformedBinaryRecord(_))
        ));
    }
}
