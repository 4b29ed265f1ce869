//! Btree cells hold records, which contain table rows and index keys.
//!
//! A record is a header and a body, in that order. The header begins with a
//! single varint which determines the total number of bytes in the header,
//! including that varint itself, followed by one serial type varint per
//! column. The body is the column bodies back to back in the same order.

use crate::serial_type;
use crate::sql_value::SqlValue;
use crate::varint;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Record is truncated or its header is inconsistent.")]
    CorruptRecord,
    #[error("Record serial type: {0}")]
    SerialType(#[from] serial_type::Error),
}

/// Serializes `values` into record format, choosing the minimal serial type
/// for each column.
pub fn encode(values: &[SqlValue]) -> Vec<u8> {
    let types: Vec<i64> = values.iter().map(serial_type::pick).collect();
    let types_len: usize = types.iter().map(|t| varint::len(*t as u64)).sum();

    // The header length varint counts itself, so its width is a fixed point:
    // growing the length can (rarely) widen the varint that stores it.
    let mut hdr_len = types_len + 1;
    while hdr_len != types_len + varint::len(hdr_len as u64) {
        hdr_len = types_len + varint::len(hdr_len as u64);
    }

    let mut out = Vec::with_capacity(hdr_len);
    let mut buf = [0u8; 9];
    let n = varint::put(&mut buf, hdr_len as u64);
    out.extend_from_slice(&buf[..n]);
    for t in &types {
        let n = varint::put(&mut buf, *t as u64);
        out.extend_from_slice(&buf[..n]);
    }
    for v in values {
        serial_type::encode_body(v, &mut out);
    }
    out
}

/// Deserializes a complete record into owned values.
pub fn decode(data: &[u8]) -> Result<Vec<SqlValue>, Error> {
    let mut out = vec![];
    for item in ValueIterator::new(data)? {
        let (serial_type, body) = item?;
        out.push(serial_type::decode(serial_type, body)?);
    }
    Ok(out)
}

/// Iterates over the (serial type, body bytes) pairs of a record without
/// decoding them, so a caller after one column does not pay for the rest.
pub struct ValueIterator<'a> {
    data: &'a [u8],
    hdr_offset: usize,
    hdr_len: usize,
    body_offset: usize,
}

impl<'a> ValueIterator<'a> {
    /// Creates an iterator over a byte slice in record format. The slice must
    /// begin with the record header length varint and end with the last byte
    /// of the record body.
    pub fn new(data: &'a [u8]) -> Result<ValueIterator<'a>, Error> {
        let (hdr_len, n) = varint::get(data);
        let hdr_len = hdr_len as usize;
        if n == 0 || hdr_len < n || hdr_len > data.len() {
            return Err(Error::CorruptRecord);
        }
        Ok(ValueIterator {
            data,
            hdr_offset: n,
            hdr_len,
            body_offset: hdr_len,
        })
    }
}

impl<'a> Iterator for ValueIterator<'a> {
    type Item = Result<(i64, &'a [u8]), Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.hdr_offset >= self.hdr_len {
            return None;
        }
        let (serial_type, n) = varint::get(&self.data[self.hdr_offset..self.hdr_len]);
        if n == 0 {
            self.hdr_offset = self.hdr_len; // stop iterating after the error
            return Some(Err(Error::CorruptRecord));
        }
        self.hdr_offset += n;
        let serial_type = serial_type as i64;
        let len = match serial_type::body_len(serial_type) {
            Ok(len) => len,
            Err(e) => {
                self.hdr_offset = self.hdr_len;
                return Some(Err(Error::SerialType(e)));
            }
        };
        if self.body_offset + len > self.data.len() {
            self.hdr_offset = self.hdr_len;
            return Some(Err(Error::CorruptRecord));
        }
        let body = &self.data[self.body_offset..self.body_offset + len];
        self.body_offset += len;
        Some(Ok((serial_type, body)))
    }
}

#[test]
fn test_value_iterator_literal_one() {
    // 2 byte record header, record type is literal 1 (09), record body has
    // zero bytes.
    let test_record: &[u8] = &[0x02, 0x09];
    let mut vi = ValueIterator::new(test_record).unwrap();
    assert_eq!(vi.next().unwrap().unwrap(), (9, &[][..]));
    assert!(vi.next().is_none());
}

#[test]
fn test_value_iterator_five_one_byte_ints() {
    let test_record: &[u8] = &[0x06, 0x01, 0x01, 0x01, 0x01, 0x01, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e];
    let mut vi = ValueIterator::new(test_record).unwrap();
    for want in 10..=14_u8 {
        assert_eq!(vi.next().unwrap().unwrap(), (1, &[want][..]));
    }
    assert!(vi.next().is_none());
}

#[test]
fn test_value_iterator_various_types() {
    // literal 0 | literal 1 | float 3.1415 | "Ten" | NULL
    let test_record: &[u8] = &[
        0x06, 0x08, 0x09, 0x07, 0x13, 0x00, 0x40, 0x09, 0x21, 0xca, 0xc0, 0x83, 0x12, 0x6f, 0x54,
        0x65, 0x6e,
    ];
    let mut vi = ValueIterator::new(test_record).unwrap();
    assert_eq!(vi.next().unwrap().unwrap(), (8, &[][..]));
    assert_eq!(vi.next().unwrap().unwrap(), (9, &[][..]));
    assert_eq!(
        vi.next().unwrap().unwrap(),
        (7, &[0x40, 0x09, 0x21, 0xca, 0xc0, 0x83, 0x12, 0x6f][..])
    );
    assert_eq!(vi.next().unwrap().unwrap(), (0x13, &b"Ten"[..]));
    assert_eq!(vi.next().unwrap().unwrap(), (0, &[][..]));
    assert!(vi.next().is_none());
}

#[test]
fn test_encode_decode_round_trip() {
    use SqlValue::*;
    let rows: Vec<Vec<SqlValue>> = vec![
        vec![],
        vec![Null],
        vec![Int(0), Int(1), Int(-1)],
        vec![Int(42), Text("hello".to_string())],
        vec![
            Real(3.1415),
            Text("Ten".to_string()),
            Blob(vec![0x00, 0x01, 0xff, 0xfe, 0x00]),
            Null,
            Int(1 << 40),
        ],
        vec![Text("x".repeat(300))], // header length varint stays 1 byte, type varint grows
    ];
    for row in rows {
        let bytes = encode(&row);
        assert_eq!(decode(&bytes).unwrap(), row, "row {:?}", row);
    }
}

#[test]
fn test_encode_known_bytes() {
    use SqlValue::*;
    // One column holding integer 1 encodes as the two-byte record 02 09.
    assert_eq!(encode(&[Int(1)]), vec![0x02, 0x09]);
    // 42 fits an int8: header 02 01, body 2a.
    assert_eq!(encode(&[Int(42)]), vec![0x02, 0x01, 0x2a]);
}

#[test]
fn test_decode_truncated_record() {
    use SqlValue::*;
    let mut bytes = encode(&[Int(42), Text("hello".to_string())]);
    bytes.truncate(bytes.len() - 2);
    assert!(decode(&bytes).is_err());
    // A header length pointing past the end of the buffer is corrupt too.
    assert!(decode(&[0x10, 0x01]).is_err());
    assert!(decode(&[]).is_err());
}
