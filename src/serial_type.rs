//! Serial types are how the record format stores values: a varint code that
//! identifies both the type and the byte length of a column body.

use byteorder::BigEndian;
use byteorder::ReadBytesExt;
use std::io::Read;

use crate::sql_value::SqlValue;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Record body ends before the serial type's declared length.")]
    Truncated,
    #[error("Invalid serial type code: {0}.")]
    InvalidCode(i64),
    #[error("Bytes were not a valid text encoding: {0}")]
    InvalidTextEncoding(#[from] std::string::FromUtf8Error),
}

/// Returns the number of body bytes a serial type occupies.
///
/// Codes 10 and 11 are reserved and never appear in a well-formed file;
/// negative codes cannot be produced by the varint decoder but are rejected
/// for completeness.
pub fn body_len(serial_type: i64) -> Result<usize, Error> {
    match serial_type {
        // Serial Type	Content Size	Meaning
        // 0	        0	            Value is a NULL.
        0 => Ok(0),
        // 1	        1	            Value is an 8-bit twos-complement integer.
        1 => Ok(1),
        // 2	        2	            Value is a big-endian 16-bit twos-complement integer.
        2 => Ok(2),
        // 3	        3	            Value is a big-endian 24-bit twos-complement integer.
        3 => Ok(3),
        // 4	        4	            Value is a big-endian 32-bit twos-complement integer.
        4 => Ok(4),
        // 5	        6	            Value is a big-endian 48-bit twos-complement integer.
        5 => Ok(6),
        // 6	        8	            Value is a big-endian 64-bit twos-complement integer.
        // 7	        8	            Value is a big-endian IEEE 754-2008 64-bit floating point number.
        6 | 7 => Ok(8),
        // 8	        0	            Value is the integer 0.
        // 9	        0	            Value is the integer 1.
        8 | 9 => Ok(0),
        // 10,11	    variable	    Reserved for internal use.
        // N>=12 even	(N-12)/2	    Value is a BLOB that is (N-12)/2 bytes in length.
        // N>=13 odd	(N-13)/2	    Value is a string of (N-13)/2 bytes. No nul terminator.
        x if x >= 12 => Ok((x as usize - 12 - (x % 2) as usize) / 2),
        x => Err(Error::InvalidCode(x)),
    }
}

/// Chooses the smallest serial type that can represent `v`:
/// the constant codes 8/9 for 0 and 1, then the narrowest sign-extending
/// integer width, 7 for reals, and the length-carrying text/blob codes.
pub fn pick(v: &SqlValue) -> i64 {
    match v {
        SqlValue::Null => 0,
        SqlValue::Int(0) => 8,
        SqlValue::Int(1) => 9,
        SqlValue::Int(i) => {
            let i = *i;
            if i >= i8::MIN as i64 && i <= i8::MAX as i64 {
                1
            } else if i >= i16::MIN as i64 && i <= i16::MAX as i64 {
                2
            } else if i >= -(1 << 23) && i < (1 << 23) {
                3
            } else if i >= i32::MIN as i64 && i <= i32::MAX as i64 {
                4
            } else if i >= -(1 << 47) && i < (1 << 47) {
                5
            } else {
                6
            }
        }
        SqlValue::Real(_) => 7,
        SqlValue::Text(s) => 13 + 2 * s.len() as i64,
        SqlValue::Blob(b) => 12 + 2 * b.len() as i64,
    }
}

/// Appends the body bytes for `v` to `out`, matching the type [`pick`]
/// chooses. Integers are written big-endian, truncated to the chosen width.
pub fn encode_body(v: &SqlValue, out: &mut Vec<u8>) {
    match v {
        SqlValue::Null | SqlValue::Int(0) | SqlValue::Int(1) => {}
        SqlValue::Int(i) => {
            let be = i.to_be_bytes();
            let width = body_len(pick(v)).expect("integer serial types have fixed widths");
            out.extend_from_slice(&be[8 - width..]);
        }
        SqlValue::Real(f) => out.extend_from_slice(&f.to_bits().to_be_bytes()),
        SqlValue::Text(s) => out.extend_from_slice(s.as_bytes()),
        SqlValue::Blob(b) => out.extend_from_slice(b),
    }
}

/// Deserializes `data` declared as `serial_type` into an [`SqlValue`].
///
/// `data` must hold at least `body_len(serial_type)` bytes; a shorter slice
/// is a truncated record.
pub fn decode(serial_type: i64, data: &[u8]) -> Result<SqlValue, Error> {
    use SqlValue::*;

    if data.len() < body_len(serial_type)? {
        return Err(Error::Truncated);
    }
    let mut c = std::io::Cursor::new(data);
    match serial_type {
        0 => Ok(Null),
        1 => Ok(Int(c.read_i8().map_err(|_| Error::Truncated)? as i64)),
        2 => Ok(Int(
            c.read_i16::<BigEndian>().map_err(|_| Error::Truncated)? as i64,
        )),
        3 => {
            // 24-bit: read into the low three bytes of an i32 and sign-extend.
            let mut bytes = [0_u8; 4];
            c.read_exact(&mut bytes[1..]).map_err(|_| Error::Truncated)?;
            bytes[0] = if bytes[1] & 0x80 != 0 { 0xff } else { 0 };
            Ok(Int(i32::from_be_bytes(bytes) as i64))
        }
        4 => Ok(Int(
            c.read_i32::<BigEndian>().map_err(|_| Error::Truncated)? as i64,
        )),
        5 => {
            // 48-bit: same trick with the low six bytes of an i64.
            let mut bytes = [0_u8; 8];
            c.read_exact(&mut bytes[2..]).map_err(|_| Error::Truncated)?;
            let fill = if bytes[2] & 0x80 != 0 { 0xff } else { 0 };
            bytes[0] = fill;
            bytes[1] = fill;
            Ok(Int(i64::from_be_bytes(bytes)))
        }
        6 => Ok(Int(c.read_i64::<BigEndian>().map_err(|_| Error::Truncated)?)),
        7 => Ok(Real(
            c.read_f64::<BigEndian>().map_err(|_| Error::Truncated)?,
        )),
        8 => Ok(Int(0)),
        9 => Ok(Int(1)),
        x if x >= 12 && x % 2 == 0 => {
            let len = (x as usize - 12) / 2;
            Ok(Blob(data[..len].to_vec()))
        }
        x if x >= 13 && x % 2 == 1 => {
            let len = (x as usize - 13) / 2;
            let s = String::from_utf8(data[..len].to_vec())?;
            Ok(Text(s))
        }
        x => Err(Error::InvalidCode(x)),
    }
}

#[test]
fn test_decode_cases() {
    use SqlValue::*;
    let cases: Vec<(i64, &[u8], SqlValue)> = vec![
        (0, b"", Null),
        (1, &[0x7f], Int(127)),
        (1, &[0xff], Int(-1)),
        (2, &[0x01, 0x00], Int(256)),
        (2, &[0xff, 0xff], Int(-1)),
        (3, &[0x01, 0x00, 0x00], Int(65536)),
        (3, &[0xff, 0xff, 0xff], Int(-1)),
        (4, &[0x7f, 0xff, 0xff, 0xff], Int(i32::MAX as i64)),
        (5, &[0x80, 0x00, 0x00, 0x00, 0x00, 0x00], Int(-(1 << 47))),
        (5, &[0xff, 0xff, 0xff, 0xff, 0xff, 0xff], Int(-1)),
        (
            6,
            &[0x80, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
            Int(i64::MIN),
        ),
        (
            7,
            &[0x40, 0x09, 0x21, 0xca, 0xc0, 0x83, 0x12, 0x6f],
            Real(3.1415),
        ),
        (8, b"", Int(0)),
        (9, b"", Int(1)),
        (13, b"", Text(String::new())),
        (19, b"Foo", Text("Foo".to_string())),
        (18, &[0x00, 0x01, 0xff], Blob(vec![0, 1, 255])),
    ];
    for (i, (st, data, expect)) in cases.iter().enumerate() {
        assert_eq!(&decode(*st, data).unwrap(), expect, "case {}", i);
    }
}

#[test]
fn test_decode_rejects_reserved_and_truncated() {
    assert!(matches!(decode(10, b""), Err(Error::InvalidCode(10))));
    assert!(matches!(decode(11, b""), Err(Error::InvalidCode(11))));
    assert!(matches!(decode(4, &[0x00, 0x01]), Err(Error::Truncated)));
    assert!(matches!(decode(19, b"Fo"), Err(Error::Truncated)));
}

#[test]
fn test_pick_is_minimal() {
    use SqlValue::*;
    let cases: Vec<(SqlValue, i64)> = vec![
        (Null, 0),
        (Int(0), 8),
        (Int(1), 9),
        (Int(2), 1),
        (Int(-1), 1),
        (Int(127), 1),
        (Int(128), 2),
        (Int(-129), 2),
        (Int(32768), 3),
        (Int(1 << 23), 4),
        (Int(-(1 << 23)), 3),
        (Int(1 << 31), 5),
        (Int(1 << 47), 6),
        (Int(i64::MIN), 6),
        (Real(0.0), 7),
        (Text("Ten".to_string()), 19),
        (Text(String::new()), 13),
        (Blob(vec![1, 2, 3]), 18),
        (Blob(vec![]), 12),
    ];
    for (v, expect) in cases {
        assert_eq!(pick(&v), expect, "wrong serial type for {:?}", v);
    }
}

#[test]
fn test_encode_body_round_trips() {
    use SqlValue::*;
    let values = vec![
        Null,
        Int(0),
        Int(1),
        Int(-1),
        Int(300),
        Int(1 << 22),
        Int(1 << 30),
        Int(1 << 40),
        Int(i64::MAX),
        Real(-2.5),
        Text("hello".to_string()),
        Blob(vec![0x00, 0xff, 0x00]),
    ];
    for v in values {
        let st = pick(&v);
        let mut body = vec![];
        encode_body(&v, &mut body);
        assert_eq!(body.len(), body_len(st).unwrap());
        let back = decode(st, &body).unwrap();
        assert_eq!(back, v);
    }
}
