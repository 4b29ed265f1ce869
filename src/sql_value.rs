//! Defines an enum of all the values the engine can store or compute, and the
//! coercion, arithmetic and ordering rules between them.

use enum_as_inner::EnumAsInner;

/// Can hold any value that can live in a register or a record field.
/// These variants correspond to the storage classes of the file format:
/// NULL, INTEGER, REAL, TEXT and BLOB.
#[derive(Debug, Clone, PartialEq, EnumAsInner)]
pub enum SqlValue {
    Null,
    Int(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl std::fmt::Display for SqlValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlValue::Null => write!(f, "NULL"),
            SqlValue::Int(x) => write!(f, "{}", x),
            SqlValue::Real(x) => write!(f, "{}", x),
            SqlValue::Text(x) => write!(f, "{}", x),
            SqlValue::Blob(_) => write!(f, "<BLOB>"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Remainder,
}

/// The numeric interpretation of a value, used by arithmetic.
/// Text and blobs coerce through `parse_numeric_text`; Null never reaches
/// here (arithmetic short-circuits it).
#[derive(Debug, Clone, Copy, PartialEq)]
enum Numeric {
    Int(i64),
    Real(f64),
}

/// Parses the numeric prefix of a string: optional sign, digits, optional
/// fractional part. Unparseable text coerces to integer 0.
fn parse_numeric_text(s: &str) -> Numeric {
    let t = s.trim_start();
    let bytes = t.as_bytes();
    let mut end = 0;
    if end < bytes.len() && (bytes[end] == b'+' || bytes[end] == b'-') {
        end += 1;
    }
    let int_start = end;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    let int_end = end;
    let mut is_real = false;
    if end < bytes.len() && bytes[end] == b'.' {
        let frac_start = end + 1;
        let mut frac_end = frac_start;
        while frac_end < bytes.len() && bytes[frac_end].is_ascii_digit() {
            frac_end += 1;
        }
        if frac_end > frac_start || int_end > int_start {
            is_real = true;
            end = frac_end;
        }
    }
    if int_end == int_start && !is_real {
        return Numeric::Int(0);
    }
    if is_real {
        return Numeric::Real(t[..end].parse::<f64>().unwrap_or(0.0));
    }
    match t[..end].parse::<i64>() {
        Ok(i) => Numeric::Int(i),
        // Digit runs that overflow an i64 fall back to the real interpretation.
        Err(_) => Numeric::Real(t[..end].parse::<f64>().unwrap_or(0.0)),
    }
}

fn numeric_of(v: &SqlValue) -> Numeric {
    match v {
        SqlValue::Null => Numeric::Int(0),
        SqlValue::Int(i) => Numeric::Int(*i),
        SqlValue::Real(f) => Numeric::Real(*f),
        SqlValue::Text(s) => parse_numeric_text(s),
        SqlValue::Blob(b) => parse_numeric_text(&String::from_utf8_lossy(b)),
    }
}

impl SqlValue {
    /// The value of this register as a 64-bit float, under the coercion rules.
    pub fn as_numeric_real(&self) -> f64 {
        match numeric_of(self) {
            Numeric::Int(i) => i as f64,
            Numeric::Real(f) => f,
        }
    }

    /// The value of this register as an integer, under the coercion rules.
    /// Reals truncate toward zero.
    pub fn as_numeric_int(&self) -> i64 {
        match numeric_of(self) {
            Numeric::Int(i) => i,
            Numeric::Real(f) => f as i64,
        }
    }

    /// SQL three-valued truth: Null is unknown, everything else compares
    /// against numeric zero.
    pub fn truthiness(&self) -> Option<bool> {
        match self {
            SqlValue::Null => None,
            _ => Some(self.as_numeric_real() != 0.0),
        }
    }
}

/// Computes `a op b` under the coercion rules: Null poisons, two integers
/// stay integer unless the operation overflows, everything else goes through
/// 64-bit floats. Division and remainder by zero yield Null.
pub fn arithmetic(op: ArithOp, a: &SqlValue, b: &SqlValue) -> SqlValue {
    if matches!(a, SqlValue::Null) || matches!(b, SqlValue::Null) {
        return SqlValue::Null;
    }
    let (na, nb) = (numeric_of(a), numeric_of(b));
    if let (Numeric::Int(x), Numeric::Int(y)) = (na, nb) {
        let exact = match op {
            ArithOp::Add => x.checked_add(y),
            ArithOp::Subtract => x.checked_sub(y),
            ArithOp::Multiply => x.checked_mul(y),
            ArithOp::Divide => {
                if y == 0 {
                    return SqlValue::Null;
                }
                x.checked_div(y)
            }
            ArithOp::Remainder => {
                if y == 0 {
                    return SqlValue::Null;
                }
                x.checked_rem(y)
            }
        };
        if let Some(r) = exact {
            return SqlValue::Int(r);
        }
        // Overflow: fall through to the real computation.
    }
    let x = match na {
        Numeric::Int(i) => i as f64,
        Numeric::Real(f) => f,
    };
    let y = match nb {
        Numeric::Int(i) => i as f64,
        Numeric::Real(f) => f,
    };
    match op {
        ArithOp::Add => SqlValue::Real(x + y),
        ArithOp::Subtract => SqlValue::Real(x - y),
        ArithOp::Multiply => SqlValue::Real(x * y),
        ArithOp::Divide => {
            if y == 0.0 {
                SqlValue::Null
            } else {
                SqlValue::Real(x / y)
            }
        }
        ArithOp::Remainder => {
            if y == 0.0 {
                SqlValue::Null
            } else {
                SqlValue::Real(x % y)
            }
        }
    }
}

fn storage_rank(v: &SqlValue) -> u8 {
    match v {
        SqlValue::Null => 0,
        SqlValue::Int(_) | SqlValue::Real(_) => 1,
        SqlValue::Text(_) => 2,
        SqlValue::Blob(_) => 3,
    }
}

/// Total comparison order across storage classes:
/// Null < numeric < Text < Blob. Integers and reals compare by numeric
/// value; text and blobs compare byte-lexicographically.
pub fn compare(a: &SqlValue, b: &SqlValue) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    let (ra, rb) = (storage_rank(a), storage_rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }
    match (a, b) {
        (SqlValue::Null, SqlValue::Null) => Ordering::Equal,
        (SqlValue::Int(x), SqlValue::Int(y)) => x.cmp(y),
        (SqlValue::Text(x), SqlValue::Text(y)) => x.as_bytes().cmp(y.as_bytes()),
        (SqlValue::Blob(x), SqlValue::Blob(y)) => x.cmp(y),
        // Mixed int/real, or real/real.
        _ => {
            let (x, y) = (a.as_numeric_real(), b.as_numeric_real());
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
    }
}

#[test]
fn test_arithmetic_integer_paths() {
    use ArithOp::*;
    use SqlValue::*;
    assert_eq!(arithmetic(Add, &Int(2), &Int(3)), Int(5));
    assert_eq!(arithmetic(Subtract, &Int(2), &Int(3)), Int(-1));
    assert_eq!(arithmetic(Multiply, &Int(4), &Int(5)), Int(20));
    assert_eq!(arithmetic(Divide, &Int(7), &Int(2)), Int(3));
    assert_eq!(arithmetic(Remainder, &Int(7), &Int(2)), Int(1));
}

#[test]
fn test_arithmetic_null_and_zero() {
    use ArithOp::*;
    use SqlValue::*;
    assert_eq!(arithmetic(Add, &Null, &Int(1)), Null);
    assert_eq!(arithmetic(Add, &Int(1), &Null), Null);
    assert_eq!(arithmetic(Divide, &Int(1), &Int(0)), Null);
    assert_eq!(arithmetic(Remainder, &Int(1), &Int(0)), Null);
    assert_eq!(arithmetic(Divide, &Real(1.0), &Real(0.0)), Null);
}

#[test]
fn test_arithmetic_overflow_goes_real() {
    use ArithOp::*;
    use SqlValue::*;
    let r = arithmetic(Add, &Int(i64::MAX), &Int(1));
    assert_eq!(r, Real(i64::MAX as f64 + 1.0));
    let r = arithmetic(Multiply, &Int(i64::MAX), &Int(2));
    assert!(matches!(r, Real(_)));
}

#[test]
fn test_arithmetic_text_coercion() {
    use ArithOp::*;
    use SqlValue::*;
    assert_eq!(arithmetic(Add, &Text("12".to_string()), &Int(1)), Int(13));
    assert_eq!(arithmetic(Add, &Text("1.5".to_string()), &Int(1)), Real(2.5));
    assert_eq!(arithmetic(Add, &Text("-3x".to_string()), &Int(1)), Int(-2));
    assert_eq!(arithmetic(Add, &Text("pears".to_string()), &Int(1)), Int(1));
}

#[test]
fn test_compare_storage_class_order() {
    use std::cmp::Ordering::*;
    use SqlValue::*;
    assert_eq!(compare(&Null, &Int(i64::MIN)), Less);
    assert_eq!(compare(&Int(9), &Text("0".to_string())), Less);
    assert_eq!(compare(&Text("zzz".to_string()), &Blob(vec![0])), Less);
    assert_eq!(compare(&Int(2), &Real(2.0)), Equal);
    assert_eq!(compare(&Int(2), &Real(2.5)), Less);
    assert_eq!(
        compare(&Text("abc".to_string()), &Text("abd".to_string())),
        Less
    );
    assert_eq!(compare(&Blob(vec![1, 2]), &Blob(vec![1, 2, 0])), Less);
}
