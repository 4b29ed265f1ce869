//! func holds the registry of built-in scalar functions and aggregate
//! accumulators the VM dispatches to by name.

use std::collections::HashMap;

use lazy_static::lazy_static;

use crate::sql_value::{compare, SqlValue};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("no such function: {0}")]
    UnknownFunction(String),
    #[error("misuse of aggregate function {0}()")]
    AggregateMisuse(String),
    #[error("wrong number of arguments to function {0}()")]
    WrongArgCount(&'static str),
}

pub type ScalarFn = fn(&[SqlValue]) -> Result<SqlValue, Error>;

// Most scalars propagate NULL: any NULL argument makes the result NULL.
// coalesce and typeof are the exceptions and handle NULL themselves.
fn any_null(args: &[SqlValue]) -> bool {
    args.iter().any(|v| matches!(v, SqlValue::Null))
}

fn fn_lower(args: &[SqlValue]) -> Result<SqlValue, Error> {
    if any_null(args) {
        return Ok(SqlValue::Null);
    }
    match args {
        [v] => Ok(SqlValue::Text(v.to_string().to_lowercase())),
        _ => Err(Error::WrongArgCount("lower")),
    }
}

fn fn_upper(args: &[SqlValue]) -> Result<SqlValue, Error> {
    if any_null(args) {
        return Ok(SqlValue::Null);
    }
    match args {
        [v] => Ok(SqlValue::Text(v.to_string().to_uppercase())),
        _ => Err(Error::WrongArgCount("upper")),
    }
}

fn fn_length(args: &[SqlValue]) -> Result<SqlValue, Error> {
    if any_null(args) {
        return Ok(SqlValue::Null);
    }
    match args {
        // Characters for text, bytes for blobs.
        [SqlValue::Text(s)] => Ok(SqlValue::Int(s.chars().count() as i64)),
        [SqlValue::Blob(b)] => Ok(SqlValue::Int(b.len() as i64)),
        [v] => Ok(SqlValue::Int(v.to_string().chars().count() as i64)),
        _ => Err(Error::WrongArgCount("length")),
    }
}

fn fn_abs(args: &[SqlValue]) -> Result<SqlValue, Error> {
    if any_null(args) {
        return Ok(SqlValue::Null);
    }
    match args {
        [SqlValue::Int(i)] => Ok(match i.checked_abs() {
            Some(a) => SqlValue::Int(a),
            // abs(i64::MIN) does not fit; widen to a real.
            None => SqlValue::Real(-(*i as f64)),
        }),
        [SqlValue::Real(f)] => Ok(SqlValue::Real(f.abs())),
        [v] => Ok(SqlValue::Real(v.as_numeric_real().abs())),
        _ => Err(Error::WrongArgCount("abs")),
    }
}

fn fn_typeof(args: &[SqlValue]) -> Result<SqlValue, Error> {
    match args {
        [v] => Ok(SqlValue::Text(
            match v {
                SqlValue::Null => "null",
                SqlValue::Int(_) => "integer",
                SqlValue::Real(_) => "real",
                SqlValue::Text(_) => "text",
                SqlValue::Blob(_) => "blob",
            }
            .to_string(),
        )),
        _ => Err(Error::WrongArgCount("typeof")),
    }
}

fn fn_coalesce(args: &[SqlValue]) -> Result<SqlValue, Error> {
    if args.len() < 2 {
        return Err(Error::WrongArgCount("coalesce"));
    }
    Ok(args
        .iter()
        .find(|v| !matches!(v, SqlValue::Null))
        .cloned()
        .unwrap_or(SqlValue::Null))
}

fn fn_hex(args: &[SqlValue]) -> Result<SqlValue, Error> {
    if any_null(args) {
        return Ok(SqlValue::Null);
    }
    match args {
        [SqlValue::Blob(b)] => Ok(SqlValue::Text(hex::encode_upper(b))),
        [v] => Ok(SqlValue::Text(hex::encode_upper(v.to_string().as_bytes()))),
        _ => Err(Error::WrongArgCount("hex")),
    }
}

fn fn_substr(args: &[SqlValue]) -> Result<SqlValue, Error> {
    if any_null(args) {
        return Ok(SqlValue::Null);
    }
    let (text, start, len) = match args {
        [v, s] => (v.to_string(), s.as_numeric_int(), None),
        [v, s, l] => (v.to_string(), s.as_numeric_int(), Some(l.as_numeric_int())),
        _ => return Err(Error::WrongArgCount("substr")),
    };
    let chars: Vec<char> = text.chars().collect();
    // Positions are 1-based; a negative start counts back from the end.
    let begin = if start > 0 {
        (start - 1) as usize
    } else if start < 0 {
        chars.len().saturating_sub((-start) as usize)
    } else {
        0
    };
    let take = match len {
        Some(l) if l < 0 => 0,
        Some(l) => l as usize,
        None => chars.len(),
    };
    Ok(SqlValue::Text(
        chars.iter().skip(begin).take(take).collect(),
    ))
}

fn fn_min(args: &[SqlValue]) -> Result<SqlValue, Error> {
    if args.is_empty() {
        return Err(Error::WrongArgCount("min"));
    }
    if any_null(args) {
        return Ok(SqlValue::Null);
    }
    let mut best = &args[0];
    for v in &args[1..] {
        if compare(v, best) == std::cmp::Ordering::Less {
            best = v;
        }
    }
    Ok(best.clone())
}

fn fn_max(args: &[SqlValue]) -> Result<SqlValue, Error> {
    if args.is_empty() {
        return Err(Error::WrongArgCount("max"));
    }
    if any_null(args) {
        return Ok(SqlValue::Null);
    }
    let mut best = &args[0];
    for v in &args[1..] {
        if compare(v, best) == std::cmp::Ordering::Greater {
            best = v;
        }
    }
    Ok(best.clone())
}

lazy_static! {
    static ref SCALARS: HashMap<&'static str, ScalarFn> = {
        let mut m: HashMap<&'static str, ScalarFn> = HashMap::new();
        m.insert("lower", fn_lower);
        m.insert("upper", fn_upper);
        m.insert("length", fn_length);
        m.insert("abs", fn_abs);
        m.insert("typeof", fn_typeof);
        m.insert("coalesce", fn_coalesce);
        m.insert("hex", fn_hex);
        m.insert("substr", fn_substr);
        m.insert("min", fn_min);
        m.insert("max", fn_max);
        m
    };
}

const AGGREGATE_NAMES: [&str; 6] = ["count", "sum", "total", "avg", "min", "max"];

/// Looks up a scalar by name (case-insensitive, as SQL function names are).
pub fn lookup_scalar(name: &str) -> Result<ScalarFn, Error> {
    let lower = name.to_lowercase();
    if let Some(f) = SCALARS.get(lower.as_str()) {
        return Ok(*f);
    }
    if AGGREGATE_NAMES.contains(&lower.as_str()) {
        return Err(Error::AggregateMisuse(lower));
    }
    Err(Error::UnknownFunction(lower))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggFunc {
    Count,
    Sum,
    Total,
    Avg,
    Min,
    Max,
}

pub fn lookup_aggregate(name: &str) -> Result<AggFunc, Error> {
    match name.to_lowercase().as_str() {
        "count" => Ok(AggFunc::Count),
        "sum" => Ok(AggFunc::Sum),
        "total" => Ok(AggFunc::Total),
        "avg" => Ok(AggFunc::Avg),
        "min" => Ok(AggFunc::Min),
        "max" => Ok(AggFunc::Max),
        other => Err(Error::UnknownFunction(other.to_string())),
    }
}

/// Running state for one aggregate slot. Built at the first AggStep, drained
/// by AggFinal; never cached across executions.
#[derive(Debug, Clone)]
pub struct Accumulator {
    func: AggFunc,
    /// Non-NULL inputs seen. `count()` with no arguments counts every call.
    n: u64,
    int_sum: i64,
    real_sum: f64,
    /// Set once integer summation overflows or a real input arrives.
    sum_is_real: bool,
    best: Option<SqlValue>,
}

impl Accumulator {
    pub fn new(func: AggFunc) -> Accumulator {
        Accumulator {
            func,
            n: 0,
            int_sum: 0,
            real_sum: 0.0,
            sum_is_real: false,
            best: None,
        }
    }

    pub fn step(&mut self, args: &[SqlValue]) {
        // count(*) has no argument and counts rows, NULL or not.
        let input = match args.first() {
            None => {
                self.n += 1;
                return;
            }
            Some(SqlValue::Null) => return, // NULLs are skipped by every aggregate
            Some(v) => v,
        };
        self.n += 1;
        match self.func {
            AggFunc::Count => {}
            AggFunc::Sum | AggFunc::Total | AggFunc::Avg => {
                self.real_sum += input.as_numeric_real();
                if let SqlValue::Int(i) = input {
                    if !self.sum_is_real {
                        match self.int_sum.checked_add(*i) {
                            Some(s) => self.int_sum = s,
                            None => self.sum_is_real = true,
                        }
                    }
                } else {
                    self.sum_is_real = true;
                }
            }
            AggFunc::Min => {
                let replace = match &self.best {
                    None => true,
                    Some(b) => compare(input, b) == std::cmp::Ordering::Less,
                };
                if replace {
                    self.best = Some(input.clone());
                }
            }
            AggFunc::Max => {
                let replace = match &self.best {
                    None => true,
                    Some(b) => compare(input, b) == std::cmp::Ordering::Greater,
                };
                if replace {
                    self.best = Some(input.clone());
                }
            }
        }
    }

    pub fn finalize(self) -> SqlValue {
        match self.func {
            AggFunc::Count => SqlValue::Int(self.n as i64),
            AggFunc::Sum => {
                if self.n == 0 {
                    SqlValue::Null
                } else if self.sum_is_real {
                    SqlValue::Real(self.real_sum)
                } else {
                    SqlValue::Int(self.int_sum)
                }
            }
            AggFunc::Total => SqlValue::Real(self.real_sum),
            AggFunc::Avg => {
                if self.n == 0 {
                    SqlValue::Null
                } else {
                    SqlValue::Real(self.real_sum / self.n as f64)
                }
            }
            AggFunc::Min | AggFunc::Max => self.best.unwrap_or(SqlValue::Null),
        }
    }
}

#[test]
fn test_scalar_lookup() {
    assert!(lookup_scalar("lower").is_ok());
    assert!(lookup_scalar("LOWER").is_ok());
    assert!(matches!(
        lookup_scalar("sum"),
        Err(Error::AggregateMisuse(_))
    ));
    assert!(matches!(
        lookup_scalar("frobnicate"),
        Err(Error::UnknownFunction(_))
    ));
}

#[test]
fn test_scalar_null_propagation() {
    use SqlValue::*;
    let f = lookup_scalar("lower").unwrap();
    assert_eq!(f(&[Null]).unwrap(), Null);
    let f = lookup_scalar("coalesce").unwrap();
    assert_eq!(f(&[Null, Int(2), Int(3)]).unwrap(), Int(2));
    assert_eq!(f(&[Null, Null]).unwrap(), Null);
    let f = lookup_scalar("typeof").unwrap();
    assert_eq!(f(&[Null]).unwrap(), Text("null".to_string()));
}

#[test]
fn test_scalar_behaviors() {
    use SqlValue::*;
    assert_eq!(
        fn_lower(&[Text("HeLLo".to_string())]).unwrap(),
        Text("hello".to_string())
    );
    assert_eq!(
        fn_upper(&[Text("HeLLo".to_string())]).unwrap(),
        Text("HELLO".to_string())
    );
    assert_eq!(fn_length(&[Text("hello".to_string())]).unwrap(), Int(5));
    assert_eq!(fn_length(&[Blob(vec![1, 2, 3])]).unwrap(), Int(3));
    assert_eq!(fn_abs(&[Int(-7)]).unwrap(), Int(7));
    assert_eq!(fn_abs(&[Real(-2.5)]).unwrap(), Real(2.5));
    assert_eq!(
        fn_hex(&[Blob(vec![0xde, 0xad])]).unwrap(),
        Text("DEAD".to_string())
    );
    assert_eq!(
        fn_substr(&[Text("alphabet".to_string()), Int(4)]).unwrap(),
        Text("habet".to_string())
    );
    assert_eq!(
        fn_substr(&[Text("alphabet".to_string()), Int(2), Int(3)]).unwrap(),
        Text("lph".to_string())
    );
    assert_eq!(
        fn_substr(&[Text("alphabet".to_string()), Int(-3)]).unwrap(),
        Text("bet".to_string())
    );
    assert_eq!(fn_min(&[Int(3), Int(1), Int(2)]).unwrap(), Int(1));
    assert_eq!(fn_max(&[Int(3), Null]).unwrap(), Null);
}

#[test]
fn test_aggregates() {
    use SqlValue::*;
    let mut sum = Accumulator::new(AggFunc::Sum);
    for v in [Int(10), Int(20), Int(30)] {
        sum.step(&[v]);
    }
    assert_eq!(sum.finalize(), Int(60));

    let mut count = Accumulator::new(AggFunc::Count);
    for v in [Int(10), Null, Int(30)] {
        count.step(&[v]);
    }
    // count(x) skips NULLs.
    assert_eq!(count.finalize(), Int(2));

    let mut star = Accumulator::new(AggFunc::Count);
    for _ in 0..3 {
        star.step(&[]);
    }
    assert_eq!(star.finalize(), Int(3));

    assert_eq!(Accumulator::new(AggFunc::Sum).finalize(), Null);
    assert_eq!(Accumulator::new(AggFunc::Total).finalize(), Real(0.0));
    assert_eq!(Accumulator::new(AggFunc::Count).finalize(), Int(0));

    let mut avg = Accumulator::new(AggFunc::Avg);
    for v in [Int(1), Int(2), Real(6.0)] {
        avg.step(&[v]);
    }
    assert_eq!(avg.finalize(), Real(3.0));

    let mut mx = Accumulator::new(AggFunc::Max);
    for v in [Int(5), Null, Int(9), Int(2)] {
        mx.step(&[v]);
    }
    assert_eq!(mx.finalize(), Int(9));

    let mut sum = Accumulator::new(AggFunc::Sum);
    sum.step(&[Int(i64::MAX)]);
    sum.step(&[Int(1)]);
    assert!(matches!(sum.finalize(), Real(_)));
}
