use std::fmt;

/// Width of the value/comment field of a card (bytes 10..80).
pub const VALUE_FIELD_LEN: usize = 70;

/// A typed header value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// `T` or `F`.
    Logical(bool),
    Integer(i64),
    Float(f64),
    /// Text between single quotes, trailing blanks removed.
    String(String),
    ComplexInt(i64, i64),
    ComplexFloat(f64, f64),
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            Value::Float(f) if f.fract() == 0.0 && f.abs() < 9.0e18 => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Integer(n) => Some(*n as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Logical(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Name of the value kind, used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Logical(_) => "logical",
            Value::Integer(_) => "integer",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::ComplexInt(..) => "complex integer",
            Value::ComplexFloat(..) => "complex float",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Logical(b) => f.write_str(if *b { "T" } else { "F" }),
            Value::Integer(n) => write!(f, "{n}"),
            Value::Float(x) => f.write_str(&float_text(*x)),
            Value::String(s) => f.write_str(s),
            Value::ComplexInt(re, im) => write!(f, "({re}, {im})"),
            Value::ComplexFloat(re, im) => write!(f, "({}, {})", float_text(*re), float_text(*im)),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Logical(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Value::Integer(n as i64)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

/// Locate a ` /` comment separator and return the trimmed text after it.
fn comment_after(bytes: &[u8]) -> (usize, Option<String>) {
    let sep = bytes.windows(2).position(|w| w == b" /");
    match sep {
        Some(at) => {
            let mut start = at + 2;
            if bytes.get(start) == Some(&b' ') {
                start += 1;
            }
            let text = String::from_utf8_lossy(&bytes[start..]).trim_end().to_string();
            (at, (!text.is_empty()).then_some(text))
        }
        None => (bytes.len(), None),
    }
}

fn parse_quoted(field: &[u8]) -> (Value, Option<String>) {
    let mut text = String::new();
    let mut i = 1;
    while i < field.len() {
        match field[i] {
            b'\'' if field.get(i + 1) == Some(&b'\'') => {
                text.push('\'');
                i += 2;
            }
            b'\'' => {
                i += 1;
                break;
            }
            b => {
                text.push(b as char);
                i += 1;
            }
        }
    }
    let (_, comment) = comment_after(&field[i.min(field.len())..]);
    (Value::String(text.trim_end().to_string()), comment)
}

fn parse_real(text: &str) -> Option<f64> {
    text.replace(['D', 'd'], "E").parse::<f64>().ok()
}

fn parse_number(text: &str) -> Option<Value> {
    let looks_real = text.bytes().any(|b| matches!(b, b'.' | b'E' | b'e' | b'D' | b'd'));
    if !looks_real {
        if let Ok(n) = text.parse::<i64>() {
            return Some(Value::Integer(n));
        }
    }
    parse_real(text).map(Value::Float)
}

fn parse_pair(text: &str) -> Option<Value> {
    let inner = text.strip_prefix('(')?.strip_suffix(')')?;
    let (re, im) = inner.split_once(',')?;
    match (parse_number(re.trim())?, parse_number(im.trim())?) {
        (Value::Integer(a), Value::Integer(b)) => Some(Value::ComplexInt(a, b)),
        (a, b) => Some(Value::ComplexFloat(a.as_float()?, b.as_float()?)),
    }
}

/// Parse the value field of a card (bytes 10..80).
///
/// Returns `None` when the field holds no value (blank or undefined), otherwise
/// the value and the trailing comment.
pub fn parse_value(field: &[u8]) -> Option<(Value, Option<String>)> {
    let lead = field.iter().position(|&b| b != b' ')?;
    let field = &field[lead..];
    if field[0] == b'\'' {
        return Some(parse_quoted(field));
    }
    let (end, comment) = comment_after(field);
    let text = std::str::from_utf8(&field[..end]).ok()?.trim();
    let value = match text {
        "" => return None,
        "T" => Value::Logical(true),
        "F" => Value::Logical(false),
        t if t.starts_with('(') => parse_pair(t)?,
        t => parse_number(t)?,
    };
    Some((value, comment))
}

/// Shortest text for a real value that keeps a decimal point or exponent.
pub(crate) fn float_text(x: f64) -> String {
    if x.is_nan() {
        return "NAN".to_string();
    }
    let plain = format!("{x:?}");
    if plain.len() <= 20 && !plain.contains('e') {
        return plain;
    }
    let sci = format!("{x:E}");
    match sci.split_once('E') {
        Some((mant, exp)) if !mant.contains('.') => format!("{mant}.0E{exp}"),
        _ => sci,
    }
}

fn put_right(text: &str, field: &mut [u8], width: usize) {
    let bytes = text.as_bytes();
    if bytes.len() >= width {
        field[..bytes.len()].copy_from_slice(bytes);
    } else {
        field[width - bytes.len()..width].copy_from_slice(bytes);
    }
}

/// Render a value into a 70-byte field. Returns the number of bytes used, so
/// the caller can place a comment after it.
///
/// Fails with `None` when a string cannot fit in one card.
pub fn format_value(value: &Value) -> Option<([u8; VALUE_FIELD_LEN], usize)> {
    let mut field = [b' '; VALUE_FIELD_LEN];
    let used = match value {
        Value::String(s) => {
            let mut quoted = String::with_capacity(s.len() + 4);
            quoted.push('\'');
            for ch in s.chars() {
                if !ch.is_ascii() || ch.is_ascii_control() {
                    return None;
                }
                if ch == '\'' {
                    quoted.push('\'');
                }
                quoted.push(ch);
            }
            while quoted.len() < 9 {
                quoted.push(' ');
            }
            quoted.push('\'');
            if quoted.len() > VALUE_FIELD_LEN {
                return None;
            }
            field[..quoted.len()].copy_from_slice(quoted.as_bytes());
            quoted.len().max(20)
        }
        other => {
            let text = other.to_string();
            if text.len() > VALUE_FIELD_LEN {
                return None;
            }
            put_right(&text, &mut field, 20);
            text.len().max(20)
        }
    };
    Some((field, used))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(s: &str) -> [u8; VALUE_FIELD_LEN] {
        let mut buf = [b' '; VALUE_FIELD_LEN];
        buf[..s.len()].copy_from_slice(s.as_bytes());
        buf
    }

    fn text(v: &Value) -> String {
        let (buf, used) = format_value(v).unwrap();
        String::from_utf8(buf[..used].to_vec()).unwrap()
    }

    // ---- parse ----

    #[test]
    fn parse_logical() {
        let (v, c) = parse_value(&field("                   T")).unwrap();
        assert_eq!(v, Value::Logical(true));
        assert!(c.is_none());
        let (v, c) = parse_value(&field("                   F / flag")).unwrap();
        assert_eq!(v, Value::Logical(false));
        assert_eq!(c.as_deref(), Some("flag"));
    }

    #[test]
    fn parse_integers() {
        let (v, _) = parse_value(&field("                 -99")).unwrap();
        assert_eq!(v, Value::Integer(-99));
        let (v, c) = parse_value(&field("                1024 /no space")).unwrap();
        assert_eq!(v, Value::Integer(1024));
        assert_eq!(c.as_deref(), Some("no space"));
    }

    #[test]
    fn parse_floats_with_d_exponent() {
        let (v, _) = parse_value(&field("            1.5D+03")).unwrap();
        assert_eq!(v, Value::Float(1500.0));
        let (v, _) = parse_value(&field("              -2.5E-1")).unwrap();
        assert_eq!(v, Value::Float(-0.25));
    }

    #[test]
    fn parse_strings() {
        let (v, c) = parse_value(&field("'RICE_1  '           / compression")).unwrap();
        assert_eq!(v, Value::String("RICE_1".into()));
        assert_eq!(c.as_deref(), Some("compression"));
        let (v, _) = parse_value(&field("'O''HARA '")).unwrap();
        assert_eq!(v, Value::String("O'HARA".into()));
    }

    #[test]
    fn parse_complex() {
        let (v, _) = parse_value(&field("(1, -2)")).unwrap();
        assert_eq!(v, Value::ComplexInt(1, -2));
        let (v, _) = parse_value(&field("(1.5, 2)")).unwrap();
        assert_eq!(v, Value::ComplexFloat(1.5, 2.0));
    }

    #[test]
    fn parse_blank_is_undefined() {
        assert!(parse_value(&field("")).is_none());
        assert!(parse_value(&field("          / only a comment")).is_none());
    }

    // ---- format ----

    #[test]
    fn format_right_justified() {
        assert_eq!(text(&Value::Integer(16)), "                  16");
        assert_eq!(text(&Value::Logical(true)), "                   T");
    }

    #[test]
    fn format_string_min_width() {
        assert_eq!(text(&Value::String("A".into())), "'A       '          ");
        assert_eq!(text(&Value::String("it's".into())), "'it''s   '          ");
    }

    #[test]
    fn format_string_too_long() {
        let long = "x".repeat(80);
        assert!(format_value(&Value::String(long)).is_none());
    }

    #[test]
    fn float_round_trip() {
        for x in [0.0, 1.0, -0.25, 1.0e-7, 6.02214076e23, 123456.789] {
            let (buf, _) = format_value(&Value::Float(x)).unwrap();
            let (back, _) = parse_value(&buf).unwrap();
            assert_eq!(back, Value::Float(x), "{x}");
        }
    }

    #[test]
    fn float_text_keeps_point() {
        assert_eq!(float_text(1.0e-7), "1.0E-7");
        assert_eq!(float_text(2.5), "2.5");
    }

    // ---- accessors ----

    #[test]
    fn typed_accessors() {
        assert_eq!(Value::Integer(3).as_float(), Some(3.0));
        assert_eq!(Value::Float(4.0).as_int(), Some(4));
        assert_eq!(Value::Float(4.5).as_int(), None);
        assert_eq!(Value::from("x").as_str(), Some("x"));
        assert_eq!(Value::from(true).as_bool(), Some(true));
        assert_eq!(Value::Integer(1).as_bool(), None);
    }
}
