//! Field types, entry marshalling and comparators.
//!
//! An entry is the concatenation of its fields behind a one-byte null
//! bitmap: fixed-length fields inline (little endian), variable-length
//! fields behind a 2-byte length prefix. Only the first eight positions
//! may be null.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::{Error, Result};

use std::cmp::Ordering;

pub const PAD_CHAR: char = ' ';

/// Start-of-heading, used as a key-padding terminator by NO PAD keys.
pub const SOH_CHAR: char = '\u{1}';

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataType {
    Int32,
    Int64,
    UInt32,
    Float64,
    Char(usize),
    Varchar(usize),
}

impl DataType {
    pub fn is_fixed_size(&self) -> bool {
        !matches!(self, DataType::Varchar(_))
    }

    /// On-disk size of a fixed field, not counting the null bitmap.
    pub fn fixed_size(&self) -> Option<usize> {
        match *self {
            DataType::Int32 => Some(4),
            DataType::Int64 => Some(8),
            DataType::UInt32 => Some(4),
            DataType::Float64 => Some(8),
            DataType::Char(n) => Some(n),
            DataType::Varchar(_) => None,
        }
    }

    pub fn is_string(&self) -> bool {
        matches!(self, DataType::Char(_) | DataType::Varchar(_))
    }
}

/// Whether trailing padding is significant when comparing string keys.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Collation {
    PadSpace,
    NoPad,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FieldDef {
    pub data_type: DataType,
    pub collation: Collation,
}

impl FieldDef {
    pub fn new(data_type: DataType) -> Self {
        Self {
            data_type,
            collation: Collation::PadSpace,
        }
    }

    pub fn no_pad(data_type: DataType) -> Self {
        Self {
            data_type,
            collation: Collation::NoPad,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Int32(i32),
    Int64(i64),
    UInt32(u32),
    Float64(f64),
    String(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_u32(&self) -> Result<u32> {
        match *self {
            Value::UInt32(v) => Ok(v),
            _ => Err(Error::BadArgument(format!(
                "expected an unsigned 32-bit value, got {:?}",
                self
            ))),
        }
    }

    pub fn as_str(&self) -> Result<&str> {
        match self {
            Value::String(s) => Ok(s),
            _ => Err(Error::BadArgument(format!(
                "expected a string value, got {:?}",
                self
            ))),
        }
    }
}

/// An ordered field list with the marshalling rules of the entry format.
#[derive(Clone, Debug, Default)]
pub struct RowLayout {
    fields: Vec<FieldDef>,
}

impl RowLayout {
    pub fn new(fields: Vec<FieldDef>) -> Self {
        Self { fields }
    }

    pub fn empty() -> Self {
        Self { fields: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn field(&self, index: usize) -> &FieldDef {
        &self.fields[index]
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    pub fn prefix(&self, n: usize) -> RowLayout {
        RowLayout::new(self.fields[..n].to_vec())
    }

    /// Slot size of a fixed-only layout, including the null bitmap byte.
    pub fn slot_size(&self) -> Option<usize> {
        let mut size = 1;
        for field in self.fields.iter() {
            size += field.data_type.fixed_size()?;
        }
        Some(size)
    }

    pub fn encode(&self, values: &[Value]) -> Result<Vec<u8>> {
        if values.len() != self.fields.len() {
            return Err(Error::BadArgument(format!(
                "field count mismatch: expected {}, got {}",
                self.fields.len(),
                values.len()
            )));
        }

        let mut null_bitmap = 0u8;
        for (i, value) in values.iter().enumerate() {
            if value.is_null() {
                if i >= 8 {
                    return Err(Error::BadArgument(format!(
                        "field {} may not be null: only the first eight positions are nullable",
                        i
                    )));
                }
                null_bitmap |= 1 << i;
            }
        }

        let mut buf = vec![null_bitmap];
        for (field, value) in self.fields.iter().zip(values.iter()) {
            encode_field(&mut buf, field, value)?;
        }
        Ok(buf)
    }

    pub fn decode(&self, buf: &[u8]) -> Result<Vec<Value>> {
        let mut values = Vec::with_capacity(self.fields.len());
        let mut pos = 1;
        if buf.is_empty() {
            return Err(Error::DataCorrupted("empty entry".to_string()));
        }
        let null_bitmap = buf[0];

        for (i, field) in self.fields.iter().enumerate() {
            let is_null = i < 8 && (null_bitmap & (1 << i)) != 0;
            let value = decode_field(buf, &mut pos, field, is_null)?;
            values.push(value);
        }
        Ok(values)
    }

    /// Byte length of an encoded entry without decoding its fields.
    pub fn entry_size(&self, buf: &[u8]) -> Result<usize> {
        let mut pos = 1;
        for field in self.fields.iter() {
            match field.data_type.fixed_size() {
                Some(n) => pos += n,
                None => {
                    if pos + 2 > buf.len() {
                        return Err(Error::DataCorrupted("truncated entry".to_string()));
                    }
                    let len = (&buf[pos..]).read_u16::<LittleEndian>().unwrap() as usize;
                    pos += 2 + len;
                }
            }
        }
        Ok(pos)
    }

    pub fn null_bitmap(&self, buf: &[u8]) -> u8 {
        if buf.is_empty() {
            0
        } else {
            buf[0]
        }
    }
}

fn encode_field(buf: &mut Vec<u8>, field: &FieldDef, value: &Value) -> Result<()> {
    match field.data_type {
        DataType::Int32 => {
            let v = match value {
                Value::Int32(v) => *v,
                Value::Null => 0,
                _ => return Err(type_mismatch(field, value)),
            };
            buf.write_i32::<LittleEndian>(v).unwrap();
        }
        DataType::Int64 => {
            let v = match value {
                Value::Int64(v) => *v,
                Value::Null => 0,
                _ => return Err(type_mismatch(field, value)),
            };
            buf.write_i64::<LittleEndian>(v).unwrap();
        }
        DataType::UInt32 => {
            let v = match value {
                Value::UInt32(v) => *v,
                Value::Null => 0,
                _ => return Err(type_mismatch(field, value)),
            };
            buf.write_u32::<LittleEndian>(v).unwrap();
        }
        DataType::Float64 => {
            let v = match value {
                Value::Float64(v) => *v,
                Value::Null => 0.0,
                _ => return Err(type_mismatch(field, value)),
            };
            buf.write_f64::<LittleEndian>(v).unwrap();
        }
        DataType::Char(n) => {
            let s = match value {
                Value::String(s) => s.as_str(),
                Value::Null => "",
                _ => return Err(type_mismatch(field, value)),
            };
            let bytes = s.as_bytes();
            if bytes.len() > n {
                return Err(Error::BadArgument(format!(
                    "string of {} bytes does not fit a CHAR({})",
                    bytes.len(),
                    n
                )));
            }
            buf.extend_from_slice(bytes);
            // right-pad to the declared width
            for _ in bytes.len()..n {
                buf.push(PAD_CHAR as u8);
            }
        }
        DataType::Varchar(n) => {
            let s = match value {
                Value::String(s) => s.as_str(),
                Value::Null => "",
                _ => return Err(type_mismatch(field, value)),
            };
            let bytes = s.as_bytes();
            if bytes.len() > n {
                return Err(Error::BadArgument(format!(
                    "string of {} bytes does not fit a VARCHAR({})",
                    bytes.len(),
                    n
                )));
            }
            buf.write_u16::<LittleEndian>(bytes.len() as u16).unwrap();
            buf.extend_from_slice(bytes);
        }
    }
    Ok(())
}

fn decode_field(buf: &[u8], pos: &mut usize, field: &FieldDef, is_null: bool) -> Result<Value> {
    let corrupted = || Error::DataCorrupted("truncated entry".to_string());

    let value = match field.data_type {
        DataType::Int32 => {
            let mut slice = buf.get(*pos..*pos + 4).ok_or_else(corrupted)?;
            *pos += 4;
            Value::Int32(slice.read_i32::<LittleEndian>().unwrap())
        }
        DataType::Int64 => {
            let mut slice = buf.get(*pos..*pos + 8).ok_or_else(corrupted)?;
            *pos += 8;
            Value::Int64(slice.read_i64::<LittleEndian>().unwrap())
        }
        DataType::UInt32 => {
            let mut slice = buf.get(*pos..*pos + 4).ok_or_else(corrupted)?;
            *pos += 4;
            Value::UInt32(slice.read_u32::<LittleEndian>().unwrap())
        }
        DataType::Float64 => {
            let mut slice = buf.get(*pos..*pos + 8).ok_or_else(corrupted)?;
            *pos += 8;
            Value::Float64(slice.read_f64::<LittleEndian>().unwrap())
        }
        DataType::Char(n) => {
            let slice = buf.get(*pos..*pos + n).ok_or_else(corrupted)?;
            *pos += n;
            let s = std::str::from_utf8(slice)
                .map_err(|_| Error::DataCorrupted("invalid utf-8 in entry".to_string()))?;
            Value::String(s.trim_end_matches(PAD_CHAR).to_string())
        }
        DataType::Varchar(_) => {
            let mut slice = buf.get(*pos..*pos + 2).ok_or_else(corrupted)?;
            let len = slice.read_u16::<LittleEndian>().unwrap() as usize;
            *pos += 2;
            let bytes = buf.get(*pos..*pos + len).ok_or_else(corrupted)?;
            *pos += len;
            let s = std::str::from_utf8(bytes)
                .map_err(|_| Error::DataCorrupted("invalid utf-8 in entry".to_string()))?;
            Value::String(s.to_string())
        }
    };

    if is_null {
        Ok(Value::Null)
    } else {
        Ok(value)
    }
}

fn type_mismatch(field: &FieldDef, value: &Value) -> Error {
    Error::BadArgument(format!(
        "value {:?} does not match field type {:?}",
        value, field.data_type
    ))
}

/// Compare two values under the field's type and collation. Null sorts
/// before every non-null value.
pub fn compare_values(a: &Value, b: &Value, field: &FieldDef) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        (Value::Int32(x), Value::Int32(y)) => x.cmp(y),
        (Value::Int64(x), Value::Int64(y)) => x.cmp(y),
        (Value::UInt32(x), Value::UInt32(y)) => x.cmp(y),
        (Value::Float64(x), Value::Float64(y)) => x.partial_cmp(y).unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => compare_strings(x, y, field.collation),
        _ => Ordering::Equal,
    }
}

pub fn compare_strings(a: &str, b: &str, collation: Collation) -> Ordering {
    match collation {
        Collation::NoPad => a.chars().cmp(b.chars()),
        Collation::PadSpace => {
            let mut ca = a.chars();
            let mut cb = b.chars();
            loop {
                match (ca.next(), cb.next()) {
                    (None, None) => return Ordering::Equal,
                    (Some(x), Some(y)) => match x.cmp(&y) {
                        Ordering::Equal => continue,
                        ord => return ord,
                    },
                    (Some(x), None) => match x.cmp(&PAD_CHAR) {
                        Ordering::Equal => continue,
                        ord => return ord,
                    },
                    (None, Some(y)) => match PAD_CHAR.cmp(&y) {
                        Ordering::Equal => continue,
                        ord => return ord,
                    },
                }
            }
        }
    }
}

/// Field-by-field comparator bound to a key prefix.
#[derive(Clone, Debug, Default)]
pub struct Compare {
    fields: Vec<FieldDef>,
}

impl Compare {
    pub fn new(fields: Vec<FieldDef>) -> Self {
        Self { fields }
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// Lexicographic comparison over the shorter of the two prefixes.
    pub fn compare(&self, a: &[Value], b: &[Value]) -> Ordering {
        let n = a.len().min(b.len()).min(self.fields.len());
        for i in 0..n {
            match compare_values(&a[i], &b[i], &self.fields[i]) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        Ordering::Equal
    }
}

/// SQL LIKE with `%`, `_` and an optional escape character.
pub fn like_match(s: &str, pattern: &str, escape: Option<char>) -> bool {
    let s: Vec<char> = s.chars().collect();
    let p: Vec<char> = pattern.chars().collect();
    like_match_at(&s, 0, &p, 0, escape)
}

fn like_match_at(s: &[char], si: usize, p: &[char], pi: usize, escape: Option<char>) -> bool {
    if pi == p.len() {
        return si == s.len();
    }

    let c = p[pi];
    if Some(c) == escape {
        // the next pattern character is a literal
        if pi + 1 == p.len() {
            return false;
        }
        return si < s.len() && s[si] == p[pi + 1] && like_match_at(s, si + 1, p, pi + 2, escape);
    }

    match c {
        '%' => {
            for next in si..=s.len() {
                if like_match_at(s, next, p, pi + 1, escape) {
                    return true;
                }
            }
            false
        }
        '_' => si < s.len() && like_match_at(s, si + 1, p, pi + 1, escape),
        _ => si < s.len() && s[si] == c && like_match_at(s, si + 1, p, pi + 1, escape),
    }
}

/// The smallest string greater than every string with the given prefix,
/// obtained by incrementing the last character.
pub fn next_prefix(prefix: &str) -> Option<String> {
    let mut chars: Vec<char> = prefix.chars().collect();
    while let Some(last) = chars.pop() {
        if let Some(next) = std::char::from_u32(last as u32 + 1) {
            chars.push(next);
            return Some(chars.into_iter().collect());
        }
    }
    None
}

/// Index of the first character of the trailing SOH run, if the string
/// ends in one.
pub fn position_of_trailing_soh(s: &str) -> Option<usize> {
    let chars: Vec<char> = s.chars().collect();
    let mut pos = chars.len();
    while pos > 0 && chars[pos - 1] == SOH_CHAR {
        pos -= 1;
    }
    if pos == chars.len() {
        None
    } else {
        Some(pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_layout() -> RowLayout {
        RowLayout::new(vec![
            FieldDef::new(DataType::Int32),
            FieldDef::new(DataType::Varchar(16)),
            FieldDef::new(DataType::UInt32),
        ])
    }

    #[test]
    fn encode_decode_round_trip() {
        let layout = sample_layout();
        let values = vec![
            Value::Int32(-5),
            Value::String("hello".to_string()),
            Value::UInt32(42),
        ];

        let buf = layout.encode(&values).unwrap();
        assert_eq!(layout.decode(&buf).unwrap(), values);
        assert_eq!(layout.entry_size(&buf).unwrap(), buf.len());
    }

    #[test]
    fn null_bitmap_round_trip() {
        let layout = sample_layout();
        let values = vec![Value::Null, Value::Null, Value::UInt32(7)];

        let buf = layout.encode(&values).unwrap();
        assert_eq!(buf[0], 0b11);
        assert_eq!(layout.decode(&buf).unwrap(), values);
    }

    #[test]
    fn null_beyond_eighth_field_is_rejected() {
        let mut fields = Vec::new();
        for _ in 0..9 {
            fields.push(FieldDef::new(DataType::Int32));
        }
        let layout = RowLayout::new(fields);

        let mut values = vec![Value::Int32(0); 9];
        values[8] = Value::Null;
        assert!(layout.encode(&values).is_err());
    }

    #[test]
    fn pad_space_ignores_trailing_blanks() {
        assert_eq!(
            compare_strings("ab", "ab  ", Collation::PadSpace),
            Ordering::Equal
        );
        assert_eq!(
            compare_strings("ab", "ab  ", Collation::NoPad),
            Ordering::Less
        );
        assert_eq!(
            compare_strings("ab!", "ab", Collation::PadSpace),
            Ordering::Greater
        );
    }

    #[test]
    fn null_sorts_first() {
        let field = FieldDef::new(DataType::Int32);
        assert_eq!(
            compare_values(&Value::Null, &Value::Int32(i32::min_value()), &field),
            Ordering::Less
        );
    }

    #[test]
    fn like_with_escape() {
        assert!(like_match("abc", "ab%", None));
        assert!(like_match("abc", "a_c", None));
        assert!(!like_match("abc", "ab", None));
        assert!(like_match("a%c", "a*%c", Some('*')));
        assert!(!like_match("abc", "a*%c", Some('*')));
        assert!(like_match("100%", "100*%", Some('*')));
    }

    #[test]
    fn next_prefix_increments_last_char() {
        assert_eq!(next_prefix("ab").as_deref(), Some("ac"));
        assert_eq!(next_prefix("a").as_deref(), Some("b"));
    }

    #[test]
    fn trailing_soh_position() {
        assert_eq!(position_of_trailing_soh("ab"), None);
        assert_eq!(position_of_trailing_soh("ab\u{1}\u{1}"), Some(2));
    }
}
