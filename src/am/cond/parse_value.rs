//! The serialised form of one condition term.
//!
//! A term is written as a `#`-tagged unit: `#eq(value[,#oc(c)][,#ns])`,
//! `#gt`, `#ge`, `#lt`, `#le`, `#ne`, `#lk` (all with a value part), and
//! the value-less `#nl` (equals-null) and `#uk` (unknown). Inside the
//! value part `'\'`, `','` and `')'` are escaped with `'\'`. The optional
//! char is the escape character under `#lk` and the padding character
//! otherwise, never both.

use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatchType {
    Equals,
    GreaterThan,
    GreaterThanEquals,
    LessThan,
    LessThanEquals,
    NotEquals,
    Like,
    EqualsToNull,
    Unknown,
    Undefined,
}

/// The internal escape character stored in place of the user's LIKE
/// escape, so that comparators only ever see an ascii escape.
pub const INTERNAL_ESCAPE: char = '*';

/// Fullwidth wildcards have to be escaped before storage; they are
/// literal characters to the matcher but wide to the comparator.
const FULLWIDTH_PERCENT: char = '\u{ff05}';
const FULLWIDTH_UNDERSCORE: char = '\u{ff3f}';

#[derive(Clone, Debug, PartialEq)]
pub struct ParseValue {
    pub match_type: MatchType,
    pub value: String,
    pub optional_char: Option<char>,
    pub normalized: bool,
    pub next: Option<Box<ParseValue>>,
}

impl ParseValue {
    pub fn new(match_type: MatchType) -> Self {
        Self {
            match_type,
            value: String::new(),
            optional_char: None,
            normalized: false,
            next: None,
        }
    }

    pub fn with_value(match_type: MatchType, value: String) -> Self {
        let mut pv = ParseValue::new(match_type);
        pv.value = value;
        pv
    }

    /// Append the serialised form of this node (not the chain) to `out`.
    pub fn put_stream(&self, out: &mut String) {
        match self.match_type {
            MatchType::Equals => {
                out.push_str("#eq");
                self.put_stream_value(out);
            }
            MatchType::EqualsToNull => {
                out.push_str("#nl");
            }
            MatchType::GreaterThan => {
                out.push_str("#gt");
                self.put_stream_value(out);
            }
            MatchType::GreaterThanEquals => {
                out.push_str("#ge");
                self.put_stream_value(out);
            }
            MatchType::LessThan => {
                out.push_str("#lt");
                self.put_stream_value(out);
            }
            MatchType::LessThanEquals => {
                out.push_str("#le");
                self.put_stream_value(out);
            }
            MatchType::NotEquals => {
                out.push_str("#ne");
                self.put_stream_value(out);
            }
            MatchType::Like => {
                out.push_str("#lk");
                self.put_stream_value(out);
            }
            MatchType::Unknown => {
                out.push_str("#uk");
            }
            MatchType::Undefined => {}
        }
    }

    /// Serialise the whole chain.
    pub fn put_stream_all(&self, out: &mut String) {
        self.put_stream(out);
        let mut next = self.next.as_deref();
        while let Some(pv) = next {
            pv.put_stream(out);
            next = pv.next.as_deref();
        }
    }

    fn put_stream_value(&self, out: &mut String) {
        out.push('(');
        for c in self.value.chars() {
            if c == ')' || c == '\\' || c == ',' {
                out.push('\\');
            }
            out.push(c);
        }
        if let Some(c) = self.optional_char {
            out.push_str(",#oc(");
            out.push(c);
            out.push(')');
        }
        if self.normalized {
            out.push_str(",#ns");
        }
        out.push(')');
    }

    /// Parse one `#`-tagged unit starting at `pos`.
    pub fn get_stream(chars: &[char], pos: &mut usize) -> Result<ParseValue> {
        let corrupted = || Error::DataCorrupted("malformed condition string".to_string());

        if chars.get(*pos) != Some(&'#') {
            return Err(corrupted());
        }
        *pos += 1;

        let c0 = *chars.get(*pos).ok_or_else(corrupted)?;
        let c1 = chars.get(*pos + 1).copied().unwrap_or('\0');
        let match_type = match c0 {
            'e' => MatchType::Equals,
            'n' => {
                if c1 == 'l' {
                    MatchType::EqualsToNull
                } else {
                    MatchType::NotEquals
                }
            }
            'g' => {
                if c1 == 't' {
                    MatchType::GreaterThan
                } else {
                    MatchType::GreaterThanEquals
                }
            }
            'l' => {
                if c1 == 't' {
                    MatchType::LessThan
                } else if c1 == 'e' {
                    MatchType::LessThanEquals
                } else {
                    MatchType::Like
                }
            }
            'u' => MatchType::Unknown,
            _ => return Err(corrupted()),
        };
        *pos += 2;

        let mut pv = ParseValue::new(match_type);
        if match_type != MatchType::EqualsToNull && match_type != MatchType::Unknown {
            get_stream_value(
                chars,
                pos,
                &mut pv.value,
                &mut pv.optional_char,
                &mut pv.normalized,
            )?;
        }
        Ok(pv)
    }
}

fn get_stream_value(
    chars: &[char],
    pos: &mut usize,
    value: &mut String,
    optional_char: &mut Option<char>,
    normalized: &mut bool,
) -> Result<()> {
    let corrupted = || Error::DataCorrupted("malformed condition value".to_string());

    if chars.get(*pos) != Some(&'(') {
        return Err(corrupted());
    }
    *pos += 1;

    loop {
        let c = *chars.get(*pos).ok_or_else(corrupted)?;
        if c == ')' || c == ',' {
            break;
        }
        if c == '\\' {
            *pos += 1;
        }
        value.push(*chars.get(*pos).ok_or_else(corrupted)?);
        *pos += 1;
    }

    while chars.get(*pos) == Some(&',') {
        *pos += 2; // ",#"
        match chars.get(*pos) {
            Some('o') => {
                *pos += 3; // "oc("
                *optional_char = Some(*chars.get(*pos).ok_or_else(corrupted)?);
                *pos += 2; // the char and ')'
            }
            Some('n') => {
                *pos += 2; // "ns"
                *normalized = true;
            }
            _ => return Err(corrupted()),
        }
    }

    if chars.get(*pos) != Some(&')') {
        return Err(corrupted());
    }
    *pos += 1;
    Ok(())
}

/// Rewrite a LIKE pattern for storage: fullwidth wildcards become
/// escaped literals and the user's escape character is replaced by the
/// internal one. Returns the rewritten pattern and the escape to store.
pub fn escape_like_pattern(pattern: &str, escape: Option<char>) -> (String, Option<char>) {
    let needs_internal = escape.is_some()
        || pattern
            .chars()
            .any(|c| c == FULLWIDTH_PERCENT || c == FULLWIDTH_UNDERSCORE || c == INTERNAL_ESCAPE);

    if !needs_internal {
        return (pattern.to_string(), None);
    }

    let mut out = String::with_capacity(pattern.len());
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        if Some(c) == escape {
            if let Some(literal) = chars.next() {
                out.push(INTERNAL_ESCAPE);
                out.push(literal);
            }
        } else if c == FULLWIDTH_PERCENT || c == FULLWIDTH_UNDERSCORE || c == INTERNAL_ESCAPE {
            out.push(INTERNAL_ESCAPE);
            out.push(c);
        } else {
            out.push(c);
        }
    }
    (out, Some(INTERNAL_ESCAPE))
}

/// The literal prefix of a LIKE pattern up to its first wildcard, after
/// `escape_like_pattern` rewriting. Returns the prefix and whether the
/// pattern is prefix-only (a single trailing `%`).
pub fn like_literal_prefix(pattern: &str, escape: Option<char>) -> (String, bool) {
    let chars: Vec<char> = pattern.chars().collect();
    let mut prefix = String::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if Some(c) == escape {
            if i + 1 < chars.len() {
                prefix.push(chars[i + 1]);
                i += 2;
                continue;
            }
            break;
        }
        if c == '%' || c == '_' {
            let prefix_only = c == '%' && i == chars.len() - 1;
            return (prefix, prefix_only);
        }
        prefix.push(c);
        i += 1;
    }
    // no wildcard at all: the pattern is a plain literal
    (prefix, false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(pv: &ParseValue) -> ParseValue {
        let mut out = String::new();
        pv.put_stream(&mut out);
        let chars: Vec<char> = out.chars().collect();
        let mut pos = 0;
        let parsed = ParseValue::get_stream(&chars, &mut pos).unwrap();
        assert_eq!(pos, chars.len());
        parsed
    }

    #[test]
    fn round_trip_every_kind() {
        for match_type in &[
            MatchType::Equals,
            MatchType::GreaterThan,
            MatchType::GreaterThanEquals,
            MatchType::LessThan,
            MatchType::LessThanEquals,
            MatchType::NotEquals,
            MatchType::Like,
        ] {
            let pv = ParseValue::with_value(*match_type, "value".to_string());
            assert_eq!(round_trip(&pv), pv);
        }

        let pv = ParseValue::new(MatchType::EqualsToNull);
        assert_eq!(round_trip(&pv), pv);
        let pv = ParseValue::new(MatchType::Unknown);
        assert_eq!(round_trip(&pv), pv);
    }

    #[test]
    fn round_trip_escaped_characters() {
        let pv = ParseValue::with_value(MatchType::Equals, "a,b)c\\d".to_string());
        let mut out = String::new();
        pv.put_stream(&mut out);
        assert_eq!(out, "#eq(a\\,b\\)c\\\\d)");
        assert_eq!(round_trip(&pv), pv);
    }

    #[test]
    fn round_trip_optional_char_and_normalized() {
        let mut pv = ParseValue::with_value(MatchType::LessThan, "ac".to_string());
        pv.optional_char = Some(' ');
        pv.normalized = true;
        let mut out = String::new();
        pv.put_stream(&mut out);
        assert_eq!(out, "#lt(ac,#oc( ),#ns)");
        assert_eq!(round_trip(&pv), pv);
    }

    #[test]
    fn escape_rewrites_the_escape_character() {
        let (pattern, escape) = escape_like_pattern("ab%", Some('*'));
        assert_eq!(pattern, "ab%");
        assert_eq!(escape, Some(INTERNAL_ESCAPE));

        let (pattern, escape) = escape_like_pattern("a!%b%", Some('!'));
        assert_eq!(pattern, "a*%b%");
        assert_eq!(escape, Some(INTERNAL_ESCAPE));

        // no escape and nothing to escape: untouched
        let (pattern, escape) = escape_like_pattern("ab%", None);
        assert_eq!(pattern, "ab%");
        assert_eq!(escape, None);
    }

    #[test]
    fn escape_protects_fullwidth_wildcards() {
        let (pattern, escape) = escape_like_pattern("a\u{ff05}b%", None);
        assert_eq!(pattern, "a*\u{ff05}b%");
        assert_eq!(escape, Some(INTERNAL_ESCAPE));
    }

    #[test]
    fn literal_prefix_extraction() {
        assert_eq!(like_literal_prefix("ab%", None), ("ab".to_string(), true));
        assert_eq!(like_literal_prefix("ab%c", None), ("ab".to_string(), false));
        assert_eq!(like_literal_prefix("%ab", None), ("".to_string(), false));
        assert_eq!(like_literal_prefix("a_b", None), ("a".to_string(), false));
        assert_eq!(
            like_literal_prefix("a*%b%", Some('*')),
            ("a%b".to_string(), true)
        );
    }
}
