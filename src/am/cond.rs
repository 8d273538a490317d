//! The condition compiler.
//!
//! `get_search_parameter` turns a predicate tree into the serialised
//! condition strings carried through the open option map, and
//! `set_open_option` rebuilds the in-memory search window from them at
//! open time. The serialised text is the only contract between the two
//! sides and round-trips exactly.
//!
//! A condition string is the concatenation of the key-prefix terms —
//! `#eq`/`#nl` units for the equal prefix, or a `#gt`/`#ge` and/or
//! `#lt`/`#le` pair on the first key field — followed by the residual
//! terms, each tagged with its field number as `#fd(i)`.

mod parse_value;

pub use self::parse_value::{MatchType, ParseValue, INTERNAL_ESCAPE};

use self::parse_value::{escape_like_pattern, like_literal_prefix};

use crate::{
    am::{
        datum::{
            compare_values, like_match, next_prefix, position_of_trailing_soh, Collation, Compare,
            DataType, FieldDef, Value, PAD_CHAR,
        },
        open_option::{OpenOption, OptionKey},
        FileId,
    },
    plan::predicate::{alternate_term, CompareOp, Operand, Predicate},
    Error, Result,
};

use std::cmp::Ordering;

use log::debug;

/// One side of the scan window: a match kind, the marshalled key prefix
/// and the comparator bound to it.
#[derive(Clone, Debug, Default)]
pub struct LimitCond {
    pub match_type: Option<MatchType>,
    pub buffer: Vec<u8>,
    pub values: Vec<Value>,
    pub null_bitmap: u8,
    pub compare: Compare,
}

impl LimitCond {
    pub fn clear(&mut self) {
        self.match_type = None;
        self.buffer.clear();
        self.values.clear();
        self.null_bitmap = 0;
        self.compare = Compare::default();
    }

    pub fn is_defined(&self) -> bool {
        !matches!(self.match_type, None | Some(MatchType::Undefined))
    }
}

/// A residual condition re-checked per candidate entry.
#[derive(Clone, Debug)]
pub struct Cond {
    pub match_type: MatchType,
    pub value: Value,
    pub field_id: usize,
    /// Escape character under `Like`, padding character otherwise.
    pub optional_char: Option<char>,
}

#[derive(Default)]
struct MainSlot {
    eq: Option<ParseValue>,
    lower: Option<ParseValue>,
    upper: Option<ParseValue>,
}

impl MainSlot {
    fn is_empty(&self) -> bool {
        self.eq.is_none() && self.lower.is_none() && self.upper.is_none()
    }
}

pub struct Condition {
    file_id: FileId,
    lower: LimitCond,
    upper: LimitCond,
    lower_is_upper: bool,
    other: Vec<Cond>,
    valid: bool,
    constraint_lock: bool,
    fetch_field: usize,
}

impl Condition {
    pub fn new(file_id: &FileId) -> Self {
        Self {
            file_id: file_id.clone(),
            lower: LimitCond::default(),
            upper: LimitCond::default(),
            lower_is_upper: false,
            other: Vec::new(),
            valid: false,
            constraint_lock: false,
            fetch_field: 0,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn set_constraint_lock(&mut self, flag: bool) {
        self.constraint_lock = flag;
    }

    pub fn is_constraint_lock(&self) -> bool {
        self.constraint_lock
    }

    pub fn get_fetch_field(&self) -> usize {
        self.fetch_field
    }

    pub fn get_lower(&self) -> &LimitCond {
        &self.lower
    }

    pub fn get_upper(&self) -> &LimitCond {
        if self.lower_is_upper {
            &self.lower
        } else {
            &self.upper
        }
    }

    pub fn is_lower_upper(&self) -> bool {
        self.lower_is_upper
    }

    /// Whether the condition can match nothing at all (`#uk`).
    pub fn is_never_match(&self) -> bool {
        self.lower.match_type == Some(MatchType::Unknown)
    }

    pub fn other_conditions(&self) -> &[Cond] {
        &self.other
    }

    fn key_count(&self) -> usize {
        self.file_id.key.len()
    }

    fn key_field(&self, index: usize) -> &FieldDef {
        self.file_id.key.field(index)
    }

    /// Comparison semantics a predicate term requires for the field:
    /// CHAR compares PAD SPACE, VARCHAR compares NO PAD.
    fn term_collation(&self, field: usize) -> Collation {
        match self.key_field(field).data_type {
            DataType::Char(_) => Collation::PadSpace,
            _ => Collation::NoPad,
        }
    }

    /// True when the field's sort order is NO PAD but the term wants a
    /// PAD comparison, so the term cannot be used as an exact key bound.
    fn check_no_pad_sort_order(&self, field: usize) -> bool {
        self.key_field(field).data_type.is_string()
            && self.key_field(field).collation == Collation::NoPad
            && self.term_collation(field) == Collation::PadSpace
    }

    fn padding_char(&self, field: usize) -> Option<char> {
        if self.check_no_pad_sort_order(field) {
            Some(PAD_CHAR)
        } else {
            None
        }
    }

    // ------------------------------------------------------------------
    // predicate tree -> open option

    /// Translate the predicate tree into serialised conditions. Returns
    /// false when the tree has a shape this file cannot search with.
    pub fn get_search_parameter(&self, pred: &Predicate, opt: &mut OpenOption) -> bool {
        let parsed = match pred {
            Predicate::Or(children) if !children.is_empty() => {
                let mut count = 0u32;
                for child in children {
                    if !self.parse_one_condition(child, count, opt) {
                        return false;
                    }
                    count += 1;
                }
                opt.set_int(OptionKey::ConditionCount, count as i64);
                true
            }
            _ => {
                if self.parse_one_condition(pred, 0, opt) {
                    opt.set_int(OptionKey::ConditionCount, 1);
                    true
                } else {
                    false
                }
            }
        };

        if !parsed {
            debug!("predicate shape not searchable by this file");
        }
        parsed
    }

    fn parse_one_condition(&self, pred: &Predicate, number: u32, opt: &mut OpenOption) -> bool {
        let mut main: Vec<MainSlot> = (0..self.key_count()).map(|_| MainSlot::default()).collect();
        let mut other: Vec<(usize, ParseValue)> = Vec::new();
        let mut fetch_fields = 0usize;
        let mut unknown = false;

        let ok = match pred {
            Predicate::And(children) => children.iter().all(|child| {
                self.parse_one_node(child, &mut main, &mut other, &mut fetch_fields, &mut unknown)
            }),
            _ => self.parse_one_node(pred, &mut main, &mut other, &mut fetch_fields, &mut unknown),
        };
        if !ok {
            return false;
        }

        self.set_to_open_option(number, &main, &other, fetch_fields, unknown, opt)
    }

    fn parse_one_node(
        &self,
        pred: &Predicate,
        main: &mut Vec<MainSlot>,
        other: &mut Vec<(usize, ParseValue)>,
        fetch_fields: &mut usize,
        unknown: &mut bool,
    ) -> bool {
        match pred {
            Predicate::Comparison { op, left, right } => {
                let (field, operand, op) = match alternate_term(*op, left, right) {
                    Some(t) => t,
                    None => return false,
                };
                if field >= self.key_count() {
                    return false;
                }
                let value = match operand {
                    Operand::Constant(v) => v.clone(),
                    // runtime parameters are handled by the fetch node
                    _ => return false,
                };
                if value.is_null() {
                    // a comparison with null matches nothing
                    *unknown = true;
                    return true;
                }
                match op {
                    CompareOp::Equals => self.parse_equals_node(field, value, main, other),
                    CompareOp::NotEquals => {
                        self.push_other(other, field, MatchType::NotEquals, value);
                        true
                    }
                    CompareOp::GreaterThan | CompareOp::GreaterThanEquals => {
                        self.parse_greater_than_node(field, value, op, main, other)
                    }
                    CompareOp::LessThan | CompareOp::LessThanEquals => {
                        self.parse_less_than_node(field, value, op, main, other)
                    }
                }
            }
            Predicate::Like {
                field,
                pattern,
                escape,
            } => self.parse_like_node(*field, pattern, *escape, main, other),
            Predicate::EqualsToNull { field } => {
                self.parse_equals_to_null_node(*field, main, other)
            }
            Predicate::Unknown => {
                *unknown = true;
                true
            }
            Predicate::Fetch { fields } => {
                // fetch keys must be a leading prefix of the key
                for (i, f) in fields.iter().enumerate() {
                    if *f != i || i >= self.key_count() {
                        return false;
                    }
                }
                *fetch_fields = fields.len();
                true
            }
            _ => false,
        }
    }

    fn value_to_string(&self, value: &Value) -> String {
        match value {
            Value::Null => String::new(),
            Value::Int32(v) => v.to_string(),
            Value::Int64(v) => v.to_string(),
            Value::UInt32(v) => v.to_string(),
            Value::Float64(v) => v.to_string(),
            Value::String(s) => s.clone(),
        }
    }

    fn push_other(
        &self,
        other: &mut Vec<(usize, ParseValue)>,
        field: usize,
        match_type: MatchType,
        value: Value,
    ) {
        let mut pv = ParseValue::with_value(match_type, self.value_to_string(&value));
        pv.optional_char = self.padding_char(field);
        other.push((field, pv));
    }

    fn prefix_is_equal(&self, main: &[MainSlot], field: usize) -> bool {
        main[..field].iter().all(|slot| slot.eq.is_some())
    }

    fn parse_equals_node(
        &self,
        field: usize,
        value: Value,
        main: &mut Vec<MainSlot>,
        other: &mut Vec<(usize, ParseValue)>,
    ) -> bool {
        if self.check_no_pad_sort_order(field) {
            // a PAD equality over a NO PAD sort order is a range around
            // the stripped value plus a padded equality re-check
            if field == 0 && main[0].is_empty() {
                let stripped = match &value {
                    Value::String(s) => s.trim_end_matches(PAD_CHAR).to_string(),
                    _ => self.value_to_string(&value),
                };
                main[0].lower = Some(ParseValue::with_value(
                    MatchType::GreaterThanEquals,
                    stripped.clone(),
                ));
                if let Some(end) = next_prefix(&stripped) {
                    let mut upper = ParseValue::with_value(MatchType::LessThan, end);
                    upper.normalized = true;
                    main[0].upper = Some(upper);
                }
            }
            self.push_other(other, field, MatchType::Equals, value);
            return true;
        }

        if self.prefix_is_equal(main, field) && main[field].is_empty() {
            main[field].eq = Some(ParseValue::with_value(
                MatchType::Equals,
                self.value_to_string(&value),
            ));
        } else {
            self.push_other(other, field, MatchType::Equals, value);
        }
        true
    }

    fn parse_equals_to_null_node(
        &self,
        field: usize,
        main: &mut Vec<MainSlot>,
        other: &mut Vec<(usize, ParseValue)>,
    ) -> bool {
        if field >= self.key_count() {
            return false;
        }
        if self.prefix_is_equal(main, field) && main[field].is_empty() {
            main[field].eq = Some(ParseValue::new(MatchType::EqualsToNull));
        } else {
            let mut pv = ParseValue::new(MatchType::EqualsToNull);
            pv.optional_char = None;
            other.push((field, pv));
        }
        true
    }

    fn parse_greater_than_node(
        &self,
        field: usize,
        value: Value,
        op: CompareOp,
        main: &mut Vec<MainSlot>,
        other: &mut Vec<(usize, ParseValue)>,
    ) -> bool {
        let match_type = if op == CompareOp::GreaterThan {
            MatchType::GreaterThan
        } else {
            MatchType::GreaterThanEquals
        };

        // bounds can only drive the scan on the first key field
        if field == 0 && main[0].eq.is_none() && main[0].lower.is_none() {
            let mut pv = ParseValue::with_value(match_type, self.value_to_string(&value));
            pv.optional_char = self.padding_char(field);
            main[0].lower = Some(pv);
            if self.check_no_pad_sort_order(field) {
                self.push_other(other, field, match_type, value);
            }
        } else {
            self.push_other(other, field, match_type, value);
        }
        true
    }

    fn parse_less_than_node(
        &self,
        field: usize,
        value: Value,
        op: CompareOp,
        main: &mut Vec<MainSlot>,
        other: &mut Vec<(usize, ParseValue)>,
    ) -> bool {
        let match_type = if op == CompareOp::LessThan {
            MatchType::LessThan
        } else {
            MatchType::LessThanEquals
        };

        if field == 0 && main[0].eq.is_none() && main[0].upper.is_none() {
            let mut pv = ParseValue::with_value(match_type, self.value_to_string(&value));
            pv.optional_char = self.padding_char(field);
            main[0].upper = Some(pv);
            if self.check_no_pad_sort_order(field) {
                self.push_other(other, field, match_type, value);
            }
        } else {
            self.push_other(other, field, match_type, value);
        }
        true
    }

    fn parse_like_node(
        &self,
        field: usize,
        pattern: &str,
        escape: Option<char>,
        main: &mut Vec<MainSlot>,
        other: &mut Vec<(usize, ParseValue)>,
    ) -> bool {
        if field >= self.key_count() || !self.key_field(field).data_type.is_string() {
            return false;
        }

        let (escaped, internal) = escape_like_pattern(pattern, escape);

        // the pattern is re-checked per entry in its escaped form
        let mut residual = ParseValue::with_value(MatchType::Like, escaped.clone());
        residual.optional_char = internal;
        other.push((field, residual));

        let (prefix, _) = like_literal_prefix(&escaped, internal);
        if field == 0 && !prefix.is_empty() && main[0].is_empty() {
            main[0].lower = Some(ParseValue::with_value(
                MatchType::GreaterThanEquals,
                prefix.clone(),
            ));

            // NO PAD keys remember the trailing SOH run; the upper bound
            // increments the last literal character before it
            let upper_base = match self.key_field(field).collation {
                Collation::NoPad => match position_of_trailing_soh(&prefix) {
                    Some(pos) => prefix.chars().take(pos).collect::<String>(),
                    None => prefix,
                },
                Collation::PadSpace => prefix,
            };
            if let Some(end) = next_prefix(&upper_base) {
                let mut upper = ParseValue::with_value(MatchType::LessThan, end);
                upper.normalized = true;
                main[0].upper = Some(upper);
            }
        }
        true
    }

    fn set_to_open_option(
        &self,
        number: u32,
        main: &[MainSlot],
        other: &[(usize, ParseValue)],
        fetch_fields: usize,
        unknown: bool,
        opt: &mut OpenOption,
    ) -> bool {
        let mut stream = String::new();
        let mut equal_fields = 0i64;

        if unknown {
            ParseValue::new(MatchType::Unknown).put_stream(&mut stream);
        } else {
            for slot in main.iter() {
                if let Some(eq) = &slot.eq {
                    eq.put_stream(&mut stream);
                    equal_fields += 1;
                    continue;
                }
                if let Some(lower) = &slot.lower {
                    lower.put_stream(&mut stream);
                }
                if let Some(upper) = &slot.upper {
                    upper.put_stream(&mut stream);
                }
                break;
            }
            for (field, pv) in other.iter() {
                stream.push_str(&format!("#fd({})", field));
                pv.put_stream(&mut stream);
            }
        }

        opt.set_str(OptionKey::Condition(number), stream);
        if number == 0 {
            opt.set_int(OptionKey::EqualFieldNumber, equal_fields);
            if fetch_fields > 0 {
                opt.set_int(OptionKey::FetchFieldNumber, fetch_fields as i64);
            }
        }
        true
    }

    // ------------------------------------------------------------------
    // open option -> in-memory condition

    fn parse_value_str(&self, s: &str, data_type: DataType) -> Result<Value> {
        let corrupted =
            |s: &str| Error::DataCorrupted(format!("bad condition value '{}'", s));
        match data_type {
            DataType::Int32 => s.parse::<i32>().map(Value::Int32).map_err(|_| corrupted(s)),
            DataType::Int64 => s.parse::<i64>().map(Value::Int64).map_err(|_| corrupted(s)),
            DataType::UInt32 => s.parse::<u32>().map(Value::UInt32).map_err(|_| corrupted(s)),
            DataType::Float64 => s
                .parse::<f64>()
                .map(Value::Float64)
                .map_err(|_| corrupted(s)),
            DataType::Char(_) | DataType::Varchar(_) => Ok(Value::String(s.to_string())),
        }
    }

    /// Rebuild the scan window and the residual conditions from the
    /// serialised condition of the given number.
    pub fn set_open_option(&mut self, opt: &OpenOption, number: u32) -> Result<()> {
        self.lower.clear();
        self.upper.clear();
        self.other.clear();
        self.lower_is_upper = false;
        self.valid = false;
        self.fetch_field = opt.get_int_or(OptionKey::FetchFieldNumber, 0)? as usize;
        self.constraint_lock = opt.get_bool(OptionKey::GetForConstraintLock)?;

        let count = opt.get_int_or(OptionKey::ConditionCount, 0)?;
        if (number as i64) >= count {
            // no condition: the scan covers the whole file
            self.valid = true;
            return Ok(());
        }

        let stream = opt
            .get_str(OptionKey::Condition(number))?
            .unwrap_or("")
            .to_string();
        let chars: Vec<char> = stream.chars().collect();
        let mut pos = 0;

        let mut eq_values: Vec<(Value, Option<char>)> = Vec::new();
        let mut lower_pv: Option<ParseValue> = None;
        let mut upper_pv: Option<ParseValue> = None;

        while pos < chars.len() {
            if chars[pos..].starts_with(&['#', 'f', 'd']) {
                pos += 3;
                let field = parse_field_tag(&chars, &mut pos)?;
                let pv = ParseValue::get_stream(&chars, &mut pos)?;
                self.push_parsed_other(field, pv)?;
                continue;
            }

            let pv = ParseValue::get_stream(&chars, &mut pos)?;
            match pv.match_type {
                MatchType::Unknown => {
                    self.lower.match_type = Some(MatchType::Unknown);
                    self.valid = true;
                    return Ok(());
                }
                MatchType::Equals => {
                    let field = eq_values.len();
                    let value =
                        self.parse_value_str(&pv.value, self.key_field(field).data_type)?;
                    eq_values.push((value, pv.optional_char));
                }
                MatchType::EqualsToNull => {
                    eq_values.push((Value::Null, None));
                }
                MatchType::GreaterThan | MatchType::GreaterThanEquals => {
                    lower_pv = Some(pv);
                }
                MatchType::LessThan | MatchType::LessThanEquals => {
                    upper_pv = Some(pv);
                }
                _ => {
                    return Err(Error::DataCorrupted(format!(
                        "unexpected term {:?} in the key prefix",
                        pv.match_type
                    )));
                }
            }
        }

        self.build_limits(eq_values, lower_pv, upper_pv)?;
        self.valid = true;
        Ok(())
    }

    fn push_parsed_other(&mut self, field: usize, pv: ParseValue) -> Result<()> {
        if field >= self.key_count() {
            return Err(Error::DataCorrupted(format!(
                "residual condition on unknown field {}",
                field
            )));
        }
        let value = match pv.match_type {
            MatchType::EqualsToNull | MatchType::Unknown => Value::Null,
            MatchType::Like => Value::String(pv.value.clone()),
            _ => self.parse_value_str(&pv.value, self.key_field(field).data_type)?,
        };
        self.other.push(Cond {
            match_type: pv.match_type,
            value,
            field_id: field,
            optional_char: pv.optional_char,
        });
        Ok(())
    }

    fn build_limits(
        &mut self,
        eq_values: Vec<(Value, Option<char>)>,
        lower_pv: Option<ParseValue>,
        upper_pv: Option<ParseValue>,
    ) -> Result<()> {
        let eq_len = eq_values.len();
        let bound_field = eq_len;

        let mut compare_fields: Vec<FieldDef> = Vec::new();
        let mut values: Vec<Value> = Vec::new();
        let mut null_bitmap = 0u8;

        for (i, (value, oc)) in eq_values.iter().enumerate() {
            let mut def = *self.key_field(i);
            if *oc == Some(PAD_CHAR) {
                def.collation = Collation::PadSpace;
            }
            compare_fields.push(def);
            if value.is_null() && i < 8 {
                null_bitmap |= 1 << i;
            }
            values.push(value.clone());
        }

        if lower_pv.is_none() && upper_pv.is_none() {
            if eq_len == 0 {
                // unconstrained scan
                return Ok(());
            }
            let buffer = self.file_id.key.prefix(eq_len).encode(&values)?;
            self.lower.match_type = Some(MatchType::Equals);
            self.lower.values = values;
            self.lower.null_bitmap = null_bitmap;
            self.lower.compare = Compare::new(compare_fields);
            self.lower.buffer = buffer;
            self.lower_is_upper = true;
            return Ok(());
        }

        if let Some(pv) = lower_pv {
            let value = self.parse_value_str(&pv.value, self.key_field(bound_field).data_type)?;
            let mut def = *self.key_field(bound_field);
            if pv.optional_char == Some(PAD_CHAR) {
                def.collation = Collation::PadSpace;
            }
            let mut fields = compare_fields.clone();
            fields.push(def);
            let mut bound_values = values.clone();
            bound_values.push(value);
            let buffer = self
                .file_id
                .key
                .prefix(bound_field + 1)
                .encode(&bound_values)?;

            self.lower.match_type = Some(pv.match_type);
            self.lower.null_bitmap = null_bitmap;
            self.lower.compare = Compare::new(fields);
            self.lower.buffer = buffer;
            self.lower.values = bound_values;
        } else if eq_len > 0 {
            let buffer = self.file_id.key.prefix(eq_len).encode(&values)?;
            self.lower.match_type = Some(MatchType::GreaterThanEquals);
            self.lower.values = values.clone();
            self.lower.null_bitmap = null_bitmap;
            self.lower.compare = Compare::new(compare_fields.clone());
            self.lower.buffer = buffer;
        }

        if let Some(pv) = upper_pv {
            let value = self.parse_value_str(&pv.value, self.key_field(bound_field).data_type)?;
            let mut def = *self.key_field(bound_field);
            if pv.optional_char == Some(PAD_CHAR) {
                def.collation = Collation::PadSpace;
            }
            let mut fields = compare_fields.clone();
            fields.push(def);
            let mut bound_values = values.clone();
            bound_values.push(value);
            let buffer = self
                .file_id
                .key
                .prefix(bound_field + 1)
                .encode(&bound_values)?;

            self.upper.match_type = Some(pv.match_type);
            self.upper.null_bitmap = null_bitmap;
            self.upper.compare = Compare::new(fields);
            self.upper.buffer = buffer;
            self.upper.values = bound_values;
        } else if eq_len > 0 {
            let buffer = self.file_id.key.prefix(eq_len).encode(&values)?;
            self.upper.match_type = Some(MatchType::LessThanEquals);
            self.upper.values = values.clone();
            self.upper.null_bitmap = null_bitmap;
            self.upper.compare = Compare::new(compare_fields);
            self.upper.buffer = buffer;
        }

        Ok(())
    }

    /// Bind the runtime key of a fetch. The values land in the same
    /// condition slots the search parameter would have used.
    pub fn set_fetch_key(&mut self, key: &[Value]) -> Result<()> {
        if self.fetch_field == 0 || key.len() != self.fetch_field {
            return Err(Error::BadArgument(format!(
                "fetch key has {} fields, expected {}",
                key.len(),
                self.fetch_field
            )));
        }

        let eq_values: Vec<(Value, Option<char>)> = key
            .iter()
            .enumerate()
            .map(|(i, v)| (v.clone(), self.padding_char(i)))
            .collect();

        self.lower.clear();
        self.upper.clear();
        self.lower_is_upper = false;
        self.build_limits(eq_values, None, None)?;
        self.valid = true;
        Ok(())
    }

    // ------------------------------------------------------------------
    // entry checks

    /// Whether the entry's key prefix satisfies the lower side of the
    /// window.
    pub fn matches_lower(&self, key: &[Value]) -> bool {
        match self.lower.match_type {
            None | Some(MatchType::Undefined) => true,
            Some(MatchType::Unknown) => false,
            Some(MatchType::GreaterThan) => {
                self.lower.compare.compare(key, &self.lower.values) == Ordering::Greater
            }
            Some(MatchType::Equals) | Some(MatchType::GreaterThanEquals) => {
                self.lower.compare.compare(key, &self.lower.values) != Ordering::Less
            }
            _ => false,
        }
    }

    /// Whether the entry's key prefix satisfies the upper side.
    pub fn matches_upper(&self, key: &[Value]) -> bool {
        let upper = self.get_upper();
        match upper.match_type {
            None | Some(MatchType::Undefined) => true,
            Some(MatchType::Unknown) => false,
            Some(MatchType::LessThan) => {
                upper.compare.compare(key, &upper.values) == Ordering::Less
            }
            Some(MatchType::Equals) | Some(MatchType::LessThanEquals) => {
                upper.compare.compare(key, &upper.values) != Ordering::Greater
            }
            _ => false,
        }
    }

    /// Re-check the residual conditions against a decoded entry.
    pub fn is_other_condition_match(&self, key: &[Value]) -> Result<bool> {
        for cond in self.other.iter() {
            if !self.one_condition_match(cond, key)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn one_condition_match(&self, cond: &Cond, key: &[Value]) -> Result<bool> {
        let entry = key.get(cond.field_id).ok_or_else(|| {
            Error::Unexpected(format!(
                "entry has no field {} for a residual condition",
                cond.field_id
            ))
        })?;

        match cond.match_type {
            MatchType::EqualsToNull => return Ok(entry.is_null()),
            MatchType::Unknown => return Ok(false),
            _ => {}
        }

        if entry.is_null() {
            return Ok(false);
        }

        if cond.match_type == MatchType::Like {
            let s = entry.as_str()?;
            let pattern = cond.value.as_str()?;
            return Ok(like_match(s, pattern, cond.optional_char));
        }

        let mut def = *self.key_field(cond.field_id);
        if cond.optional_char == Some(PAD_CHAR) {
            def.collation = Collation::PadSpace;
        } else if def.data_type.is_string() {
            def.collation = self.term_collation(cond.field_id);
        }
        let ord = compare_values(entry, &cond.value, &def);

        Ok(match cond.match_type {
            MatchType::Equals => ord == Ordering::Equal,
            MatchType::NotEquals => ord != Ordering::Equal,
            MatchType::GreaterThan => ord == Ordering::Greater,
            MatchType::GreaterThanEquals => ord != Ordering::Less,
            MatchType::LessThan => ord == Ordering::Less,
            MatchType::LessThanEquals => ord != Ordering::Greater,
            _ => false,
        })
    }
}

fn parse_field_tag(chars: &[char], pos: &mut usize) -> Result<usize> {
    let corrupted = || Error::DataCorrupted("malformed field tag".to_string());

    if chars.get(*pos) != Some(&'(') {
        return Err(corrupted());
    }
    *pos += 1;
    let mut number = String::new();
    while let Some(c) = chars.get(*pos) {
        if *c == ')' {
            *pos += 1;
            return number.parse::<usize>().map_err(|_| corrupted());
        }
        number.push(*c);
        *pos += 1;
    }
    Err(corrupted())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::am::datum::RowLayout;
    use crate::am::open_option::OpenOption;

    fn int_key_file() -> FileId {
        FileId {
            db: 0,
            rel_id: 1,
            key: RowLayout::new(vec![FieldDef::new(DataType::Int32)]),
            value: RowLayout::new(vec![FieldDef::new(DataType::UInt32)]),
            unique: false,
            top_null: true,
        }
    }

    fn varchar_key_file(collation: Collation) -> FileId {
        FileId {
            db: 0,
            rel_id: 1,
            key: RowLayout::new(vec![FieldDef {
                data_type: DataType::Varchar(32),
                collation,
            }]),
            value: RowLayout::new(vec![FieldDef::new(DataType::UInt32)]),
            unique: false,
            top_null: true,
        }
    }

    fn compile(file: &FileId, pred: &Predicate) -> (OpenOption, Condition) {
        let cond = Condition::new(file);
        let mut opt = OpenOption::new();
        assert!(cond.get_search_parameter(pred, &mut opt));
        let mut parsed = Condition::new(file);
        parsed.set_open_option(&opt, 0).unwrap();
        (opt, parsed)
    }

    #[test]
    fn equality_condition_round_trips() {
        let file = int_key_file();
        let (opt, parsed) = compile(&file, &Predicate::eq(0, Value::Int32(10)));

        assert_eq!(opt.get_str(OptionKey::Condition(0)).unwrap(), Some("#eq(10)"));
        assert_eq!(opt.get_int(OptionKey::EqualFieldNumber).unwrap(), Some(1));
        assert!(parsed.is_lower_upper());
        assert_eq!(parsed.get_lower().values, vec![Value::Int32(10)]);
        assert!(parsed.matches_lower(&[Value::Int32(10)]));
        assert!(parsed.matches_upper(&[Value::Int32(10)]));
        assert!(!parsed.matches_upper(&[Value::Int32(11)]));
    }

    #[test]
    fn range_condition_round_trips() {
        let file = int_key_file();
        let pred = Predicate::And(vec![
            Predicate::ge(0, Value::Int32(10)),
            Predicate::lt(0, Value::Int32(20)),
        ]);
        let (opt, parsed) = compile(&file, &pred);

        assert_eq!(
            opt.get_str(OptionKey::Condition(0)).unwrap(),
            Some("#ge(10)#lt(20)")
        );
        assert!(parsed.matches_lower(&[Value::Int32(10)]));
        assert!(!parsed.matches_lower(&[Value::Int32(9)]));
        assert!(parsed.matches_upper(&[Value::Int32(19)]));
        assert!(!parsed.matches_upper(&[Value::Int32(20)]));
    }

    #[test]
    fn alternated_comparison_becomes_field_left() {
        // 20 > f0 is the same scan as f0 < 20
        let file = int_key_file();
        let pred = Predicate::Comparison {
            op: CompareOp::GreaterThan,
            left: Operand::Constant(Value::Int32(20)),
            right: Operand::Field(0),
        };
        let (opt, _) = compile(&file, &pred);
        assert_eq!(
            opt.get_str(OptionKey::Condition(0)).unwrap(),
            Some("#lt(20)")
        );
    }

    #[test]
    fn not_equals_is_residual() {
        let file = int_key_file();
        let (opt, parsed) = compile(&file, &Predicate::ne(0, Value::Int32(5)));

        assert_eq!(
            opt.get_str(OptionKey::Condition(0)).unwrap(),
            Some("#fd(0)#ne(5)")
        );
        assert!(!parsed.get_lower().is_defined());
        assert!(parsed.is_other_condition_match(&[Value::Int32(4)]).unwrap());
        assert!(!parsed.is_other_condition_match(&[Value::Int32(5)]).unwrap());
    }

    #[test]
    fn like_prefix_becomes_a_range() {
        // LIKE 'ab%' ESCAPE '*' over a PAD SPACE key: window ['ab', 'ac')
        // plus the pattern as a residual
        let file = varchar_key_file(Collation::PadSpace);
        let pred = Predicate::like(0, "ab%", Some('*'));
        let (opt, parsed) = compile(&file, &pred);

        let stream = opt.get_str(OptionKey::Condition(0)).unwrap().unwrap();
        assert_eq!(stream, "#ge(ab)#lt(ac,#ns)#fd(0)#lk(ab%,#oc(*))");

        assert!(parsed.matches_lower(&[Value::String("ab".to_string())]));
        assert!(parsed.matches_lower(&[Value::String("abc".to_string())]));
        assert!(!parsed.matches_lower(&[Value::String("aa".to_string())]));
        assert!(parsed.matches_upper(&[Value::String("abz".to_string())]));
        assert!(!parsed.matches_upper(&[Value::String("ac".to_string())]));

        assert!(parsed
            .is_other_condition_match(&[Value::String("abc".to_string())])
            .unwrap());
        assert!(!parsed
            .is_other_condition_match(&[Value::String("ac".to_string())])
            .unwrap());
    }

    #[test]
    fn like_with_trailing_soh_on_no_pad_key() {
        let file = varchar_key_file(Collation::NoPad);
        let pattern = format!("ab{}%", crate::am::datum::SOH_CHAR);
        let pred = Predicate::like(0, &pattern, None);
        let (_, parsed) = compile(&file, &pred);

        // the upper bound increments the last literal before the SOH run
        let upper = parsed.get_upper();
        assert_eq!(upper.match_type, Some(MatchType::LessThan));
        assert_eq!(upper.values, vec![Value::String("ac".to_string())]);
    }

    #[test]
    fn leading_wildcard_is_residual_only() {
        let file = varchar_key_file(Collation::PadSpace);
        let (_, parsed) = compile(&file, &Predicate::like(0, "%ab", None));

        assert!(!parsed.get_lower().is_defined());
        assert_eq!(parsed.other_conditions().len(), 1);
    }

    #[test]
    fn pad_equality_over_no_pad_order_demotes_to_range_and_residual() {
        let file = FileId {
            db: 0,
            rel_id: 1,
            key: RowLayout::new(vec![FieldDef::no_pad(DataType::Char(8))]),
            value: RowLayout::new(vec![FieldDef::new(DataType::UInt32)]),
            unique: false,
            top_null: true,
        };
        let (opt, parsed) = compile(&file, &Predicate::eq(0, Value::String("ab".to_string())));

        let stream = opt.get_str(OptionKey::Condition(0)).unwrap().unwrap();
        assert!(stream.starts_with("#ge(ab)#lt(ac,#ns)"));
        assert!(stream.contains("#oc( )"));

        // 'ab ' is PAD-equal and must pass the residual check
        assert!(parsed
            .is_other_condition_match(&[Value::String("ab ".to_string())])
            .unwrap());
        assert!(!parsed
            .is_other_condition_match(&[Value::String("ab x".to_string())])
            .unwrap());
    }

    #[test]
    fn or_produces_one_condition_per_branch() {
        let file = int_key_file();
        let cond = Condition::new(&file);
        let mut opt = OpenOption::new();
        let pred = Predicate::Or(vec![
            Predicate::eq(0, Value::Int32(1)),
            Predicate::eq(0, Value::Int32(5)),
        ]);
        assert!(cond.get_search_parameter(&pred, &mut opt));
        assert_eq!(opt.get_int(OptionKey::ConditionCount).unwrap(), Some(2));
        assert_eq!(opt.get_str(OptionKey::Condition(0)).unwrap(), Some("#eq(1)"));
        assert_eq!(opt.get_str(OptionKey::Condition(1)).unwrap(), Some("#eq(5)"));
    }

    #[test]
    fn fetch_binds_at_runtime() {
        let file = int_key_file();
        let cond = Condition::new(&file);
        let mut opt = OpenOption::new();
        assert!(cond.get_search_parameter(&Predicate::Fetch { fields: vec![0] }, &mut opt));
        assert_eq!(opt.get_int(OptionKey::FetchFieldNumber).unwrap(), Some(1));

        let mut parsed = Condition::new(&file);
        parsed.set_open_option(&opt, 0).unwrap();
        assert!(!parsed.get_lower().is_defined());

        parsed.set_fetch_key(&[Value::Int32(33)]).unwrap();
        assert!(parsed.is_lower_upper());
        assert!(parsed.matches_lower(&[Value::Int32(33)]));
        assert!(!parsed.matches_upper(&[Value::Int32(34)]));
    }

    #[test]
    fn equals_to_null_takes_the_top_of_the_key_space() {
        let file = int_key_file();
        let (opt, parsed) = compile(&file, &Predicate::is_null(0));

        assert_eq!(opt.get_str(OptionKey::Condition(0)).unwrap(), Some("#nl"));
        assert!(parsed.matches_lower(&[Value::Null]));
        assert!(parsed.matches_upper(&[Value::Null]));
        assert!(!parsed.matches_upper(&[Value::Int32(0)]));
        assert_eq!(parsed.get_lower().null_bitmap, 1);
    }

    #[test]
    fn unknown_shapes_are_rejected() {
        let file = int_key_file();
        let cond = Condition::new(&file);
        let mut opt = OpenOption::new();

        // NOT is the planner's business, not the driver's
        let pred = Predicate::Not(Box::new(Predicate::eq(0, Value::Int32(1))));
        assert!(!cond.get_search_parameter(&pred, &mut opt));

        // a condition on a non-key field cannot drive this file
        let pred = Predicate::eq(5, Value::Int32(1));
        assert!(!cond.get_search_parameter(&pred, &mut opt));
    }

    #[test]
    fn comparison_with_null_matches_nothing() {
        let file = int_key_file();
        let (opt, parsed) = compile(&file, &Predicate::eq(0, Value::Null));
        assert_eq!(opt.get_str(OptionKey::Condition(0)).unwrap(), Some("#uk"));
        assert!(parsed.is_never_match());
    }
}
