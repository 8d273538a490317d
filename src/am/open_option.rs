//! The key/value dictionary carried through `open`.
//!
//! This map is the only contract between the condition compiler, the
//! planner and the drivers: the planner fills it, the driver re-parses
//! it at open time.

use crate::{Error, Result, TupleBitSetPtr};

use std::collections::HashMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Search,
    Update,
    Initialize,
    Batch,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OptionKey {
    OpenMode,
    FieldSelect,
    TargetFieldNumber,
    TargetFieldIndex(u32),
    GetByBitSet,
    SearchByBitSet,
    GetForConstraintLock,
    Estimate,
    ConditionCount,
    Condition(u32),
    EqualFieldNumber,
    Reverse,
    FetchFieldNumber,
    MinMax,
}

#[derive(Clone)]
pub enum OptionValue {
    Int(i64),
    Bool(bool),
    Str(String),
    BitSet(TupleBitSetPtr),
}

pub const MIN_MAX_MIN: i64 = 0;
pub const MIN_MAX_MAX: i64 = 1;

#[derive(Clone, Default)]
pub struct OpenOption {
    map: HashMap<OptionKey, OptionValue>,
}

impl OpenOption {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_int(&mut self, key: OptionKey, value: i64) {
        self.map.insert(key, OptionValue::Int(value));
    }

    pub fn set_bool(&mut self, key: OptionKey, value: bool) {
        self.map.insert(key, OptionValue::Bool(value));
    }

    pub fn set_str(&mut self, key: OptionKey, value: String) {
        self.map.insert(key, OptionValue::Str(value));
    }

    pub fn set_bitset(&mut self, key: OptionKey, value: TupleBitSetPtr) {
        self.map.insert(key, OptionValue::BitSet(value));
    }

    pub fn set_open_mode(&mut self, mode: OpenMode) {
        let value = match mode {
            OpenMode::Read => 0,
            OpenMode::Search => 1,
            OpenMode::Update => 2,
            OpenMode::Initialize => 3,
            OpenMode::Batch => 4,
        };
        self.set_int(OptionKey::OpenMode, value);
    }

    pub fn contains(&self, key: OptionKey) -> bool {
        self.map.contains_key(&key)
    }

    pub fn get_int(&self, key: OptionKey) -> Result<Option<i64>> {
        match self.map.get(&key) {
            None => Ok(None),
            Some(OptionValue::Int(v)) => Ok(Some(*v)),
            Some(_) => Err(bad_kind(key, "int")),
        }
    }

    pub fn get_int_or(&self, key: OptionKey, default: i64) -> Result<i64> {
        Ok(self.get_int(key)?.unwrap_or(default))
    }

    pub fn get_bool(&self, key: OptionKey) -> Result<bool> {
        match self.map.get(&key) {
            None => Ok(false),
            Some(OptionValue::Bool(v)) => Ok(*v),
            Some(_) => Err(bad_kind(key, "bool")),
        }
    }

    pub fn get_str(&self, key: OptionKey) -> Result<Option<&str>> {
        match self.map.get(&key) {
            None => Ok(None),
            Some(OptionValue::Str(v)) => Ok(Some(v.as_str())),
            Some(_) => Err(bad_kind(key, "string")),
        }
    }

    pub fn get_bitset(&self, key: OptionKey) -> Result<Option<TupleBitSetPtr>> {
        match self.map.get(&key) {
            None => Ok(None),
            Some(OptionValue::BitSet(v)) => Ok(Some(v.clone())),
            Some(_) => Err(bad_kind(key, "bitset")),
        }
    }

    pub fn get_open_mode(&self) -> Result<OpenMode> {
        match self.get_int(OptionKey::OpenMode)? {
            None | Some(0) => Ok(OpenMode::Read),
            Some(1) => Ok(OpenMode::Search),
            Some(2) => Ok(OpenMode::Update),
            Some(3) => Ok(OpenMode::Initialize),
            Some(4) => Ok(OpenMode::Batch),
            Some(v) => Err(Error::BadArgument(format!("unknown open mode {}", v))),
        }
    }
}

fn bad_kind(key: OptionKey, expected: &str) -> Error {
    Error::BadArgument(format!(
        "open option {:?} does not hold a {} value",
        key, expected
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_getters_check_kinds() {
        let mut opt = OpenOption::new();
        opt.set_int(OptionKey::ConditionCount, 2);
        opt.set_bool(OptionKey::Reverse, true);
        opt.set_str(OptionKey::Condition(0), "#eq(10)".to_string());

        assert_eq!(opt.get_int(OptionKey::ConditionCount).unwrap(), Some(2));
        assert!(opt.get_bool(OptionKey::Reverse).unwrap());
        assert_eq!(
            opt.get_str(OptionKey::Condition(0)).unwrap(),
            Some("#eq(10)")
        );

        // a key bound to another kind is a bad argument
        assert!(opt.get_str(OptionKey::ConditionCount).is_err());
        assert!(opt.get_int(OptionKey::Condition(0)).is_err());
    }

    #[test]
    fn open_mode_round_trip() {
        let mut opt = OpenOption::new();
        for mode in &[
            OpenMode::Read,
            OpenMode::Search,
            OpenMode::Update,
            OpenMode::Initialize,
            OpenMode::Batch,
        ] {
            opt.set_open_mode(*mode);
            assert_eq!(opt.get_open_mode().unwrap(), *mode);
        }
    }
}
