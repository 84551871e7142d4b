//! Typed node attributes read once at kernel construction.

use crate::error::{ForgeError, ForgeResult};
use std::collections::HashMap;

/// A single attribute value
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f32),
    Str(String),
    IntList(Vec<i64>),
    FloatList(Vec<f32>),
    StrList(Vec<String>),
}

impl AttrValue {
    fn type_name(&self) -> &'static str {
        match self {
            AttrValue::Bool(_) => "bool",
            AttrValue::Int(_) => "int",
            AttrValue::Float(_) => "float",
            AttrValue::Str(_) => "string",
            AttrValue::IntList(_) => "list(int)",
            AttrValue::FloatList(_) => "list(float)",
            AttrValue::StrList(_) => "list(string)",
        }
    }
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        AttrValue::Bool(v)
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        AttrValue::Int(v)
    }
}

impl From<f32> for AttrValue {
    fn from(v: f32) -> Self {
        AttrValue::Float(v)
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        AttrValue::Str(v.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        AttrValue::Str(v)
    }
}

impl From<Vec<i64>> for AttrValue {
    fn from(v: Vec<i64>) -> Self {
        AttrValue::IntList(v)
    }
}

impl From<Vec<f32>> for AttrValue {
    fn from(v: Vec<f32>) -> Self {
        AttrValue::FloatList(v)
    }
}

impl From<Vec<String>> for AttrValue {
    fn from(v: Vec<String>) -> Self {
        AttrValue::StrList(v)
    }
}

impl From<Vec<&str>> for AttrValue {
    fn from(v: Vec<&str>) -> Self {
        AttrValue::StrList(v.into_iter().map(str::to_string).collect())
    }
}

/// Attribute map of one graph node.
///
/// Required getters fail with `InvalidConfiguration` when the key is absent;
/// every getter fails when the stored value has another type.
#[derive(Debug, Clone, Default)]
pub struct AttrMap {
    values: HashMap<String, AttrValue>,
}

macro_rules! typed_getters {
    ($( $get:ident, $get_opt:ident, $variant:ident => $ty:ty );* $(;)?) => {
        $(
            pub fn $get(&self, key: &str) -> ForgeResult<$ty> {
                self.$get_opt(key)?.ok_or_else(|| {
                    ForgeError::InvalidConfiguration(format!("missing attribute '{}'", key))
                })
            }

            pub fn $get_opt(&self, key: &str) -> ForgeResult<Option<$ty>> {
                match self.values.get(key) {
                    None => Ok(None),
                    Some(AttrValue::$variant(v)) => Ok(Some(v.clone())),
                    Some(other) => Err(ForgeError::InvalidConfiguration(format!(
                        "attribute '{}' is {}, expected {}",
                        key,
                        other.type_name(),
                        stringify!($variant)
                    ))),
                }
            }
        )*
    };
}

impl AttrMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, key: &str, value: impl Into<AttrValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<AttrValue>) {
        self.values.insert(key.to_string(), value.into());
    }

    pub fn has(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    typed_getters! {
        get_bool, get_opt_bool, Bool => bool;
        get_int, get_opt_int, Int => i64;
        get_float, get_opt_float, Float => f32;
        get_str, get_opt_str, Str => String;
        get_int_list, get_opt_int_list, IntList => Vec<i64>;
        get_float_list, get_opt_float_list, FloatList => Vec<f32>;
        get_str_list, get_opt_str_list, StrList => Vec<String>;
    }
}
