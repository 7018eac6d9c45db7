use std::collections::HashMap;

/// A value exchanged with the server.
///
/// This is the driver's rendering of the PackStream type system: scalars,
/// byte arrays, strings, lists, string-keyed maps, and tagged structures.
/// Integers are signed 64-bit, floats are IEEE-754 double precision.
///
/// Values the protocol models as structures (nodes, relationships, temporal
/// and spatial types, ...) are carried as [`Value::Structure`] with the wire
/// tag and fields preserved verbatim.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Bytes(Vec<u8>),
    String(String),
    List(Vec<Value>),
    Map(HashMap<String, Value>),
    Structure { tag: u8, fields: Vec<Value> },
}

impl Value {
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<&String> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&Vec<Value>> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&HashMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn try_into_bool(self) -> Result<bool, Self> {
        match self {
            Value::Boolean(b) => Ok(b),
            v => Err(v),
        }
    }

    pub fn try_into_int(self) -> Result<i64, Self> {
        match self {
            Value::Integer(i) => Ok(i),
            v => Err(v),
        }
    }

    pub fn try_into_string(self) -> Result<String, Self> {
        match self {
            Value::String(s) => Ok(s),
            v => Err(v),
        }
    }

    pub fn try_into_list(self) -> Result<Vec<Value>, Self> {
        match self {
            Value::List(l) => Ok(l),
            v => Err(v),
        }
    }

    pub fn try_into_map(self) -> Result<HashMap<String, Value>, Self> {
        match self {
            Value::Map(m) => Ok(m),
            v => Err(v),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

macro_rules! impl_value_from_int {
    ( $($ty:ty),* ) => {
        $(
            impl From<$ty> for Value {
                fn from(value: $ty) -> Self {
                    Value::Integer(value.into())
                }
            }
        )*
    };
}

impl_value_from_int!(i8, i16, i32, i64, u8, u16, u32);

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<f32> for Value {
    fn from(value: f32) -> Self {
        Value::Float(value.into())
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.into())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl<V: Into<Value>> From<Vec<V>> for Value {
    fn from(value: Vec<V>) -> Self {
        Value::List(value.into_iter().map(Into::into).collect())
    }
}

impl<V: Into<Value>> From<HashMap<String, V>> for Value {
    fn from(value: HashMap<String, V>) -> Self {
        Value::Map(value.into_iter().map(|(k, v)| (k, v.into())).collect())
    }
}

impl<V: Into<Value>> From<Option<V>> for Value {
    fn from(value: Option<V>) -> Self {
        match value {
            None => Value::Null,
            Some(v) => v.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value_map;

    #[test]
    fn conversions() {
        assert_eq!(Value::from(1_i32), Value::Integer(1));
        assert_eq!(Value::from(1.5), Value::Float(1.5));
        assert_eq!(Value::from("x"), Value::String("x".into()));
        assert_eq!(
            Value::from(vec![1, 2]),
            Value::List(vec![Value::Integer(1), Value::Integer(2)])
        );
        assert_eq!(Value::from(None::<i64>), Value::Null);
    }

    #[test]
    fn map_macro() {
        let map = value_map!({"a": 1, "b": "two"});
        assert_eq!(map.get("a"), Some(&Value::Integer(1)));
        assert_eq!(map.get("b"), Some(&Value::String("two".into())));
    }
}
