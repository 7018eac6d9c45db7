// Short-hand constructors for `Value`, loosely modeled after serde_json's
// `json!` macro.

/// Create a [`Value`](crate::Value) from a literal.
///
/// ```
/// use boltdrive::{value, Value};
///
/// assert_eq!(value!(null), Value::Null);
/// assert_eq!(value!(true), Value::Boolean(true));
/// assert_eq!(value!(1), Value::Integer(1));
/// assert_eq!(value!("x"), Value::String("x".into()));
/// assert_eq!(value!([1, 2]), Value::List(vec![value!(1), value!(2)]));
/// ```
#[macro_export]
macro_rules! value {
    (null) => { $crate::Value::Null };
    ([ $($item:tt),* $(,)? ]) => {
        $crate::Value::List(vec![ $( $crate::value!($item) ),* ])
    };
    ({ $($key:literal : $value:tt),* $(,)? }) => {
        $crate::Value::Map($crate::value_map!({ $($key: $value),* }))
    };
    ($other:expr) => { $crate::Value::from($other) };
}

/// Create a `HashMap<String, Value>` from literals.
///
/// ```
/// use boltdrive::{value_map, Value};
///
/// let map = value_map!({"a": 1, "b": [true, null]});
/// assert_eq!(map.get("a"), Some(&Value::Integer(1)));
/// ```
#[macro_export]
macro_rules! value_map {
    ({ $($key:literal : $value:tt),* $(,)? }) => {
        {
            #[allow(unused_mut)]
            let mut map = std::collections::HashMap::new();
            $(
                map.insert(String::from($key), $crate::value!($value));
            )*
            map
        }
    };
}
