//! PackStream: the self-describing binary serialization Bolt messages are
//! made of.

use std::collections::HashMap;
use std::io::{Read, Write};

use thiserror::Error;

use crate::value::Value;

const NULL: u8 = 0xC0;
const FLOAT_64: u8 = 0xC1;
const FALSE: u8 = 0xC2;
const TRUE: u8 = 0xC3;
const INT_8: u8 = 0xC8;
const INT_16: u8 = 0xC9;
const INT_32: u8 = 0xCA;
const INT_64: u8 = 0xCB;
const BYTES_8: u8 = 0xCC;
const BYTES_16: u8 = 0xCD;
const BYTES_32: u8 = 0xCE;
const TINY_STRING: u8 = 0x80;
const STRING_8: u8 = 0xD0;
const STRING_16: u8 = 0xD1;
const STRING_32: u8 = 0xD2;
const TINY_LIST: u8 = 0x90;
const LIST_8: u8 = 0xD4;
const LIST_16: u8 = 0xD5;
const LIST_32: u8 = 0xD6;
const TINY_MAP: u8 = 0xA0;
const MAP_8: u8 = 0xD8;
const MAP_16: u8 = 0xD9;
const MAP_32: u8 = 0xDA;
const TINY_STRUCT: u8 = 0xB0;

const MAX_SIZE_32: usize = 2_147_483_647;

#[derive(Debug, Error)]
pub(crate) enum PackStreamError {
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Protocol(String),
}

impl From<String> for PackStreamError {
    fn from(message: String) -> Self {
        Self::Protocol(message)
    }
}

impl From<&str> for PackStreamError {
    fn from(message: &str) -> Self {
        Self::Protocol(message.into())
    }
}

pub(crate) fn write_value<W: Write>(writer: &mut W, value: &Value) -> Result<(), PackStreamError> {
    match value {
        Value::Null => writer.write_all(&[NULL])?,
        Value::Boolean(false) => writer.write_all(&[FALSE])?,
        Value::Boolean(true) => writer.write_all(&[TRUE])?,
        Value::Integer(i) => write_int(writer, *i)?,
        Value::Float(f) => {
            writer.write_all(&[FLOAT_64])?;
            writer.write_all(&f.to_be_bytes())?;
        }
        Value::Bytes(b) => write_bytes(writer, b)?,
        Value::String(s) => write_string(writer, s)?,
        Value::List(l) => {
            write_list_header(writer, l.len())?;
            for item in l {
                write_value(writer, item)?;
            }
        }
        Value::Map(m) => write_map(writer, m)?,
        Value::Structure { tag, fields } => {
            write_struct_header(writer, *tag, fields.len())?;
            for field in fields {
                write_value(writer, field)?;
            }
        }
    }
    Ok(())
}

fn write_int<W: Write>(writer: &mut W, i: i64) -> Result<(), PackStreamError> {
    if (-16..=127).contains(&i) {
        writer.write_all(&(i as i8).to_be_bytes())?;
    } else if (-128..=127).contains(&i) {
        writer.write_all(&[INT_8])?;
        writer.write_all(&(i as i8).to_be_bytes())?;
    } else if (-32_768..=32_767).contains(&i) {
        writer.write_all(&[INT_16])?;
        writer.write_all(&(i as i16).to_be_bytes())?;
    } else if (-2_147_483_648..=2_147_483_647).contains(&i) {
        writer.write_all(&[INT_32])?;
        writer.write_all(&(i as i32).to_be_bytes())?;
    } else {
        writer.write_all(&[INT_64])?;
        writer.write_all(&i.to_be_bytes())?;
    }
    Ok(())
}

fn write_bytes<W: Write>(writer: &mut W, b: &[u8]) -> Result<(), PackStreamError> {
    let size = b.len();
    if size <= 255 {
        writer.write_all(&[BYTES_8, size as u8])?;
    } else if size <= 65_535 {
        writer.write_all(&[BYTES_16])?;
        writer.write_all(&(size as u16).to_be_bytes())?;
    } else if size <= MAX_SIZE_32 {
        writer.write_all(&[BYTES_32])?;
        writer.write_all(&(size as u32).to_be_bytes())?;
    } else {
        return Err("bytes exceed max size of 2,147,483,647".into());
    }
    writer.write_all(b)?;
    Ok(())
}

fn write_string<W: Write>(writer: &mut W, s: &str) -> Result<(), PackStreamError> {
    let bytes = s.as_bytes();
    let size = bytes.len();
    if size <= 15 {
        writer.write_all(&[TINY_STRING + size as u8])?;
    } else if size <= 255 {
        writer.write_all(&[STRING_8, size as u8])?;
    } else if size <= 65_535 {
        writer.write_all(&[STRING_16])?;
        writer.write_all(&(size as u16).to_be_bytes())?;
    } else if size <= MAX_SIZE_32 {
        writer.write_all(&[STRING_32])?;
        writer.write_all(&(size as u32).to_be_bytes())?;
    } else {
        return Err("string exceeds max size of 2,147,483,647 bytes".into());
    }
    writer.write_all(bytes)?;
    Ok(())
}

fn write_list_header<W: Write>(writer: &mut W, size: usize) -> Result<(), PackStreamError> {
    if size <= 15 {
        writer.write_all(&[TINY_LIST + size as u8])?;
    } else if size <= 255 {
        writer.write_all(&[LIST_8, size as u8])?;
    } else if size <= 65_535 {
        writer.write_all(&[LIST_16])?;
        writer.write_all(&(size as u16).to_be_bytes())?;
    } else if size <= MAX_SIZE_32 {
        writer.write_all(&[LIST_32])?;
        writer.write_all(&(size as u32).to_be_bytes())?;
    } else {
        return Err("list exceeds max size of 2,147,483,647".into());
    }
    Ok(())
}

fn write_map<W: Write>(
    writer: &mut W,
    map: &HashMap<String, Value>,
) -> Result<(), PackStreamError> {
    write_map_header(writer, map.len())?;
    for (key, value) in map {
        write_string(writer, key)?;
        write_value(writer, value)?;
    }
    Ok(())
}

fn write_map_header<W: Write>(writer: &mut W, size: usize) -> Result<(), PackStreamError> {
    if size <= 15 {
        writer.write_all(&[TINY_MAP + size as u8])?;
    } else if size <= 255 {
        writer.write_all(&[MAP_8, size as u8])?;
    } else if size <= 65_535 {
        writer.write_all(&[MAP_16])?;
        writer.write_all(&(size as u16).to_be_bytes())?;
    } else if size <= MAX_SIZE_32 {
        writer.write_all(&[MAP_32])?;
        writer.write_all(&(size as u32).to_be_bytes())?;
    } else {
        return Err("map exceeds max size of 2,147,483,647".into());
    }
    Ok(())
}

fn write_struct_header<W: Write>(
    writer: &mut W,
    tag: u8,
    size: usize,
) -> Result<(), PackStreamError> {
    if size > 15 {
        return Err("structure exceeds max field count of 15".into());
    }
    writer.write_all(&[TINY_STRUCT + size as u8, tag])?;
    Ok(())
}

pub(crate) fn read_value<R: Read>(reader: &mut R) -> Result<Value, PackStreamError> {
    let marker = read_u8(reader)?;
    read_value_for_marker(reader, marker)
}

fn read_value_for_marker<R: Read>(reader: &mut R, marker: u8) -> Result<Value, PackStreamError> {
    Ok(match marker {
        NULL => Value::Null,
        FALSE => Value::Boolean(false),
        TRUE => Value::Boolean(true),
        // tiny int: the marker byte is the (signed) value
        _ if marker >= 0xF0 || marker <= 0x7F => {
            Value::Integer(i8::from_be_bytes([marker]).into())
        }
        INT_8 => Value::Integer(read_i8(reader)?.into()),
        INT_16 => Value::Integer(read_i16(reader)?.into()),
        INT_32 => Value::Integer(read_i32(reader)?.into()),
        INT_64 => Value::Integer(read_i64(reader)?),
        FLOAT_64 => Value::Float(read_f64(reader)?),
        BYTES_8 => {
            let size = read_u8(reader)?;
            Value::Bytes(read_exact(reader, size.into())?)
        }
        BYTES_16 => {
            let size = read_u16(reader)?;
            Value::Bytes(read_exact(reader, size.into())?)
        }
        BYTES_32 => {
            let size = read_u32_size(reader, "bytes")?;
            Value::Bytes(read_exact(reader, size)?)
        }
        _ if (TINY_STRING..=0x8F).contains(&marker) => {
            Value::String(read_string(reader, (marker - TINY_STRING).into())?)
        }
        STRING_8 => {
            let size = read_u8(reader)?;
            Value::String(read_string(reader, size.into())?)
        }
        STRING_16 => {
            let size = read_u16(reader)?;
            Value::String(read_string(reader, size.into())?)
        }
        STRING_32 => {
            let size = read_u32_size(reader, "string")?;
            Value::String(read_string(reader, size)?)
        }
        _ if (TINY_LIST..=0x9F).contains(&marker) => {
            Value::List(read_list(reader, (marker - TINY_LIST).into())?)
        }
        LIST_8 => {
            let size = read_u8(reader)?;
            Value::List(read_list(reader, size.into())?)
        }
        LIST_16 => {
            let size = read_u16(reader)?;
            Value::List(read_list(reader, size.into())?)
        }
        LIST_32 => {
            let size = read_u32_size(reader, "list")?;
            Value::List(read_list(reader, size)?)
        }
        _ if (TINY_MAP..=0xAF).contains(&marker) => {
            Value::Map(read_map(reader, (marker - TINY_MAP).into())?)
        }
        MAP_8 => {
            let size = read_u8(reader)?;
            Value::Map(read_map(reader, size.into())?)
        }
        MAP_16 => {
            let size = read_u16(reader)?;
            Value::Map(read_map(reader, size.into())?)
        }
        MAP_32 => {
            let size = read_u32_size(reader, "map")?;
            Value::Map(read_map(reader, size)?)
        }
        _ if (TINY_STRUCT..=0xBF).contains(&marker) => {
            let size = marker - TINY_STRUCT;
            let tag = read_u8(reader)?;
            Value::Structure {
                tag,
                fields: read_list(reader, size.into())?,
            }
        }
        _ => return Err(format!("unknown marker {marker:#04X}").into()),
    })
}

fn read_exact<R: Read>(reader: &mut R, size: usize) -> Result<Vec<u8>, PackStreamError> {
    let mut bytes = vec![0; size];
    reader.read_exact(&mut bytes)?;
    Ok(bytes)
}

fn read_string<R: Read>(reader: &mut R, size: usize) -> Result<String, PackStreamError> {
    let bytes = read_exact(reader, size)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn read_list<R: Read>(reader: &mut R, size: usize) -> Result<Vec<Value>, PackStreamError> {
    let mut list = Vec::with_capacity(size.min(1024));
    for _ in 0..size {
        list.push(read_value(reader)?);
    }
    Ok(list)
}

fn read_map<R: Read>(
    reader: &mut R,
    size: usize,
) -> Result<HashMap<String, Value>, PackStreamError> {
    let mut map = HashMap::with_capacity(size.min(1024));
    for _ in 0..size {
        let key = match read_value(reader)? {
            Value::String(key) => key,
            v => return Err(format!("expected map key to be a string, found {v:?}").into()),
        };
        let value = read_value(reader)?;
        map.insert(key, value);
    }
    Ok(map)
}

fn read_u32_size<R: Read>(reader: &mut R, what: &str) -> Result<usize, PackStreamError> {
    if usize::BITS < 32 {
        return Err(format!("server wants to send a {what} larger than addressable").into());
    }
    Ok(read_u32(reader)? as usize)
}

macro_rules! impl_read_number {
    ( $($name:ident: $ty:ty),* $(,)? ) => {
        $(
            fn $name<R: Read>(reader: &mut R) -> Result<$ty, PackStreamError> {
                let mut buffer = [0; std::mem::size_of::<$ty>()];
                reader.read_exact(&mut buffer)?;
                Ok(<$ty>::from_be_bytes(buffer))
            }
        )*
    };
}

impl_read_number!(
    read_u8: u8,
    read_u16: u16,
    read_u32: u32,
    read_i8: i8,
    read_i16: i16,
    read_i32: i32,
    read_i64: i64,
    read_f64: f64,
);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{value, value_map};
    use rstest::*;

    fn encode(value: &Value) -> Vec<u8> {
        let mut buffer = Vec::new();
        write_value(&mut buffer, value).unwrap();
        buffer
    }

    fn decode(bytes: &[u8]) -> Value {
        let mut reader = bytes;
        let value = read_value(&mut reader).unwrap();
        assert!(reader.is_empty(), "decoder left {} trailing bytes", reader.len());
        value
    }

    #[rstest]
    #[case(value!(null), vec![0xC0])]
    #[case(value!(false), vec![0xC2])]
    #[case(value!(true), vec![0xC3])]
    #[case(value!(0), vec![0x00])]
    #[case(value!(127), vec![0x7F])]
    #[case(value!(-16), vec![0xF0])]
    #[case(value!(-17), vec![0xC8, 0xEF])]
    #[case(value!(-128), vec![0xC8, 0x80])]
    #[case(value!(128), vec![0xC9, 0x00, 0x80])]
    #[case(value!(-32_768), vec![0xC9, 0x80, 0x00])]
    #[case(value!(32_768), vec![0xCA, 0x00, 0x00, 0x80, 0x00])]
    #[case(value!(2_147_483_648_i64),
           vec![0xCB, 0x00, 0x00, 0x00, 0x00, 0x80, 0x00, 0x00, 0x00])]
    #[case(value!(1.23), vec![0xC1, 0x3F, 0xF3, 0xAE, 0x14, 0x7A, 0xE1, 0x47, 0xAE])]
    #[case(value!(""), vec![0x80])]
    #[case(value!("A"), vec![0x81, 0x41])]
    #[case(value!([]), vec![0x90])]
    #[case(value!([1, 2.0]),
           vec![0x92, 0x01, 0xC1, 0x40, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00])]
    #[case(value!({}), vec![0xA0])]
    #[case(value!({"A": 1}), vec![0xA1, 0x81, 0x41, 0x01])]
    fn encode_golden_bytes(#[case] value: Value, #[case] expected: Vec<u8>) {
        assert_eq!(encode(&value), expected);
    }

    #[test]
    fn encode_bytes() {
        assert_eq!(
            encode(&Value::Bytes(vec![0x01, 0x02])),
            vec![0xCC, 0x02, 0x01, 0x02]
        );
        let long = Value::Bytes(vec![0xAA; 256]);
        let encoded = encode(&long);
        assert_eq!(&encoded[..3], &[0xCD, 0x01, 0x00]);
        assert_eq!(encoded.len(), 3 + 256);
    }

    #[test]
    fn encode_medium_string() {
        let value = value!("A".repeat(16).as_str());
        let encoded = encode(&value);
        assert_eq!(&encoded[..2], &[0xD0, 16]);
    }

    #[test]
    fn encode_structure() {
        let value = Value::Structure {
            tag: 0x66,
            fields: vec![value!(1), value!("x")],
        };
        assert_eq!(encode(&value), vec![0xB2, 0x66, 0x01, 0x81, 0x78]);
    }

    #[rstest]
    #[case(value!(null))]
    #[case(value!(true))]
    #[case(value!(false))]
    #[case(value!(0))]
    #[case(value!(-16))]
    #[case(value!(127))]
    #[case(value!(42_000))]
    #[case(value!(-1_234_567_890_123_i64))]
    #[case(value!(i64::MIN))]
    #[case(value!(i64::MAX))]
    #[case(value!(0.0))]
    #[case(value!(-1.5e-300))]
    #[case(Value::Bytes(vec![]))]
    #[case(Value::Bytes(vec![0x00, 0xFF]))]
    #[case(value!(""))]
    #[case(value!("hello, world"))]
    #[case(value!("üöä ⚡"))]
    #[case(value!([1, [2, [3]], "deep"]))]
    #[case(value!({"k": {"nested": [1, null]}, "b": true}))]
    #[case(Value::Structure { tag: 0x4E, fields: vec![value!(1), value!([]), value!({})] })]
    fn round_trip(#[case] value: Value) {
        assert_eq!(decode(&encode(&value)), value);
    }

    #[test]
    fn round_trip_large_collections() {
        let list = Value::List((0..300).map(Value::Integer).collect());
        assert_eq!(decode(&encode(&list)), list);
        let map = Value::Map(
            (0..300)
                .map(|i| (format!("key-{i}"), Value::Integer(i)))
                .collect(),
        );
        assert_eq!(decode(&encode(&map)), map);
    }

    #[test]
    fn decode_accepts_widened_integers() {
        // 1 fits a tiny int but may arrive in any wider encoding
        for bytes in [
            vec![0x01],
            vec![0xC8, 0x01],
            vec![0xC9, 0x00, 0x01],
            vec![0xCA, 0x00, 0x00, 0x00, 0x01],
            vec![0xCB, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01],
        ] {
            assert_eq!(decode(&bytes), value!(1));
        }
    }

    #[rstest]
    #[case(vec![0xC4])]
    #[case(vec![0xC5])]
    #[case(vec![0xCF])]
    #[case(vec![0xD3])]
    #[case(vec![0xD7])]
    #[case(vec![0xDB])]
    #[case(vec![0xFF; 0])]
    fn decode_rejects_unknown_markers_and_eof(#[case] bytes: Vec<u8>) {
        let mut reader = bytes.as_slice();
        assert!(read_value(&mut reader).is_err());
    }

    #[test]
    fn decode_rejects_non_string_map_keys() {
        // {1: 2}
        let bytes = [0xA1, 0x01, 0x02];
        let mut reader = bytes.as_slice();
        let err = read_value(&mut reader).unwrap_err();
        assert!(matches!(err, PackStreamError::Protocol(_)));
    }

    #[test]
    fn encode_rejects_oversized_structures() {
        let value = Value::Structure {
            tag: 0x01,
            fields: vec![Value::Null; 16],
        };
        let mut buffer = Vec::new();
        assert!(write_value(&mut buffer, &value).is_err());
    }

    #[test]
    fn map_key_map_value_value_map() {
        let value = Value::Map(value_map!({"a": 1}));
        assert_eq!(decode(&encode(&value)), value);
    }
}
