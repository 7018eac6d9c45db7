use std::io::Read;

use super::packstream;
use crate::error::{DriverError, Result};
use crate::value::Value;

/// One decoded Bolt message: the structure tag plus its field values.
#[derive(Debug)]
pub(crate) struct BoltMessage {
    pub(crate) tag: u8,
    pub(crate) fields: Vec<Value>,
}

impl BoltMessage {
    pub(crate) fn load<R: Read>(reader: &mut R) -> Result<Self> {
        let mut marker = [0; 1];
        DriverError::wrap_read(reader.read_exact(&mut marker))?;
        let marker = marker[0];
        if !(0xB0..=0xBF).contains(&marker) {
            return Err(DriverError::protocol_error(format!(
                "expected bolt message marker, received {marker:02X?}"
            )));
        }
        let size = marker - 0xB0;
        let mut tag = [0; 1];
        DriverError::wrap_read(reader.read_exact(&mut tag))?;
        let fields = (0..size)
            .map(|_| {
                packstream::read_value(reader).map_err(|err| match err {
                    packstream::PackStreamError::Io(err) => DriverError::read_err(err),
                    packstream::PackStreamError::Protocol(reason) => {
                        DriverError::protocol_error(reason)
                    }
                })
            })
            .collect::<Result<_>>()?;
        Ok(Self {
            tag: tag[0],
            fields,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_success_message() {
        // SUCCESS {"fields": ["x"]}
        let wire = [
            0xB1, 0x70, 0xA1, 0x86, b'f', b'i', b'e', b'l', b'd', b's', 0x91, 0x81, b'x',
        ];
        let message = BoltMessage::load(&mut wire.as_slice()).unwrap();
        assert_eq!(message.tag, 0x70);
        assert_eq!(message.fields.len(), 1);
    }

    #[test]
    fn rejects_non_structure() {
        let wire = [0xC0];
        let err = BoltMessage::load(&mut wire.as_slice()).unwrap_err();
        assert!(matches!(err, DriverError::Protocol { .. }));
    }
}
