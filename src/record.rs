//! Operation records: the payload of one ledger entry.
//!
//! Layout: `keyspace id (4) | opcode (1) | key length (1) | key | value`.
//! The value occupies the rest of the record and is only present for puts.

use crate::error::{Error, Result};
use crate::types::KeyspaceId;

pub const MAX_KEY_LEN: usize = u8::MAX as usize;

const HEADER_LEN: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Delete = 0,
    Put = 1,
}

impl TryFrom<u8> for Opcode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Opcode::Delete),
            1 => Ok(Opcode::Put),
            _ => Err(Error::MalformedRecord("unknown opcode")),
        }
    }
}

/// A decoded key-value operation.
#[derive(Clone, PartialEq, Eq)]
pub struct OpRecord {
    pub keyspace: KeyspaceId,
    pub key: Vec<u8>,
    /// `Some` for puts, `None` for deletes.
    pub value: Option<Vec<u8>>,
}

impl std::fmt::Debug for OpRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpRecord")
            .field("keyspace", &self.keyspace)
            .field("key_len", &self.key.len())
            .field("value_len", &self.value.as_ref().map(Vec::len))
            .finish()
    }
}

impl OpRecord {
    pub fn put(keyspace: KeyspaceId, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            keyspace,
            key: key.into(),
            value: Some(value.into()),
        }
    }

    pub fn delete(keyspace: KeyspaceId, key: impl Into<Vec<u8>>) -> Self {
        Self {
            keyspace,
            key: key.into(),
            value: None,
        }
    }

    pub fn opcode(&self) -> Opcode {
        if self.value.is_some() {
            Opcode::Put
        } else {
            Opcode::Delete
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        encode(self.keyspace, &self.key, self.value.as_deref())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::MalformedRecord("shorter than header"));
        }
        let mut id = [0u8; 4];
        id.copy_from_slice(&bytes[..4]);
        let opcode = Opcode::try_from(bytes[4])?;
        let key_len = bytes[5] as usize;
        let body = &bytes[HEADER_LEN..];
        if body.len() < key_len {
            return Err(Error::MalformedRecord("key runs past end of record"));
        }
        let (key, rest) = body.split_at(key_len);
        let value = match opcode {
            Opcode::Put => Some(rest.to_vec()),
            Opcode::Delete if rest.is_empty() => None,
            Opcode::Delete => return Err(Error::MalformedRecord("delete carries a value")),
        };
        Ok(Self {
            keyspace: KeyspaceId(id),
            key: key.to_vec(),
            value,
        })
    }
}

/// Encode without building an [`OpRecord`]. Rejects keys over 255 bytes.
pub fn encode(keyspace: KeyspaceId, key: &[u8], value: Option<&[u8]>) -> Result<Vec<u8>> {
    if key.len() > MAX_KEY_LEN {
        return Err(Error::KeyTooLong(key.len()));
    }
    let value_len = value.map_or(0, <[u8]>::len);
    let mut buf = Vec::with_capacity(HEADER_LEN + key.len() + value_len);
    buf.extend_from_slice(keyspace.as_bytes());
    buf.push(match value {
        Some(_) => Opcode::Put as u8,
        None => Opcode::Delete as u8,
    });
    buf.push(key.len() as u8);
    buf.extend_from_slice(key);
    if let Some(value) = value {
        buf.extend_from_slice(value);
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ks() -> KeyspaceId {
        KeyspaceId::from_name("coldb")
    }

    #[test]
    fn put_round_trips_at_key_length_bounds() {
        for key_len in [0usize, 255] {
            let key = vec![0xAB; key_len];
            let value = vec![0u8, 1, 2, 0xFF, 0];
            let bytes = OpRecord::put(ks(), key.clone(), value.clone()).encode().unwrap();
            assert_eq!(bytes.len(), HEADER_LEN + key_len + value.len());

            let decoded = OpRecord::decode(&bytes).unwrap();
            assert_eq!(decoded.keyspace, ks());
            assert_eq!(decoded.opcode(), Opcode::Put);
            assert_eq!(decoded.key, key);
            assert_eq!(decoded.value, Some(value));
        }
    }

    #[test]
    fn put_with_empty_value_stays_a_put() {
        let bytes = OpRecord::put(ks(), b"k".to_vec(), Vec::new()).encode().unwrap();
        let decoded = OpRecord::decode(&bytes).unwrap();
        assert_eq!(decoded.opcode(), Opcode::Put);
        assert_eq!(decoded.value, Some(Vec::new()));
    }

    #[test]
    fn delete_decodes_without_value() {
        let bytes = OpRecord::delete(ks(), b"gone".to_vec()).encode().unwrap();
        assert_eq!(bytes[4], 0x00);
        let decoded = OpRecord::decode(&bytes).unwrap();
        assert_eq!(decoded.opcode(), Opcode::Delete);
        assert_eq!(decoded.key, b"gone");
        assert_eq!(decoded.value, None);
    }

    #[test]
    fn header_layout_is_fixed() {
        let bytes = encode(ks(), b"oi", Some(b"hello")).unwrap();
        assert_eq!(&bytes[..4], ks().as_bytes());
        assert_eq!(bytes[4], 0x01);
        assert_eq!(bytes[5], 2);
        assert_eq!(&bytes[6..8], b"oi");
        assert_eq!(&bytes[8..], b"hello");
    }

    #[test]
    fn rejects_long_keys_and_garbage() {
        let key = vec![1u8; 256];
        assert!(matches!(
            encode(ks(), &key, Some(b"v")),
            Err(Error::KeyTooLong(256))
        ));
        assert!(OpRecord::decode(&[1, 2, 3]).is_err());
        assert!(OpRecord::decode(&[0, 0, 0, 0, 7, 0]).is_err());
        // key length claims more bytes than present
        assert!(OpRecord::decode(&[0, 0, 0, 0, 1, 9, b'a']).is_err());
        assert!(OpRecord::decode(&[0, 0, 0, 0, 0, 1, b'a', b'x']).is_err());
    }

    #[test]
    fn keyspace_id_is_stable() {
        assert_eq!(KeyspaceId::from_name("coldb"), KeyspaceId::from_name("coldb"));
        assert_ne!(KeyspaceId::from_name("coldb"), KeyspaceId::from_name("hotdb"));
        assert_eq!(KeyspaceId::from_name("coldb").to_hex().len(), 8);
    }

    #[test]
    fn keyspace_id_known_vectors() {
        // CRC-32C check value 0xE3069283, low byte first
        assert_eq!(KeyspaceId::from_name("123456789").to_hex(), "839206E3");
        assert_eq!(KeyspaceId::from_name("coldb").0, [0x25, 0xCF, 0x3A, 0x7C]);
        assert_eq!(KeyspaceId::from_name("coldb").to_hex(), "25CF3A7C");
    }
}
