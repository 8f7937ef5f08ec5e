use serde::{
    de::DeserializeOwned,
    Serialize,
};

/// Canonical encoding used for signatures and content hashes. The contract is
/// determinism: encoding the same value twice must yield identical bytes
/// (stable field ordering, no floats), or signature verification breaks.
pub trait Codec: Clone + Send + Sync + 'static {
    fn encode<T: Serialize>(&self, value: &T) -> anyhow::Result<Vec<u8>>;
    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> anyhow::Result<T>;
}

/// Default codec: bincode with its fixed-width little-endian integer
/// encoding, which is deterministic for any given value.
#[derive(Clone, Copy, Default)]
pub struct BincodeCodec;

impl BincodeCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Codec for BincodeCodec {
    fn encode<T: Serialize>(&self, value: &T) -> anyhow::Result<Vec<u8>> {
        Ok(bincode::serialize(value)?)
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> anyhow::Result<T> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde::{
        Deserialize,
        Serialize,
    };

    use super::{
        BincodeCodec,
        Codec,
    };

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Record {
        revision: u64,
        payload: Vec<u8>,
        users: BTreeMap<String, u32>,
    }

    #[test]
    fn test_encode_is_deterministic() {
        let codec = BincodeCodec::new();
        let record = Record {
            revision: 12,
            payload: vec![1, 2, 3],
            users: [("a".to_string(), 1), ("b".to_string(), 2)].into(),
        };
        let one = codec.encode(&record).unwrap();
        let two = codec.encode(&record).unwrap();
        assert_eq!(one, two);
        let back: Record = codec.decode(&one).unwrap();
        assert_eq!(back, record);
    }
}
