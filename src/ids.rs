//! 128-bit time-ordered entity ids.
//!
//! Every row in the data model is keyed by a UUIDv7: the high bits are a
//! millisecond timestamp, so ids sort the same way their rows were created,
//! without a round-trip to the database for a sequence value.

use uuid::Uuid;

pub fn new_id() -> Uuid {
    Uuid::now_v7()
}

/// Encodes an id as base58, used for the domain verification token and the
/// registry repository path component.
pub fn encode(id: Uuid) -> String {
    bs58::encode(id.as_bytes()).into_string()
}

/// Decodes a base58 string back into an id. Fails if the decoded payload
/// isn't exactly 16 bytes.
pub fn decode(s: &str) -> Result<Uuid, DecodeIdError> {
    let bytes = bs58::decode(s).into_vec().map_err(|_| DecodeIdError)?;
    let arr: [u8; 16] = bytes.try_into().map_err(|_| DecodeIdError)?;
    Ok(Uuid::from_bytes(arr))
}

#[derive(Debug, thiserror::Error)]
#[error("invalid id encoding")]
pub struct DecodeIdError;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base58_round_trips() {
        let id = new_id();
        let encoded = encode(id);
        let decoded = decode(&encoded).unwrap();
        assert_eq!(id, decoded);
    }

    #[test]
    fn v7_ids_sort_by_creation_order() {
        let a = new_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = new_id();
        assert!(a < b);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode("not-base58-!!!").is_err());
        // valid base58 but wrong length
        assert!(decode(&bs58::encode(b"too short").into_string()).is_err());
    }
}
