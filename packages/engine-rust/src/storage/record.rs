//! Table names and the record codec shared by every stored shape.
//!
//! All stored records are `MsgPack` maps produced by
//! [`rmp_serde::to_vec_named`], so fields can be added without breaking
//! older readers.

use serde::de::DeserializeOwned;
use serde::Serialize;

use dynastore_core::{StoreError, StoreResult};

/// Serialized generated record types, keyed by type name.
pub const TYPES_TABLE: &str = "record_types";

/// Document records, keyed by canonical key.
pub const DOCUMENTS_TABLE: &str = "documents";

/// Blob root records, keyed by blob id.
pub const BLOBS_TABLE: &str = "blobs";

/// Blob chunk records, keyed by `<escaped blob id>/<version>/<index>`.
pub const BLOB_CHUNKS_TABLE: &str = "blob_chunks";

/// Outgoing document links, keyed by `<escaped source key>/<target key>`.
pub const LINKS_TABLE: &str = "links";

/// Incoming document links, keyed by `<escaped target key>/<source key>`.
pub const BACKLINKS_TABLE: &str = "backlinks";

/// Edit locks, keyed by the canonical key of the locked document.
pub const LOCKS_TABLE: &str = "locks";

/// Encodes a stored record.
///
/// # Errors
///
/// Returns [`StoreError::Corrupt`] if the value cannot be represented.
pub fn encode_record<T: Serialize>(what: &'static str, value: &T) -> StoreResult<Vec<u8>> {
    rmp_serde::to_vec_named(value).map_err(|e| StoreError::Corrupt {
        what,
        reason: e.to_string(),
    })
}

/// Decodes a stored record.
///
/// # Errors
///
/// Returns [`StoreError::Corrupt`] if the bytes are not a valid `what` record.
pub fn decode_record<T: DeserializeOwned>(what: &'static str, bytes: &[u8]) -> StoreResult<T> {
    rmp_serde::from_slice(bytes).map_err(|e| StoreError::Corrupt {
        what,
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        id: String,
        version: u64,
    }

    #[test]
    fn encoded_records_decode() {
        let sample = Sample {
            id: "a".to_string(),
            version: 7,
        };
        let bytes = encode_record("sample", &sample).unwrap();
        assert_eq!(decode_record::<Sample>("sample", &bytes).unwrap(), sample);
    }

    #[test]
    fn garbage_is_corrupt() {
        let err = decode_record::<Sample>("sample", &[0xc1, 0x00]).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { what: "sample", .. }));
    }
}
