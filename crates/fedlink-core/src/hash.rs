use crate::types::ObjectId;

/// Computes BLAKE3 and returns the first-class 32-byte digest value.
pub fn blake3_32(input: &[u8]) -> [u8; 32] {
    *blake3::hash(input).as_bytes()
}

/// Content address of an encoded object: `H(object_bytes)`.
pub fn object_id_of(object_bytes: &[u8]) -> ObjectId {
    ObjectId(blake3_32(object_bytes))
}
