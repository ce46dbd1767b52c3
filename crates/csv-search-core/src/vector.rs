//! Binary vector codec and similarity metric.
//!
//! Vectors are stored as raw little-endian `f32` bytes with no length
//! header; the element count is recovered from the byte length.

use crate::error::{Error, Result};

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// # Example
///
/// ```rust
/// use csv_search_core::vector::{decode_vector, encode_vector};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = encode_vector(&v);
/// assert_eq!(blob.len(), 12);
/// assert_eq!(decode_vector(&blob).unwrap(), v);
/// ```
pub fn encode_vector(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB produced by [`encode_vector`].
///
/// Fails with [`Error::Format`] when the length is not a multiple of 4.
pub fn decode_vector(blob: &[u8]) -> Result<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return Err(Error::Format(format!(
            "invalid vector blob length {}",
            blob.len()
        )));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

/// Cosine similarity in `[-1.0, 1.0]`, accumulated in `f64`.
///
/// Returns `0.0` when either vector is empty, the lengths differ, or
/// either vector has zero magnitude.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;

    for (&x, &y) in a.iter().zip(b.iter()) {
        let (x, y) = (f64::from(x), f64::from(y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a.sqrt() * norm_b.sqrt())
}
