use ibu_core::errors::UnfoldError;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::serde::to_canonical_json_bytes;

/// Computes a stable hexadecimal hash for the provided serialisable payload.
pub fn stable_hash_string<T: Serialize>(value: &T) -> Result<String, UnfoldError> {
    let bytes = to_canonical_json_bytes(value)?;
    let digest = Sha256::digest(bytes);
    Ok(format!("{:x}", digest))
}

/// Rounds a value to the precision used when digesting floating point payloads.
pub fn round_f64(value: f64) -> f64 {
    let scaled = (value * 1e9).round();
    scaled / 1e9
}

/// Rounds every entry of a slice with [`round_f64`].
pub fn round_all(values: &[f64]) -> Vec<f64> {
    values.iter().copied().map(round_f64).collect()
}
