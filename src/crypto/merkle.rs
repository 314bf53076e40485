//! Merkle root calculation
//!
//! Used to check that a block rebuilt from a light advertisement plus
//! pulled transactions matches the root declared in its header.

use super::hash::sha256;

/// Calculate the merkle root from a list of transaction hashes
pub fn calculate_merkle_root(hashes: &[Vec<u8>]) -> Vec<u8> {
    if hashes.is_empty() {
        return sha256(b"");
    }

    if hashes.len() == 1 {
        return hashes[0].clone();
    }

    let mut current_level: Vec<Vec<u8>> = hashes.to_vec();

    while current_level.len() > 1 {
        let mut next_level = Vec::with_capacity(current_level.len().div_ceil(2));

        for chunk in current_level.chunks(2) {
            // Odd levels pair the last hash with itself
            let right = chunk.get(1).unwrap_or(&chunk[0]);
            let mut data = chunk[0].clone();
            data.extend_from_slice(right);
            next_level.push(sha256(&data));
        }

        current_level = next_level;
    }

    current_level.remove(0)
}

/// Calculate merkle root from hex-encoded hashes
///
/// Hashes that are not valid hex are skipped.
pub fn calculate_merkle_root_hex(hex_hashes: &[String]) -> String {
    let hashes: Vec<Vec<u8>> = hex_hashes
        .iter()
        .filter_map(|h| hex::decode(h).ok())
        .collect();
    hex::encode(calculate_merkle_root(&hashes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merkle_root_single() {
        let hashes = vec![sha256(b"tx1")];
        let root = calculate_merkle_root(&hashes);
        assert_eq!(root, hashes[0]);
    }

    #[test]
    fn test_merkle_root_two() {
        let hash1 = sha256(b"tx1");
        let hash2 = sha256(b"tx2");
        let root = calculate_merkle_root(&[hash1.clone(), hash2.clone()]);

        let mut expected = hash1;
        expected.extend_from_slice(&hash2);
        assert_eq!(root, sha256(&expected));
    }

    #[test]
    fn test_merkle_root_odd_duplicates_last() {
        let h1 = sha256(b"tx1");
        let h2 = sha256(b"tx2");
        let h3 = sha256(b"tx3");
        let odd = calculate_merkle_root(&[h1.clone(), h2.clone(), h3.clone()]);
        let padded = calculate_merkle_root(&[h1, h2, h3.clone(), h3]);
        assert_eq!(odd, padded);
    }

    #[test]
    fn test_order_matters() {
        let h1 = sha256(b"tx1");
        let h2 = sha256(b"tx2");
        assert_ne!(
            calculate_merkle_root(&[h1.clone(), h2.clone()]),
            calculate_merkle_root(&[h2, h1])
        );
    }

    #[test]
    fn test_empty_merkle_root() {
        let root = calculate_merkle_root(&[]);
        assert_eq!(root, sha256(b""));
    }
}
