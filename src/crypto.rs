pub type GraphsyncHash = [u8; 32];

/// blake3 digest of the given bytes. Used for block links and peer ids.
pub fn hash(data: &[u8]) -> GraphsyncHash {
    blake3::hash(data).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        let data = vec![1, 2, 3, 4];
        assert_eq!(hash(&data), hash(&data));
        assert_ne!(hash(&data), hash(&[1, 2, 3]));
    }
}
