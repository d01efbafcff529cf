use rand::{Rng, RngCore};
use sha2::{Digest, Sha256};

/// Hex-encoded random token from the OS-seeded thread RNG.
pub fn random_token_hex(bytes: usize) -> String {
    let mut raw = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut raw);
    hex_encode(&raw)
}

/// Zero-padded random decimal code with `digits` digits.
pub fn random_numeric_code(digits: u32) -> String {
    let upper = 10u64.pow(digits);
    let value = rand::thread_rng().gen_range(0..upper);
    format!("{value:0width$}", width = digits as usize)
}

/// Random code drawn from `alphabet`.
pub fn random_code_from(alphabet: &[u8], len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| alphabet[rng.gen_range(0..alphabet.len())] as char)
        .collect()
}

pub fn sha256_hex(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    hex_encode(&digest)
}

/// Equality check whose running time does not depend on where the inputs differ.
pub fn constant_time_equal(a: &str, b: &str) -> bool {
    let a_bytes = a.as_bytes();
    let b_bytes = b.as_bytes();
    if a_bytes.len() != b_bytes.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a_bytes.iter().zip(b_bytes) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Short, non-reversible identifier for logging a secret value.
pub fn log_fingerprint(value: &str) -> String {
    sha256_hex(value)[..12].to_string()
}

fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(HEX[(byte >> 4) as usize] as char);
        out.push(HEX[(byte & 0x0f) as usize] as char);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_token_has_requested_length() {
        let token = random_token_hex(32);
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(token, random_token_hex(32));
    }

    #[test]
    fn numeric_code_is_zero_padded() {
        for _ in 0..200 {
            let code = random_numeric_code(6);
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn code_uses_only_alphabet() {
        let code = random_code_from(b"AB", 16);
        assert_eq!(code.len(), 16);
        assert!(code.chars().all(|c| c == 'A' || c == 'B'));
    }

    #[test]
    fn constant_time_equal_matches_eq() {
        assert!(constant_time_equal("abc", "abc"));
        assert!(!constant_time_equal("abc", "abd"));
        assert!(!constant_time_equal("abc", "abcd"));
    }

    #[test]
    fn sha256_hex_known_vector() {
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn log_fingerprint_is_short_digest_prefix() {
        assert_eq!(log_fingerprint("abc"), "ba7816bf8f01");
        assert_ne!(log_fingerprint("abc"), log_fingerprint("abd"));
    }
}
