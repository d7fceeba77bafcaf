//! Session/file identifiers and the short human-shareable retrieval code.

use rand::Rng;
use uuid::Uuid;

const CODE_LEN: usize = 6;
const CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

pub fn new_session_id() -> Uuid {
    Uuid::new_v4()
}

pub fn new_file_id() -> Uuid {
    Uuid::new_v4()
}

/// Draw a new 6-character retrieval code, `A-Z0-9`, using a cryptographic RNG.
pub fn generate_retrieval_code() -> String {
    let mut rng = rand::thread_rng();
    (0..CODE_LEN)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

pub fn is_valid_retrieval_code(code: &str) -> bool {
    code.len() == CODE_LEN
        && code
            .bytes()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
}
