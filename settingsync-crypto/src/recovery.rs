//! Recovery codes.
//!
//! A recovery code is the user-held secret from which the KEK is derived.
//! It is shown once, grouped as `XXXX-XXXX-XXXX-XXXX-XXXX-XXXX`, and is never
//! sent to the relay. Input is compared case-insensitively with separators
//! ignored, so users can type it however they copied it.

use rand::Rng;

/// Symbols used in generated codes. Omits `I`, `O`, `0`, `1`.
const ALPHABET: &[u8; 32] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Number of symbols in a generated code (120 bits of entropy).
pub const RECOVERY_CODE_LEN: usize = 24;

const GROUP_LEN: usize = 4;

/// Generates a new recovery code in its grouped display form.
pub fn generate_recovery_code() -> String {
    let mut rng = rand::rngs::OsRng;
    let raw: String = (0..RECOVERY_CODE_LEN)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();
    format_recovery_code(&raw)
}

/// Canonical form used for key derivation: upper-cased, without hyphens or whitespace.
pub fn normalize_recovery_code(code: &str) -> String {
    code.chars()
        .filter(|c| *c != '-' && !c.is_whitespace())
        .flat_map(char::to_uppercase)
        .collect()
}

/// Display form: the normalized code split into hyphen-joined groups of four.
pub fn format_recovery_code(code: &str) -> String {
    let normalized: Vec<char> = normalize_recovery_code(code).chars().collect();
    normalized
        .chunks(GROUP_LEN)
        .map(|group| group.iter().collect::<String>())
        .collect::<Vec<_>>()
        .join("-")
}
