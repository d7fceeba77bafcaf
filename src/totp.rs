//! RFC 6238 TOTP verification — the pluggable admission gate on `createChest`.
//!
//! Pure functions, no I/O: configured secrets are parsed once at startup and
//! handed in by the caller on every check.

use hmac::{Hmac, Mac};
use sha1::Sha1;

const STEP_SECS: i64 = 30;
const DIGITS: u32 = 6;
const TOLERANCE_STEPS: i64 = 1;

type HmacSha1 = Hmac<Sha1>;

/// A named base32-decoded TOTP secret, as parsed out of `"name:SECRET"`.
#[derive(Debug, Clone)]
pub struct TotpSecret {
    pub name: String,
    key: Vec<u8>,
}

/// Parses the `"name1:SECRET1,name2:SECRET2"` configuration format.
pub fn parse_secrets(raw: &str) -> Vec<TotpSecret> {
    raw.split(',')
        .filter_map(|entry| {
            let entry = entry.trim();
            if entry.is_empty() {
                return None;
            }
            let (name, secret) = entry.split_once(':')?;
            let key = base32::decode(base32::Alphabet::Rfc4648 { padding: false }, secret.trim())?;
            Some(TotpSecret {
                name: name.trim().to_string(),
                key,
            })
        })
        .collect()
}

fn hotp(key: &[u8], counter: u64) -> u32 {
    let mut mac = HmacSha1::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let truncated = ((digest[offset] as u32 & 0x7f) << 24)
        | ((digest[offset + 1] as u32) << 16)
        | ((digest[offset + 2] as u32) << 8)
        | (digest[offset + 3] as u32);

    truncated % 10u32.pow(DIGITS)
}

fn totp_at(key: &[u8], unix_secs: i64, step: i64) -> u32 {
    let counter = (unix_secs / step).max(0) as u64;
    hotp(key, counter)
}

/// Checks `code` against every configured secret, allowing a `±1` step
/// clock-skew tolerance. Returns the name of the matching secret, if any.
pub fn verify<'a>(secrets: &'a [TotpSecret], code: &str, unix_secs: i64) -> Option<&'a str> {
    if code.len() != DIGITS as usize || !code.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let code: u32 = code.parse().ok()?;

    secrets.iter().find_map(|secret| {
        (-TOLERANCE_STEPS..=TOLERANCE_STEPS)
            .any(|delta| totp_at(&secret.key, unix_secs + delta * STEP_SECS, STEP_SECS) == code)
            .then_some(secret.name.as_str())
    })
}
