//! Phone number normalization shared by inbound buffering and outbound sends.

use std::collections::HashSet;

const MIN_DIGITS: usize = 10;
const MAX_DIGITS: usize = 15;
const BRAZIL_PREFIX: &str = "55";
const BRAZIL_MIN_DIGITS: usize = 12;

/// Strips a WhatsApp JID suffix (`@s.whatsapp.net`, `:device`) and every non-digit.
pub fn digits_only(raw: &str) -> String {
    let user = raw.split('@').next().unwrap_or(raw);
    let user = user.split(':').next().unwrap_or(user);
    user.chars().filter(char::is_ascii_digit).collect()
}

/// Digits-only number with `country_prefix` prepended when missing.
/// Returns `None` when nothing numeric remains.
pub fn normalize_phone(raw: &str, country_prefix: &str) -> Option<String> {
    let digits = digits_only(raw);
    if digits.is_empty() {
        return None;
    }
    if country_prefix.is_empty() || digits.starts_with(country_prefix) {
        return Some(digits);
    }
    Some(format!("{country_prefix}{digits}"))
}

/// Rejects numbers that cannot belong to a real sender: wrong length,
/// degenerate digit patterns, or truncated Brazilian numbers.
pub fn is_plausible_phone(digits: &str) -> bool {
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return false;
    }
    if digits.len() < MIN_DIGITS || digits.len() > MAX_DIGITS {
        return false;
    }
    let unique: HashSet<char> = digits.chars().collect();
    if unique.len() < 3 {
        return false;
    }
    if digits.starts_with(BRAZIL_PREFIX) && digits.len() < BRAZIL_MIN_DIGITS {
        return false;
    }
    true
}

pub fn whatsapp_jid(phone: &str) -> String {
    format!("{phone}@s.whatsapp.net")
}
