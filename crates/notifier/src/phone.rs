//! Best-effort phone number normalization to the `254XXXXXXXXX` format.

/// Normalize a phone number for the SMS gateway.
///
/// Strips every non-digit, then:
/// - `2547...` passes through
/// - `07...` has its leading `0` replaced by `254`
/// - `7...` gets `254` prepended
///
/// Anything else is returned digits-only. This does not validate.
pub fn normalize_phone_number(raw: &str) -> String {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();

    if digits.starts_with("2547") {
        return digits;
    }
    if let Some(rest) = digits.strip_prefix('0')
        && rest.starts_with('7')
    {
        return format!("254{}", rest);
    }
    if digits.starts_with('7') {
        return format!("254{}", digits);
    }
    digits
}
