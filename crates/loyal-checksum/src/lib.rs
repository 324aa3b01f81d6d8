//! loyal-checksum
//!
//! Luhn check-digit validation for order numbers. Pure, no IO.
//!
//! Both order intake and withdrawal intake gate on [`is_valid`]; a number
//! that fails it never reaches storage.

/// `true` if `number` (surrounding whitespace ignored) is a non-empty string
/// of ASCII digits whose Luhn sum is divisible by 10.
pub fn is_valid(number: &str) -> bool {
    let digits = number.trim();
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    luhn_sum(digits.bytes().map(|b| b - b'0'), false) % 10 == 0
}

/// The digit that, appended to `payload`, makes the whole number valid.
///
/// Returns `None` if `payload` is empty or contains a non-digit.
pub fn check_digit(payload: &str) -> Option<u8> {
    let digits = payload.trim();
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    // The payload's rightmost digit sits at index 1 once the check digit is appended.
    let sum = luhn_sum(digits.bytes().map(|b| b - b'0'), true);
    Some(((10 - sum % 10) % 10) as u8)
}

/// Right-to-left Luhn sum. `double_first` doubles the rightmost digit.
fn luhn_sum<I>(digits: I, double_first: bool) -> u32
where
    I: DoubleEndedIterator<Item = u8>,
{
    let mut sum = 0u32;
    let mut double = double_first;
    for d in digits.rev() {
        let mut v = u32::from(d);
        if double {
            v *= 2;
            if v > 9 {
                v -= 9;
            }
        }
        sum += v;
        double = !double;
    }
    sum
}
