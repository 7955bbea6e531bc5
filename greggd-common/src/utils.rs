use core::str;

pub fn str_from_buf_nul(src: &[u8]) -> Result<&str, str::Utf8Error> {
    let end = src.iter().position(|&c| c == b'\0').unwrap_or(src.len());
    str::from_utf8(&src[0..end])
}

/// Upper-cases the first letter of every word. Underscores and digits do not
/// split words, so `rx_b` becomes `Rx_b`.
pub fn title_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut at_word_start = true;
    for c in name.chars() {
        if at_word_start {
            out.extend(c.to_uppercase());
        } else {
            out.push(c);
        }
        at_word_start = !(c.is_alphanumeric() || c == '_');
    }
    out
}
