/// Truncate `s` to at most `max` bytes, backing off to the nearest UTF-8
/// character boundary, and append an ellipsis when truncation occurred.
pub fn truncate_str(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while end > 0 && !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty() {
        assert_eq!(truncate_str("", 10), "");
    }

    #[test]
    fn within_limit() {
        assert_eq!(truncate_str("hello", 10), "hello");
    }

    #[test]
    fn exact_boundary() {
        assert_eq!(truncate_str("hello", 5), "hello");
    }

    #[test]
    fn ascii_over_limit() {
        assert_eq!(truncate_str("hello world", 5), "hello...");
    }

    #[test]
    fn multibyte_backs_off_to_char_boundary() {
        // "caf\u{e9}" is 5 bytes: c,a,f,(2-byte e-acute). Cutting at byte 4
        // lands mid-character, so it must back off to byte 3.
        let s = "caf\u{e9}";
        assert_eq!(truncate_str(s, 4), "caf...");
    }

    #[test]
    fn zero_max_on_nonempty() {
        assert_eq!(truncate_str("x", 0), "...");
    }
}
