//! Normalization and display safety for untrusted text fields.

use send_notifications_module::truncate_bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthUnit {
    Chars,
    Bytes,
}

/// What happens when a field is longer than its ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overflow {
    Reject,
    /// Run `compress_auto`, then cut at a character boundary if it still does not fit.
    CompressThenTruncate,
    /// Run `compress_auto`, then reject if it still does not fit.
    CompressThenReject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldRule {
    pub max: usize,
    pub unit: LengthUnit,
    pub overflow: Overflow,
}

impl FieldRule {
    pub const fn chars(max: usize) -> Self {
        Self {
            max,
            unit: LengthUnit::Chars,
            overflow: Overflow::Reject,
        }
    }

    pub const fn bytes(max: usize, overflow: Overflow) -> Self {
        Self {
            max,
            unit: LengthUnit::Bytes,
            overflow,
        }
    }

    fn measure(&self, text: &str) -> usize {
        match self.unit {
            LengthUnit::Chars => text.chars().count(),
            LengthUnit::Bytes => text.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FieldError {
    #[error("field is empty")]
    Empty,
    #[error("field is {len} long, over the limit of {max}")]
    TooLong { len: usize, max: usize },
    #[error("field has no displayable content")]
    Unsafe,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Normalized {
    pub text: String,
    /// Characters were dropped or the text was cut to fit.
    pub altered: bool,
}

/// Unifies line endings and trims surrounding newlines and whitespace.
pub fn normalize_lines(raw: &str) -> String {
    let unified = raw.replace("\r\n", "\n").replace('\r', "\n");
    unified.trim_matches('\n').trim().to_string()
}

/// Full field pipeline: line normalization, length rule, display safety.
pub fn normalize(raw: &str, rule: &FieldRule) -> Result<Normalized, FieldError> {
    let mut text = normalize_lines(raw);
    if text.is_empty() {
        return Err(FieldError::Empty);
    }

    let mut truncated = false;
    let len = rule.measure(&text);
    if len > rule.max {
        match rule.overflow {
            Overflow::Reject => return Err(FieldError::TooLong { len, max: rule.max }),
            Overflow::CompressThenReject | Overflow::CompressThenTruncate => {
                let (compressed, fit) = compress_auto(&text, rule.max);
                text = compressed;
                if !fit {
                    if rule.overflow == Overflow::CompressThenReject {
                        return Err(FieldError::TooLong {
                            len: text.len(),
                            max: rule.max,
                        });
                    }
                    text = truncate_bytes(&text, rule.max).to_string();
                    truncated = true;
                }
            }
        }
    }

    let (safe, clean) = display_safe(&text);
    let safe = safe.trim().to_string();
    if safe.is_empty() {
        return Err(FieldError::Unsafe);
    }
    Ok(Normalized {
        text: safe,
        altered: truncated || !clean,
    })
}

/// Drops characters that should not be displayed.
///
/// The flag is `true` when nothing was dropped. Text containing U+FFFD is
/// treated as a failed decode and yields an empty result.
pub fn display_safe(text: &str) -> (String, bool) {
    if text.contains(char::REPLACEMENT_CHARACTER) {
        return (String::new(), false);
    }
    let mut clean = true;
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        if is_displayable(ch) {
            out.push(ch);
        } else {
            clean = false;
        }
    }
    (out, clean)
}

/// `display_safe` for raw bytes; invalid UTF-8 yields an empty result.
pub fn display_safe_bytes(raw: &[u8]) -> (String, bool) {
    match std::str::from_utf8(raw) {
        Ok(text) => display_safe(text),
        Err(_) => (String::new(), false),
    }
}

fn is_displayable(ch: char) -> bool {
    if ch.is_whitespace() {
        return true;
    }
    !(ch.is_control()
        || is_format(ch)
        || is_private_use(ch)
        || is_noncharacter(ch)
        || is_unallocated(ch))
}

fn is_format(ch: char) -> bool {
    matches!(
        ch as u32,
        0x00AD
            | 0x0600..=0x0605
            | 0x061C
            | 0x06DD
            | 0x070F
            | 0x0890..=0x0891
            | 0x08E2
            | 0x180E
            | 0x200B..=0x200F
            | 0x202A..=0x202E
            | 0x2060..=0x2064
            | 0x2066..=0x206F
            | 0xFEFF
            | 0xFFF9..=0xFFFB
            | 0x110BD
            | 0x110CD
            | 0x13430..=0x1343F
            | 0x1BCA0..=0x1BCA3
            | 0x1D173..=0x1D17A
            | 0xE0001
            | 0xE0020..=0xE007F
    )
}

/// Code points outside every allocated block: the empty planes and the
/// gaps of the tag plane.
fn is_unallocated(ch: char) -> bool {
    matches!(
        ch as u32,
        0x2065
            | 0x40000..=0xDFFFF
            | 0xE0000
            | 0xE0002..=0xE001F
            | 0xE0080..=0xE00FF
            | 0xE01F0..=0xEFFFF
    )
}

fn is_private_use(ch: char) -> bool {
    matches!(ch as u32, 0xE000..=0xF8FF | 0xF0000..=0xFFFFD | 0x100000..=0x10FFFD)
}

fn is_noncharacter(ch: char) -> bool {
    let code = ch as u32;
    (0xFDD0..=0xFDEF).contains(&code) || (code & 0xFFFE) == 0xFFFE
}

pub fn is_blank(text: &str) -> bool {
    text.chars().all(char::is_whitespace)
}

/// Collapses runs of characters matching `class` into one.
///
/// With `replacement` set, the surviving character is replaced by it.
fn collapse(input: &str, class: impl Fn(char) -> bool, replacement: Option<char>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_run = false;
    for ch in input.chars() {
        if class(ch) {
            if !in_run {
                out.push(replacement.unwrap_or(ch));
                in_run = true;
            }
        } else {
            out.push(ch);
            in_run = false;
        }
    }
    out
}

type Stage = fn(&str) -> String;

const COMPRESS_STAGES: [Stage; 10] = [
    |text| collapse(text, |ch| ch == ' ', None),
    |text| collapse(text, |ch| matches!(ch, '\n' | '\r'), Some('\n')),
    |text| collapse(text, |ch| ch == '\t', None),
    |text| collapse(text, |ch| ch == '\u{000C}', None),
    |text| collapse(text, |ch| ch == '\u{000B}', None),
    |text| collapse(text, |ch| ch == '\u{00A0}', None),
    |text| collapse(text, |ch| ch == '\u{0085}', None),
    |text| collapse(text, |ch| matches!(ch, ' ' | '\u{00A0}' | '\t'), Some(' ')),
    |text| {
        collapse(
            text,
            |ch| matches!(ch, '\n' | '\r' | '\u{0085}' | '\u{000C}' | '\u{000B}'),
            Some('\n'),
        )
    },
    |text| collapse(text, char::is_whitespace, Some(' ')),
];

/// Applies increasingly lossy whitespace collapsing until `text` fits in
/// `target` bytes. Returns the last result and whether it fits.
pub fn compress_auto(text: &str, target: usize) -> (String, bool) {
    if text.len() <= target {
        return (text.to_string(), true);
    }
    let mut current = text.to_string();
    for stage in COMPRESS_STAGES {
        current = stage(&current);
        if current.len() <= target {
            return (current, true);
        }
    }
    (current, false)
}

#[cfg(test)]
mod tests {
    use super::*;

    const NAME: FieldRule = FieldRule::chars(30);

    #[test]
    fn normalize_trims_and_unifies_line_endings() {
        let out = normalize("\r\n\r\n  hello\r\nworld \r\n", &FieldRule::chars(100)).expect("ok");
        assert_eq!(out.text, "hello\nworld");
        assert!(!out.altered);
    }

    #[test]
    fn normalize_rejects_empty_and_long() {
        assert_eq!(normalize(" \r\n ", &NAME), Err(FieldError::Empty));
        let long = "名".repeat(31);
        assert_eq!(
            normalize(&long, &NAME),
            Err(FieldError::TooLong { len: 31, max: 30 })
        );
        assert!(normalize(&"名".repeat(30), &NAME).is_ok());
    }

    #[test]
    fn normalize_drops_controls_and_flags_alteration() {
        let out = normalize("he\u{0007}llo\u{200B}", &NAME).expect("ok");
        assert_eq!(out.text, "hello");
        assert!(out.altered);
    }

    #[test]
    fn normalize_of_only_unsafe_characters_fails() {
        assert_eq!(normalize("\u{0001}\u{0002}", &NAME), Err(FieldError::Unsafe));
        assert_eq!(normalize("\u{FFFD}abc", &NAME), Err(FieldError::Unsafe));
    }

    #[test]
    fn normalize_is_idempotent() {
        let rule = FieldRule::bytes(20, Overflow::CompressThenTruncate);
        let inputs = [
            "  a\u{0003} b\r\n\r\nc  ",
            "\u{0007}  leading",
            "x      y      z      w      v",
            "你好\u{E000}世界\n\n\n",
            "tab\t\t\tand\u{00A0}\u{00A0}nbsp and a lot more text",
        ];
        for input in inputs {
            let once = normalize(input, &rule).expect("first pass");
            let twice = normalize(&once.text, &rule).expect("second pass");
            assert_eq!(once.text, twice.text, "input {:?}", input);
            assert!(!twice.altered);
        }
    }

    #[test]
    fn compress_then_truncate_cuts_on_char_boundary() {
        let rule = FieldRule::bytes(10, Overflow::CompressThenTruncate);
        let out = normalize("你好世界你好", &rule).expect("ok");
        assert_eq!(out.text, "你好世");
        assert!(out.altered);

        let reject = FieldRule::bytes(10, Overflow::CompressThenReject);
        assert!(matches!(
            normalize("你好世界你好", &reject),
            Err(FieldError::TooLong { .. })
        ));
    }

    #[test]
    fn display_safe_keeps_marks_symbols_and_cjk() {
        let text = "e\u{0301} ☃ 你好！\n\t€";
        assert_eq!(display_safe(text), (text.to_string(), true));
    }

    #[test]
    fn display_safe_drops_format_and_unallocated_code_points() {
        let text = "a\u{0890}b\u{08E2}c\u{13439}\u{1343F}d\u{110CD}\u{2065}\u{50000}\u{E0002}e😀";
        assert_eq!(display_safe(text), ("abcde😀".to_string(), false));
        assert_eq!(display_safe("\u{E0100}"), ("\u{E0100}".to_string(), true));
    }

    #[test]
    fn display_safe_bytes_fails_closed() {
        assert_eq!(display_safe_bytes(&[0x66, 0xff, 0x66]), (String::new(), false));
        assert_eq!(display_safe_bytes("ok".as_bytes()), ("ok".to_string(), true));
    }

    #[test]
    fn compress_auto_returns_fitting_input_unchanged() {
        assert_eq!(compress_auto("a  b", 10), ("a  b".to_string(), true));
    }

    #[test]
    fn compress_auto_stops_at_first_fitting_stage() {
        let text = "a    b\n\n\nc";
        let (out, fit) = compress_auto(text, 8);
        assert!(fit);
        assert_eq!(out, "a b\n\n\nc");
    }

    #[test]
    fn compress_auto_groups_mixed_whitespace() {
        let text = "a \t\u{00A0} b\r\n\u{000B}\u{000C}c";
        let (out, fit) = compress_auto(text, 7);
        assert!(fit);
        assert_eq!(out, "a b\n\u{000B}\u{000C}c");

        let (out, fit) = compress_auto(text, 5);
        assert!(fit);
        assert_eq!(out, "a b\nc");
    }

    #[test]
    fn compress_auto_stages_never_expand() {
        let text = "a \u{3000}\u{3000} b \u{2028}\n c\u{0085}\u{0085}d";
        let mut current = text.to_string();
        for stage in COMPRESS_STAGES {
            let next = stage(&current);
            assert!(next.len() <= current.len());
            current = next;
        }
        let (out, fit) = compress_auto(text, 1);
        assert!(!fit);
        assert_eq!(out, current);
        assert_eq!(out, "a b c d");
    }

    #[test]
    fn compress_auto_leaves_other_characters_alone() {
        let (out, _) = compress_auto("x\u{3000}\u{3000}y  z", 6);
        assert!(out.starts_with('x'));
        assert!(out.contains('y'));
        assert!(out.ends_with('z'));
    }
}
