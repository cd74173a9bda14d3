//! Command line tokenizer.
//!
//! Arguments split on whitespace. `"..."`, `'...'` and `“...”` group words; inside the
//! first two a backslash escapes the matching quote. An unterminated quote makes the
//! rest of the line split verbatim.

/// Split a prefixed message into `(command, remainder)`. `None` when the prefix is absent.
pub fn split_command<'a>(text: &'a str, prefix: &str) -> Option<(&'a str, &'a str)> {
    let body = text.strip_prefix(prefix)?;
    let (command, rest) = match body.find(' ') {
        Some(idx) => (&body[..idx], &body[idx + 1..]),
        None => (body, ""),
    };
    if command.is_empty() {
        return None;
    }
    Some((command, rest.trim()))
}

fn closing_quote(open: char) -> Option<char> {
    match open {
        '"' => Some('"'),
        '\'' => Some('\''),
        '“' => Some('”'),
        _ => None,
    }
}

/// Read a quoted token starting after the opening quote. Returns the token and the index
/// after the closing quote.
fn read_quoted(chars: &[char], start: usize, close: char, escapes: bool) -> Option<(String, usize)> {
    let mut token = String::new();
    let mut i = start;
    while i < chars.len() {
        let c = chars[i];
        if escapes && c == '\\' && chars.get(i + 1) == Some(&close) {
            token.push(close);
            i += 2;
            continue;
        }
        if c == close {
            return Some((token, i + 1));
        }
        token.push(c);
        i += 1;
    }
    None
}

pub fn parse_args(input: &str) -> Vec<String> {
    let chars: Vec<char> = input.chars().collect();
    let mut args = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        if chars[i].is_whitespace() {
            i += 1;
            continue;
        }
        if let Some(close) = closing_quote(chars[i]) {
            match read_quoted(&chars, i + 1, close, chars[i] != '“') {
                Some((token, next)) => {
                    args.push(token);
                    i = next;
                    continue;
                }
                None => {
                    let rest: String = chars[i..].iter().collect();
                    args.extend(rest.split_whitespace().map(str::to_string));
                    break;
                }
            }
        }
        let start = i;
        while i < chars.len() && !chars[i].is_whitespace() {
            i += 1;
        }
        args.push(chars[start..i].iter().collect());
    }
    args
}
