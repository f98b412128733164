//! Shell-style command line tokenizer
//!
//! Tokens are `'...'`, `"..."` or runs of non-whitespace, scanned left to
//! right. Quoted tokens lose their surrounding quotes; every token then has
//! its backslash escapes resolved. A quote with no closing partner on the
//! same line is treated as an ordinary character, so unbalanced input still
//! splits deterministically.

/// Split a command line into an argument vector
pub fn split_command_line(command: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut rest = command;

    loop {
        rest = rest.trim_start();
        let first = match rest.chars().next() {
            Some(c) => c,
            None => break,
        };

        let len = if first == '\'' || first == '"' {
            quoted_len(rest, first).unwrap_or_else(|| bare_len(rest))
        } else {
            bare_len(rest)
        };

        args.push(compress(strip_quotes(&rest[..len])));
        rest = &rest[len..];
    }

    args
}

/// Quote an argument so that [`split_command_line`] returns it unchanged
///
/// Returns None when the argument has to be quoted but contains both quote
/// characters, which the tokenizer cannot represent.
pub fn quote_arg(arg: &str) -> Option<String> {
    let escaped = escape(arg);
    let needs_quotes = arg.is_empty()
        || arg.contains(char::is_whitespace)
        || arg.starts_with('\'')
        || arg.starts_with('"');

    if !needs_quotes {
        return Some(escaped);
    }
    if !arg.contains('\'') {
        Some(format!("'{}'", escaped))
    } else if !arg.contains('"') {
        Some(format!("\"{}\"", escaped))
    } else {
        None
    }
}

/// Length of a quoted token starting at `s[0] == quote`, if it closes
fn quoted_len(s: &str, quote: char) -> Option<usize> {
    let body = &s[quote.len_utf8()..];
    let end = body.find(|c| c == quote || c == '\n')?;
    if body[end..].starts_with(quote) {
        Some(quote.len_utf8() * 2 + end)
    } else {
        None
    }
}

fn bare_len(s: &str) -> usize {
    s.find(char::is_whitespace).unwrap_or(s.len())
}

fn strip_quotes(token: &str) -> &str {
    let bytes = token.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'\'' || first == b'"') && first == last {
            return &token[1..token.len() - 1];
        }
    }
    token
}

/// Resolve backslash escapes (`\n`, `\t`, octal `\NNN`, `\\`, `\"`, ...)
fn compress(token: &str) -> String {
    let mut out = String::with_capacity(token.len());
    let mut chars = token.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('b') => out.push('\u{8}'),
            Some('f') => out.push('\u{c}'),
            Some('v') => out.push('\u{b}'),
            Some(d @ '0'..='7') => {
                let mut value = d as u32 - '0' as u32;
                for _ in 0..2 {
                    match chars.peek() {
                        Some(&o @ '0'..='7') => {
                            value = value * 8 + (o as u32 - '0' as u32);
                            chars.next();
                        }
                        _ => break,
                    }
                }
                out.push(char::from_u32(value & 0xff).unwrap_or('?'));
            }
            Some(other) => out.push(other),
            // Trailing backslash stays literal
            None => out.push('\\'),
        }
    }

    out
}

fn escape(arg: &str) -> String {
    let mut out = String::with_capacity(arg.len());
    for c in arg.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quoted_tokens() {
        let args = split_command_line(r#"./app --flag "value with spaces" 'single quoted'"#);
        assert_eq!(args, vec!["./app", "--flag", "value with spaces", "single quoted"]);
    }

    #[test]
    fn test_three_tokens() {
        let args = split_command_line(r#"./app --flag "value with spaces""#);
        assert_eq!(args.len(), 3);
        assert_eq!(args[2], "value with spaces");
    }

    #[test]
    fn test_whitespace_only() {
        assert!(split_command_line("").is_empty());
        assert!(split_command_line("  \t \n").is_empty());
    }

    #[test]
    fn test_escapes_resolved() {
        let args = split_command_line(r#"printf 'a\tb' back\\slash \"x\""#);
        assert_eq!(args, vec!["printf", "a\tb", "back\\slash", "\"x\""]);
    }

    #[test]
    fn test_octal_escape() {
        assert_eq!(split_command_line(r"\101\102"), vec!["AB"]);
    }

    #[test]
    fn test_empty_quoted_token_kept() {
        assert_eq!(split_command_line("login '' x"), vec!["login", "", "x"]);
    }

    #[test]
    fn test_unmatched_quote_is_deterministic() {
        let first = split_command_line(r#"echo "unterminated value"#);
        let second = split_command_line(r#"echo "unterminated value"#);
        assert_eq!(first, second);
        assert_eq!(first, vec!["echo", "\"unterminated", "value"]);
    }

    #[test]
    fn test_quote_inside_bare_token() {
        // Quotes only group at the start of a token
        assert_eq!(split_command_line(r#"--opt="a b""#), vec!["--opt=\"a", "b\""]);
    }

    #[test]
    fn test_quote_arg_recovers_value() {
        let values = ["plain", "with space", "it's", "'leading", r#"say "hi""#, "back\\slash", "", "tab\there"];
        let line = values
            .iter()
            .map(|v| quote_arg(v).unwrap())
            .collect::<Vec<_>>()
            .join(" ");
        assert_eq!(split_command_line(&line), values);
    }

    #[test]
    fn test_quote_arg_rejects_both_quotes() {
        assert!(quote_arg(r#"a 'b' "c""#).is_none());
    }
}
