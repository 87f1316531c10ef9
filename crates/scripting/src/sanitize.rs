//! Error message cleanup for user-facing output

/// Replace object-identity strings in an engine message
///
/// `some.pkg.Player@1a2b3c4d` becomes `<Player>` and raw addresses such as
/// `0x7ffd5a1b2c3d` become `<address>`.
pub fn sanitize_message(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    let mut rest = message;
    let mut at_boundary = true;

    while let Some(ch) = rest.chars().next() {
        if at_boundary {
            if let Some(len) = address_len(rest) {
                out.push_str("<address>");
                rest = &rest[len..];
                at_boundary = false;
                continue;
            }
            if let Some((class, len)) = identity_at(rest) {
                out.push('<');
                out.push_str(class);
                out.push('>');
                rest = &rest[len..];
                at_boundary = false;
                continue;
            }
        }

        out.push(ch);
        rest = &rest[ch.len_utf8()..];
        at_boundary = !(is_ident(ch) || ch == '.');
    }

    out
}

fn is_ident(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '$'
}

/// `0x` followed by at least six hex digits
fn address_len(text: &str) -> Option<usize> {
    let digits = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X"))?;
    let count = digits.bytes().take_while(|b| b.is_ascii_hexdigit()).count();
    (count >= 6).then_some(2 + count)
}

/// `dotted.Name@hex` with at least four hex digits; returns the last name part
fn identity_at(text: &str) -> Option<(&str, usize)> {
    let name_len = text
        .bytes()
        .take_while(|b| b.is_ascii_alphanumeric() || *b == b'_' || *b == b'$' || *b == b'.')
        .count();
    let name = text[..name_len].trim_end_matches('.');
    if name.is_empty() || !text[name.len()..].starts_with('@') {
        return None;
    }

    let hex = &text[name.len() + 1..];
    let count = hex.bytes().take_while(|b| b.is_ascii_hexdigit()).count();
    if count < 4 {
        return None;
    }

    let class = name.rsplit('.').next().unwrap_or(name);
    Some((class, name.len() + 1 + count))
}

/// First `file:line` location in an engine stack trace
///
/// Any `?query` suffix on the file name is dropped.
pub fn extract_location(stack: &str) -> Option<String> {
    let frame = stack
        .lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix("at "))?;

    let inner = match (frame.find('('), frame.rfind(')')) {
        (Some(open), Some(close)) if close > open => &frame[open + 1..close],
        _ => frame,
    };
    if inner.starts_with('<') {
        return None;
    }

    let (file, line) = split_location(inner)?;
    Some(format!("{}:{}", crate::resolver::strip_query(file), line))
}

/// Split `file:line[:column]`
fn split_location(text: &str) -> Option<(&str, &str)> {
    let mut parts = text.rsplitn(3, ':');
    let last = parts.next()?;
    let middle = parts.next()?;

    let numeric = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    match parts.next() {
        Some(file) if numeric(middle) && numeric(last) => Some((file, middle)),
        _ if numeric(last) => Some((&text[..text.len() - last.len() - 1], last)),
        _ => None,
    }
}

/// Sanitized message with the location appended when known
pub fn describe(message: &str, location: Option<&str>) -> String {
    let message = sanitize_message(message);
    match location {
        Some(location) => format!("{} (at {})", message, location),
        None => message,
    }
}
