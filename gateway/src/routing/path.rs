use crate::error::GatewayError;

/// Canonical form of a request path, the one every matcher sees and the one
/// forwarded to the site.
///
/// - percent-encoded unreserved characters are decoded (`%61` → `a`), other
///   escapes are kept with upper-case hex
/// - empty segments (`//`) and `.` are dropped, `..` pops a segment and never
///   climbs above the root
/// - a trailing slash is dropped except on `/`
///
/// Encoded separators (`%2F`, `%5C`), NUL, a literal `\` and malformed escapes
/// are rejected: the site would split such a path differently than the gateway.
pub fn canonical_path(raw: &str) -> Result<String, GatewayError> {
    let decoded = decode_unreserved(raw)?;

    let mut segments: Vec<&str> = Vec::new();
    for segment in decoded.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }

    let mut out = String::with_capacity(decoded.len() + 1);
    if segments.is_empty() {
        out.push('/');
    }
    for s in segments {
        out.push('/');
        out.push_str(s);
    }
    Ok(out)
}

fn decode_unreserved(raw: &str) -> Result<String, GatewayError> {
    let bytes = raw.as_bytes();
    let mut out = String::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let value = match (bytes.get(i + 1), bytes.get(i + 2)) {
                    (Some(&h), Some(&l)) => match (hex(h), hex(l)) {
                        (Some(h), Some(l)) => h << 4 | l,
                        _ => return Err(bad_path(raw, "malformed percent-encoding")),
                    },
                    _ => return Err(bad_path(raw, "truncated percent-encoding")),
                };
                match value {
                    b'/' | b'\\' | 0 => return Err(bad_path(raw, "encoded separator")),
                    v if is_unreserved(v) => out.push(v as char),
                    v => {
                        const HEX: &[u8; 16] = b"0123456789ABCDEF";
                        out.push('%');
                        out.push(HEX[(v >> 4) as usize] as char);
                        out.push(HEX[(v & 0x0f) as usize] as char);
                    }
                }
                i += 3;
            }
            b'\\' => return Err(bad_path(raw, "backslash in path")),
            _ => {
                // Multi-byte UTF-8 sequences are copied whole.
                let ch_len = raw[i..].chars().next().map_or(1, char::len_utf8);
                out.push_str(&raw[i..i + ch_len]);
                i += ch_len;
            }
        }
    }
    Ok(out)
}

fn is_unreserved(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~')
}

fn hex(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn bad_path(raw: &str, why: &str) -> GatewayError {
    GatewayError::BadRequest(format!("{}: {}", why, raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn canon(raw: &str) -> String {
        canonical_path(raw).unwrap()
    }

    #[test]
    fn test_plain_paths_unchanged() {
        assert_eq!(canon("/"), "/");
        assert_eq!(canon("/admin/posts"), "/admin/posts");
        assert_eq!(canon("/api/journal/42"), "/api/journal/42");
    }

    #[test]
    fn test_unreserved_escapes_decoded() {
        assert_eq!(canon("/%61dmin/posts"), "/admin/posts");
        assert_eq!(canon("/api/%6A%6Fu%72nal/1"), "/api/journal/1");
        assert_eq!(canon("/a%7Eb"), "/a~b");
    }

    #[test]
    fn test_other_escapes_kept_upper_case() {
        assert_eq!(canon("/search/a%20b"), "/search/a%20b");
        assert_eq!(canon("/x%3fy"), "/x%3Fy");
        assert_eq!(canon("/caf%c3%a9"), "/caf%C3%A9");
    }

    #[test]
    fn test_empty_and_dot_segments() {
        assert_eq!(canon("//admin/posts"), "/admin/posts");
        assert_eq!(canon("/api//journal/1"), "/api/journal/1");
        assert_eq!(canon("/./admin/./posts"), "/admin/posts");
        assert_eq!(canon("/about/../admin"), "/admin");
        assert_eq!(canon("/%2e%2e/admin"), "/admin");
        assert_eq!(canon("/../../"), "/");
    }

    #[test]
    fn test_trailing_slash_dropped() {
        assert_eq!(canon("/admin/"), "/admin");
        assert_eq!(canon("/security-journal//"), "/security-journal");
    }

    #[test]
    fn test_empty_path_is_root() {
        assert_eq!(canon(""), "/");
    }

    #[test]
    fn test_encoded_separators_rejected() {
        for raw in ["/admin%2Fposts", "/security-journal%2F", "/api/journal%2f1", "/a%5Cb", "/a%00"] {
            match canonical_path(raw) {
                Err(GatewayError::BadRequest(_)) => {}
                other => panic!("{} should be rejected, got {:?}", raw, other),
            }
        }
    }

    #[test]
    fn test_malformed_escapes_rejected() {
        assert!(canonical_path("/a%").is_err());
        assert!(canonical_path("/a%4").is_err());
        assert!(canonical_path("/a%zz").is_err());
        assert!(canonical_path("/a\\b").is_err());
    }
}
