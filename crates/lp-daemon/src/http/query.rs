//! Query-string access for the action dispatchers.
//!
//! The panel API carries its operation selector and a handful of small
//! parameters (`action`, `confirm`, `id`, ...) in the query string, so a
//! tiny decoder is all that is needed here.

/// First value of `name` in the query string, percent-decoded.
pub fn param(query: Option<&str>, name: &str) -> Option<String> {
    let query = query?;
    for pair in query.split('&') {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        if key == name {
            return Some(decode(value));
        }
    }
    None
}

/// Boolean query parameter; `true`, `1`, and `yes` count as set.
pub fn flag(query: Option<&str>, name: &str) -> bool {
    param(query, name).is_some_and(|value| matches!(value.as_str(), "true" | "1" | "yes"))
}

/// Integer query parameter, `None` when absent or malformed.
pub fn int(query: Option<&str>, name: &str) -> Option<i64> {
    param(query, name)?.parse().ok()
}

fn decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => match u8::from_str_radix(&value[i + 1..i + 3], 16) {
                Ok(byte) => {
                    out.push(byte);
                    i += 3;
                }
                Err(_) => {
                    out.push(b'%');
                    i += 1;
                }
            },
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_param_lookup() {
        let query = Some("action=create&domain=example.com&confirm=true");
        assert_eq!(param(query, "action").as_deref(), Some("create"));
        assert_eq!(param(query, "domain").as_deref(), Some("example.com"));
        assert_eq!(param(query, "missing"), None);
        assert_eq!(param(None, "action"), None);
    }

    #[test]
    fn test_decoding() {
        let query = Some("name=my%20db&email=user%40example.com&plus=a+b");
        assert_eq!(param(query, "name").as_deref(), Some("my db"));
        assert_eq!(param(query, "email").as_deref(), Some("user@example.com"));
        assert_eq!(param(query, "plus").as_deref(), Some("a b"));
    }

    #[test]
    fn test_flag_forms() {
        assert!(flag(Some("confirm=true"), "confirm"));
        assert!(flag(Some("confirm=1"), "confirm"));
        assert!(flag(Some("confirm=yes"), "confirm"));
        assert!(!flag(Some("confirm=false"), "confirm"));
        assert!(!flag(Some("confirm="), "confirm"));
        assert!(!flag(Some("other=true"), "confirm"));
    }

    #[test]
    fn test_int_parsing() {
        assert_eq!(int(Some("id=42"), "id"), Some(42));
        assert_eq!(int(Some("id=abc"), "id"), None);
        assert_eq!(int(Some("id="), "id"), None);
    }

    #[test]
    fn test_malformed_percent_sequences() {
        assert_eq!(param(Some("v=%zz"), "v").as_deref(), Some("%zz"));
        assert_eq!(param(Some("v=%4"), "v").as_deref(), Some("%4"));
        assert_eq!(param(Some("v=100%"), "v").as_deref(), Some("100%"));
    }
}
