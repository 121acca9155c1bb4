//! Parser for flat `name value` directive files, as used by redis.conf.
//!
//! Comments, blank lines, and directive order are preserved across a
//! parse/serialize roundtrip, so editing one directive does not disturb
//! the rest of a hand-maintained file.

use nom::{
    branch::alt,
    bytes::complete::{take_while, take_while1},
    character::complete::{char, line_ending, space0, space1},
    combinator::opt,
    multi::many0,
    IResult,
};
use std::collections::BTreeMap;

/// A parsed directive file preserving comments and ordering.
#[derive(Debug, Clone)]
pub struct DirectiveFile {
    pub entries: Vec<DirectiveLine>,
}

#[derive(Debug, Clone)]
pub enum DirectiveLine {
    /// A `name value` directive. The value is the rest of the line, so
    /// multi-argument directives (`save 900 1`) stay intact.
    Directive { name: String, value: String },
    /// A comment line (including the # prefix).
    Comment(String),
    /// An empty/blank line.
    Blank,
}

impl DirectiveFile {
    /// First value for a directive name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.iter().find_map(|line| match line {
            DirectiveLine::Directive { name: n, value } if n == name => Some(value.as_str()),
            _ => None,
        })
    }

    /// All values for a directive name, in file order.
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter_map(|line| match line {
                DirectiveLine::Directive { name: n, value } if n == name => Some(value.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Set a directive, replacing the first occurrence or appending if
    /// absent.
    pub fn set(&mut self, name: &str, new_value: &str) {
        for line in &mut self.entries {
            if let DirectiveLine::Directive { name: n, value } = line {
                if n == name {
                    *value = new_value.to_string();
                    return;
                }
            }
        }
        self.entries.push(DirectiveLine::Directive {
            name: name.to_string(),
            value: new_value.to_string(),
        });
    }

    /// Remove every occurrence of a directive.
    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|line| {
            !matches!(line, DirectiveLine::Directive { name: n, .. } if n == name)
        });
    }

    pub fn serialize(&self) -> String {
        let mut output = String::new();
        for line in &self.entries {
            match line {
                DirectiveLine::Directive { name, value } => {
                    if value.is_empty() {
                        output.push_str(name);
                    } else {
                        output.push_str(&format!("{} {}", name, value));
                    }
                    output.push('\n');
                }
                DirectiveLine::Comment(c) => {
                    output.push_str(c);
                    output.push('\n');
                }
                DirectiveLine::Blank => output.push('\n'),
            }
        }
        output
    }

    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        for line in &self.entries {
            if let DirectiveLine::Directive { name, value } = line {
                map.entry(name.clone()).or_insert_with(|| value.clone());
            }
        }
        map
    }
}

// nom parsers

fn is_not_newline(c: char) -> bool {
    c != '\n' && c != '\r'
}

fn comment_line(input: &str) -> IResult<&str, DirectiveLine> {
    let (input, _) = space0(input)?;
    let (input, _) = char('#')(input)?;
    let (input, rest) = take_while(is_not_newline)(input)?;
    let (input, _) = opt(line_ending)(input)?;
    Ok((input, DirectiveLine::Comment(format!("#{}", rest))))
}

fn blank_line(input: &str) -> IResult<&str, DirectiveLine> {
    let (input, _) = space0(input)?;
    let (input, _) = line_ending(input)?;
    Ok((input, DirectiveLine::Blank))
}

fn directive_name(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_alphanumeric() || c == '_' || c == '-' || c == '.')(input)
}

fn directive_line(input: &str) -> IResult<&str, DirectiveLine> {
    let (input, _) = space0(input)?;
    let (input, name) = directive_name(input)?;
    let (input, spaced) = opt(space1)(input)?;
    let (input, value) = if spaced.is_some() {
        take_while(is_not_newline)(input)?
    } else {
        (input, "")
    };
    let (input, _) = opt(line_ending)(input)?;
    Ok((
        input,
        DirectiveLine::Directive {
            name: name.to_string(),
            value: value.trim_end().to_string(),
        },
    ))
}

fn any_line(input: &str) -> IResult<&str, DirectiveLine> {
    alt((comment_line, blank_line, directive_line))(input)
}

pub fn parse_directives(input: &str) -> Result<DirectiveFile, String> {
    let (remaining, entries) =
        many0(any_line)(input).map_err(|e| format!("Parse error: {}", e))?;

    if !remaining.trim().is_empty() {
        return Err(format!(
            "Unparsed content remaining: {:?}",
            &remaining[..remaining.len().min(100)]
        ));
    }

    Ok(DirectiveFile { entries })
}

#[cfg(test)]
mod tests {
    use super::*;

    const REDIS_CONF: &str = "\
# Redis configuration
bind 127.0.0.1
port 6379

maxmemory 2g
maxmemory-policy allkeys-lru
timeout 300
tcp-keepalive 60
save 900 1
save 300 10
";

    #[test]
    fn test_parse_redis_conf() {
        let conf = parse_directives(REDIS_CONF).unwrap();
        assert_eq!(conf.get("bind"), Some("127.0.0.1"));
        assert_eq!(conf.get("port"), Some("6379"));
        assert_eq!(conf.get("maxmemory"), Some("2g"));
        assert_eq!(conf.get("maxmemory-policy"), Some("allkeys-lru"));
        assert_eq!(conf.get("nonexistent"), None);
    }

    #[test]
    fn test_multi_argument_value() {
        let conf = parse_directives(REDIS_CONF).unwrap();
        assert_eq!(conf.get_all("save"), vec!["900 1", "300 10"]);
    }

    #[test]
    fn test_roundtrip_preserves_layout() {
        let conf = parse_directives(REDIS_CONF).unwrap();
        assert_eq!(conf.serialize(), REDIS_CONF);
    }

    #[test]
    fn test_set_existing() {
        let mut conf = parse_directives(REDIS_CONF).unwrap();
        conf.set("maxmemory", "4g");
        assert_eq!(conf.get("maxmemory"), Some("4g"));
        // Position preserved: maxmemory still before maxmemory-policy.
        let out = conf.serialize();
        let mm = out.find("maxmemory 4g").unwrap();
        let policy = out.find("maxmemory-policy").unwrap();
        assert!(mm < policy);
    }

    #[test]
    fn test_set_appends_when_absent() {
        let mut conf = parse_directives("port 6379\n").unwrap();
        conf.set("requirepass", "changeme");
        assert_eq!(conf.get("requirepass"), Some("changeme"));
        assert!(conf.serialize().ends_with("requirepass changeme\n"));
    }

    #[test]
    fn test_remove() {
        let mut conf = parse_directives(REDIS_CONF).unwrap();
        conf.remove("save");
        assert!(conf.get_all("save").is_empty());
        assert_eq!(conf.get("port"), Some("6379"));
    }

    #[test]
    fn test_bare_directive() {
        let conf = parse_directives("daemonize yes\nmulti-threaded\n").unwrap();
        assert_eq!(conf.get("multi-threaded"), Some(""));
        assert_eq!(conf.serialize(), "daemonize yes\nmulti-threaded\n");
    }

    #[test]
    fn test_comments_preserved() {
        let input = "# top comment\nport 6379\n# trailing comment\n";
        let conf = parse_directives(input).unwrap();
        assert_eq!(conf.serialize(), input);
    }

    #[test]
    fn test_empty_input() {
        let conf = parse_directives("").unwrap();
        assert!(conf.entries.is_empty());
    }

    #[test]
    fn test_to_map_takes_first_occurrence() {
        let conf = parse_directives("save 900 1\nsave 300 10\n").unwrap();
        let map = conf.to_map();
        assert_eq!(map.get("save").map(String::as_str), Some("900 1"));
    }
}
