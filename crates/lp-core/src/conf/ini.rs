//! Line-preserving php.ini editor.
//!
//! Unlike [`super::directive`], this keeps the raw text of every line it
//! does not modify, byte for byte: php.ini files in the field carry
//! vendor comments and spacing that must survive an extension update.
//! Parsing is a per-line classification and never fails; anything
//! unrecognized is carried through verbatim.

use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct IniFile {
    pub lines: Vec<IniLine>,
}

#[derive(Debug, Clone)]
pub enum IniLine {
    /// `[PHP]`, `[opcache]`, ...
    Section { name: String, raw: String },
    /// `key = value` or `extension=imagick`.
    KeyValue {
        key: String,
        value: String,
        raw: String,
    },
    /// `;`- or `#`-prefixed line.
    Comment(String),
    Blank,
    /// Anything else, preserved verbatim.
    Raw(String),
}

impl IniFile {
    pub fn parse(input: &str) -> Self {
        let mut lines = Vec::with_capacity(input.lines().count());
        for raw in input.lines() {
            let trimmed = raw.trim();
            let line = if trimmed.is_empty() {
                IniLine::Blank
            } else if trimmed.starts_with(';') || trimmed.starts_with('#') {
                IniLine::Comment(raw.to_string())
            } else if trimmed.starts_with('[') && trimmed.ends_with(']') && trimmed.len() > 2 {
                IniLine::Section {
                    name: trimmed[1..trimmed.len() - 1].to_string(),
                    raw: raw.to_string(),
                }
            } else if let Some((key, value)) = trimmed.split_once('=') {
                IniLine::KeyValue {
                    key: key.trim().to_string(),
                    value: value.trim().to_string(),
                    raw: raw.to_string(),
                }
            } else {
                IniLine::Raw(raw.to_string())
            };
            lines.push(line);
        }
        Self { lines }
    }

    /// First value for a key, in any section.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.lines.iter().find_map(|line| match line {
            IniLine::KeyValue { key: k, value, .. } if k == key => Some(value.as_str()),
            _ => None,
        })
    }

    /// Set a key, rewriting the first occurrence or appending at the end
    /// of the file.
    pub fn set(&mut self, key: &str, new_value: &str) {
        for line in &mut self.lines {
            if let IniLine::KeyValue { key: k, value, raw } = line {
                if k == key {
                    *value = new_value.to_string();
                    *raw = format!("{} = {}", key, new_value);
                    return;
                }
            }
        }
        self.lines.push(IniLine::KeyValue {
            key: key.to_string(),
            value: new_value.to_string(),
            raw: format!("{} = {}", key, new_value),
        });
    }

    /// Remove every `extension=` and `zend_extension=` line. Returns the
    /// number of lines removed.
    pub fn strip_extension_lines(&mut self) -> usize {
        let before = self.lines.len();
        self.lines.retain(|line| {
            !matches!(
                line,
                IniLine::KeyValue { key, .. } if key == "extension" || key == "zend_extension"
            )
        });
        before - self.lines.len()
    }

    /// Insert raw `extension=`/`zend_extension=` lines directly after the
    /// `[PHP]` section header, or append at the end when no such section
    /// exists.
    pub fn insert_extension_lines(&mut self, raw_lines: &[String]) {
        let parsed: Vec<IniLine> = raw_lines
            .iter()
            .map(|raw| match raw.split_once('=') {
                Some((key, value)) => IniLine::KeyValue {
                    key: key.trim().to_string(),
                    value: value.trim().to_string(),
                    raw: raw.clone(),
                },
                None => IniLine::Raw(raw.clone()),
            })
            .collect();

        let insert_at = self
            .lines
            .iter()
            .position(|line| matches!(line, IniLine::Section { name, .. } if name == "PHP"))
            .map(|pos| pos + 1);

        match insert_at {
            Some(pos) => {
                for (offset, line) in parsed.into_iter().enumerate() {
                    self.lines.insert(pos + offset, line);
                }
            }
            None => self.lines.extend(parsed),
        }
    }

    /// All configured extension names (`extension=` plus
    /// `zend_extension=` values), in file order.
    pub fn extension_values(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|line| match line {
                IniLine::KeyValue { key, value, .. }
                    if key == "extension" || key == "zend_extension" =>
                {
                    Some(value.as_str())
                }
                _ => None,
            })
            .collect()
    }

    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        for line in &self.lines {
            if let IniLine::KeyValue { key, value, .. } = line {
                map.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
        map
    }

    pub fn serialize(&self) -> String {
        let mut output = String::new();
        for line in &self.lines {
            match line {
                IniLine::Section { raw, .. } => output.push_str(raw),
                IniLine::KeyValue { raw, .. } => output.push_str(raw),
                IniLine::Comment(raw) => output.push_str(raw),
                IniLine::Raw(raw) => output.push_str(raw),
                IniLine::Blank => {}
            }
            output.push('\n');
        }
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PHP_INI: &str = "\
[PHP]
; About this file
engine = On
memory_limit = 128M
extension=mysqli
extension=gd
zend_extension=opcache

[Date]
date.timezone = UTC
";

    #[test]
    fn test_parse_and_get() {
        let ini = IniFile::parse(PHP_INI);
        assert_eq!(ini.get("memory_limit"), Some("128M"));
        assert_eq!(ini.get("date.timezone"), Some("UTC"));
        assert_eq!(ini.get("engine"), Some("On"));
        assert_eq!(ini.get("missing"), None);
    }

    #[test]
    fn test_roundtrip_is_byte_identical() {
        let ini = IniFile::parse(PHP_INI);
        assert_eq!(ini.serialize(), PHP_INI);
    }

    #[test]
    fn test_untouched_lines_survive_set() {
        let mut ini = IniFile::parse("[PHP]\nmemory_limit=128M\nupload_max_filesize   = 2M\n");
        ini.set("memory_limit", "256M");
        let out = ini.serialize();
        // Modified line is normalized; the other keeps its odd spacing.
        assert!(out.contains("memory_limit = 256M"));
        assert!(out.contains("upload_max_filesize   = 2M"));
    }

    #[test]
    fn test_set_appends_when_absent() {
        let mut ini = IniFile::parse("[PHP]\n");
        ini.set("max_execution_time", "30");
        assert!(ini.serialize().ends_with("max_execution_time = 30\n"));
    }

    #[test]
    fn test_strip_extension_lines() {
        let mut ini = IniFile::parse(PHP_INI);
        let removed = ini.strip_extension_lines();
        assert_eq!(removed, 3);
        assert!(ini.extension_values().is_empty());
        // Non-extension keys untouched.
        assert_eq!(ini.get("memory_limit"), Some("128M"));
    }

    #[test]
    fn test_insert_after_php_section() {
        let mut ini = IniFile::parse(PHP_INI);
        ini.strip_extension_lines();
        ini.insert_extension_lines(&[
            "extension=curl".to_string(),
            "extension=intl".to_string(),
        ]);

        let out = ini.serialize();
        let section = out.find("[PHP]").unwrap();
        let curl = out.find("extension=curl").unwrap();
        let engine = out.find("engine = On").unwrap();
        // Inserted directly after the [PHP] header, before existing keys.
        assert!(section < curl && curl < engine);
        assert_eq!(ini.extension_values(), vec!["curl", "intl"]);
    }

    #[test]
    fn test_insert_appends_without_php_section() {
        let mut ini = IniFile::parse("memory_limit = 128M\n");
        ini.insert_extension_lines(&["extension=redis".to_string()]);
        assert!(ini.serialize().ends_with("extension=redis\n"));
    }

    #[test]
    fn test_unrecognized_lines_preserved() {
        let odd = "some bare line without equals\n[PHP]\nkey = value\n";
        let ini = IniFile::parse(odd);
        assert_eq!(ini.serialize(), odd);
    }

    #[test]
    fn test_comments_with_both_prefixes() {
        let input = "; semicolon comment\n# hash comment\nkey = 1\n";
        let ini = IniFile::parse(input);
        assert_eq!(ini.serialize(), input);
        assert_eq!(ini.get("key"), Some("1"));
    }
}
