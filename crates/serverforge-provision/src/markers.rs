//! Progress marker protocol (v1)
//!
//! The provisioning script reports progress on stdout with two line formats:
//!
//! ```text
//! step-line := "###STEP:" DIGIT+ "###"
//! data-line := "###DATA:" KEY "=" VALUE "###"      (split on the first "=")
//! KEY       := one or more characters other than "="
//! VALUE     := zero or more characters
//! ```
//!
//! Every other line is informational. Parsing is stateless and works on one
//! already-split line at a time.

pub const STEP_MARKER_PREFIX: &str = "###STEP:";
pub const STEP_MARKER_SUFFIX: &str = "###";
pub const DATA_MARKER_PREFIX: &str = "###DATA:";
pub const DATA_MARKER_SUFFIX: &str = "###";

/// Data key carrying the detected OS release
pub const DATA_OS_VERSION: &str = "ubuntu_version";
/// Data key carrying the server's own deploy public key
pub const DATA_LOCAL_PUBLIC_KEY: &str = "local_public_key";

/// A `key=value` fact reported by the script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataMarker {
    pub key: String,
    pub value: String,
}

/// A recognized protocol line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptLine {
    Step(u32),
    Data(DataMarker),
}

impl ScriptLine {
    pub fn parse(line: &str) -> Option<Self> {
        if let Some(code) = parse_step_marker(line) {
            return Some(ScriptLine::Step(code));
        }
        parse_data_marker(line).map(ScriptLine::Data)
    }
}

fn strip_line_ending(line: &str) -> &str {
    line.trim_end_matches(['\n', '\r'])
}

fn interior<'a>(line: &'a str, prefix: &str, suffix: &str) -> Option<&'a str> {
    strip_line_ending(line)
        .strip_prefix(prefix)?
        .strip_suffix(suffix)
}

/// `###STEP:7###` → `Some(7)`
pub fn parse_step_marker(line: &str) -> Option<u32> {
    let digits = interior(line, STEP_MARKER_PREFIX, STEP_MARKER_SUFFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// `###DATA:ubuntu_version=22.04###` → `ubuntu_version` / `22.04`
pub fn parse_data_marker(line: &str) -> Option<DataMarker> {
    let data = interior(line, DATA_MARKER_PREFIX, DATA_MARKER_SUFFIX)?;
    let (key, value) = data.split_once('=')?;
    if key.is_empty() {
        return None;
    }
    Some(DataMarker {
        key: key.to_string(),
        value: value.to_string(),
    })
}

pub fn step_marker(code: u32) -> String {
    format!("{}{}{}", STEP_MARKER_PREFIX, code, STEP_MARKER_SUFFIX)
}

pub fn data_marker(key: &str, value: &str) -> String {
    format!("{}{}={}{}", DATA_MARKER_PREFIX, key, value, DATA_MARKER_SUFFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_step_marker() {
        assert_eq!(parse_step_marker("###STEP:7###"), Some(7));
        assert_eq!(parse_step_marker("###STEP:10###\r\n"), Some(10));
        assert_eq!(parse_step_marker("not a marker"), None);
        assert_eq!(parse_step_marker("###STEP:abc###"), None);
    }

    #[test]
    fn test_step_marker_edge_cases() {
        assert_eq!(parse_step_marker("###STEP:###"), None);
        assert_eq!(parse_step_marker("###STEP:-1###"), None);
        assert_eq!(parse_step_marker("###STEP: 3###"), None);
        assert_eq!(parse_step_marker("###STEP:3## "), None);
        assert_eq!(parse_step_marker("echo ###STEP:3###"), None);
        assert_eq!(parse_step_marker("###STEP:99999999999999999999###"), None);
    }

    #[test]
    fn test_parse_data_marker() {
        assert_eq!(
            parse_data_marker("###DATA:ubuntu_version=22.04###"),
            Some(DataMarker {
                key: "ubuntu_version".into(),
                value: "22.04".into()
            })
        );
    }

    #[test]
    fn test_data_marker_splits_on_first_equals() {
        let marker = parse_data_marker("###DATA:local_public_key=ssh-ed25519 AAAA== forge@web###")
            .unwrap();
        assert_eq!(marker.key, "local_public_key");
        assert_eq!(marker.value, "ssh-ed25519 AAAA== forge@web");
    }

    #[test]
    fn test_data_marker_edge_cases() {
        assert_eq!(parse_data_marker("###DATA:no_equals###"), None);
        assert_eq!(parse_data_marker("###DATA:=value###"), None);
        assert_eq!(
            parse_data_marker("###DATA:empty=###").map(|m| m.value),
            Some(String::new())
        );
        assert_eq!(parse_data_marker("###STEP:3###"), None);
    }

    #[test]
    fn test_script_line_classification() {
        assert_eq!(ScriptLine::parse("###STEP:2###"), Some(ScriptLine::Step(2)));
        assert!(matches!(
            ScriptLine::parse("###DATA:a=b###"),
            Some(ScriptLine::Data(_))
        ));
        assert_eq!(ScriptLine::parse("=== Installing Nginx ==="), None);
    }

    #[test]
    fn test_formatters_match_parsers() {
        assert_eq!(parse_step_marker(&step_marker(4)), Some(4));
        let data = parse_data_marker(&data_marker("k", "v=w")).unwrap();
        assert_eq!((data.key.as_str(), data.value.as_str()), ("k", "v=w"));
    }
}
