//! Helpers for turning `cryptsetup status` output into data the engine can reason about.

use regex::Regex;
use std::sync::OnceLock;

/// Parsed `cryptsetup status <name>` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StatusSummary {
    pub active: bool,
    pub in_use: bool,
    pub fields: Vec<(String, String)>,
}

impl StatusSummary {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

fn header_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^\s*\S+ is (active|inactive)( and is in use)?").ok())
        .as_ref()
}

/// Parse the header line (`/dev/mapper/x is active and is in use.`) and the
/// indented `key: value` lines that follow it.
pub(crate) fn parse_status(output: &str) -> Option<StatusSummary> {
    let mut lines = output.lines().skip_while(|line| line.trim().is_empty());
    let captures = header_pattern()?.captures(lines.next()?)?;
    let active = captures.get(1).map(|m| m.as_str()) == Some("active");
    let in_use = captures.get(2).is_some();

    let fields = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .filter(|(key, _)| !key.is_empty())
        .collect();

    Some(StatusSummary {
        active,
        in_use,
        fields,
    })
}

/// Split a pass-through argument string into individual arguments.
pub(crate) fn split_extra_args(extra: &str) -> Vec<&str> {
    extra.split_whitespace().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ACTIVE: &str = "/dev/mapper/vault1 is active and is in use.\n  type:    PLAIN\n  cipher:  aes-cbc-essiv:sha256\n  keysize: 256 bits\n  device:  /dev/loop0\n  loop:    /data/v1.img\n";

    #[test]
    fn parse_status_reads_header_and_fields() {
        let summary = parse_status(ACTIVE).unwrap();
        assert!(summary.active);
        assert!(summary.in_use);
        assert_eq!(summary.field("cipher"), Some("aes-cbc-essiv:sha256"));
        assert_eq!(summary.field("loop"), Some("/data/v1.img"));
    }

    #[test]
    fn parse_status_handles_inactive() {
        let summary = parse_status("/dev/mapper/vault1 is inactive.\n").unwrap();
        assert!(!summary.active);
        assert!(!summary.in_use);
        assert!(summary.fields.is_empty());
    }

    #[test]
    fn parse_status_rejects_noise() {
        assert!(parse_status("").is_none());
        assert!(parse_status("Device vault1 not found\n").is_none());
    }

    #[test]
    fn split_extra_args_ignores_extra_whitespace() {
        assert_eq!(split_extra_args("  --offset 0\t--skip 8 "), vec!["--offset", "0", "--skip", "8"]);
        assert!(split_extra_args("").is_empty());
    }
}
