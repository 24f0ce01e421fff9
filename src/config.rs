//! Configuration types for idu
//!
//! The configuration is a YAML file listing the filesystem prefixes to
//! analyze. Each prefix names its own database and carries its own
//! concurrency knobs, exclusion patterns, and disk layout. Paths are
//! routed to the entry with the longest matching prefix.

use crate::diskusage::{self, Calculator};
use crate::error::{Error, Result};
use regex::Regex;
use serde::Deserialize;
use std::path::MAIN_SEPARATOR;
use std::sync::Arc;

/// Default scan batch size when `scan_size` is unset.
pub const DEFAULT_SCAN_SIZE: usize = 1000;

/// One configured filesystem prefix.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PrefixEntry {
    /// The prefix to be analyzed. Environment variables are expanded once
    /// at load.
    pub prefix: String,

    /// Location of the database used for this prefix.
    pub database: String,

    /// Filename separator, defaults to the platform separator.
    #[serde(default = "default_separator")]
    pub separator: String,

    /// Maximum number of concurrent directory scans. Zero selects the
    /// engine default.
    #[serde(default)]
    pub concurrent_scans: usize,

    /// Maximum number of concurrent stat operations. Zero selects the
    /// engine default.
    #[serde(default)]
    pub concurrent_stats: usize,

    /// Minimum number of changed entries before stats run concurrently.
    #[serde(default)]
    pub concurrent_stats_threshold: usize,

    /// Accepted for compatibility; the runtime has no thread ceiling knob.
    #[serde(default)]
    pub set_max_threads: usize,

    /// Maximum number of entries fetched from the filesystem per listing
    /// call.
    #[serde(default)]
    pub scan_size: usize,

    /// Paths matching any of these regular expressions are ignored.
    #[serde(default)]
    pub exclusions: Vec<String>,

    /// When true, every hardlink counts as a separate file; when false a
    /// previously seen inode counts once with size zero.
    #[serde(default)]
    pub count_hardlinks_as_files: bool,

    /// Disk layout used to convert logical bytes to raw bytes.
    #[serde(default)]
    pub layout: Layout,

    #[serde(skip)]
    regexps: Vec<Regex>,

    #[serde(skip)]
    calculator: Option<Arc<dyn Calculator>>,
}

fn default_separator() -> String {
    MAIN_SEPARATOR.to_string()
}

/// Disk layout selection: a calculator name plus its parameters.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Layout {
    #[serde(default)]
    pub calculator: String,

    #[serde(default)]
    pub parameters: serde_yaml::Value,
}

impl PrefixEntry {
    /// Whether `path` should be excluded from the scan.
    pub fn is_excluded(&self, path: &str) -> bool {
        self.regexps.iter().any(|re| re.is_match(path))
    }

    /// The calculator configured for this prefix.
    pub fn calculator(&self) -> Arc<dyn Calculator> {
        self.calculator
            .clone()
            .unwrap_or_else(|| Arc::new(diskusage::Identity))
    }

    /// Effective scan batch size.
    pub fn effective_scan_size(&self) -> usize {
        if self.scan_size == 0 {
            DEFAULT_SCAN_SIZE
        } else {
            self.scan_size
        }
    }

    fn finalize(&mut self) -> Result<()> {
        self.prefix = expand_env(&self.prefix);
        self.database = expand_env(&self.database);
        for pattern in &self.exclusions {
            let re = Regex::new(pattern).map_err(|e| Error::RegexCompile {
                pattern: pattern.clone(),
                reason: e.to_string(),
            })?;
            self.regexps.push(re);
        }
        let calc = diskusage::for_layout(&self.layout.calculator, &self.layout.parameters)?;
        self.calculator = Some(Arc::from(calc));
        Ok(())
    }
}

/// The parsed configuration: an ordered list of prefixes.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub prefixes: Vec<PrefixEntry>,
}

impl Config {
    /// Parse a YAML configuration from a byte buffer.
    pub fn parse(buf: &str) -> Result<Self> {
        let mut cfg: Config = serde_yaml::from_str(buf)?;
        for entry in &mut cfg.prefixes {
            entry.finalize()?;
        }
        let mut seen = std::collections::HashSet::new();
        for entry in &cfg.prefixes {
            if !seen.insert(entry.prefix.as_str()) {
                return Err(Error::BadConfig(format!(
                    "duplicate prefix: {}",
                    entry.prefix
                )));
            }
        }
        Ok(cfg)
    }

    /// Read and parse the configuration file at `path`.
    pub fn read(path: &str) -> Result<Self> {
        let buf = std::fs::read_to_string(path)
            .map_err(|e| Error::BadConfig(format!("failed to read config file {path}: {e}")))?;
        Self::parse(&buf)
    }

    /// The entry whose prefix is the longest string-prefix match for
    /// `path`, if any.
    pub fn for_prefix(&self, path: &str) -> Option<&PrefixEntry> {
        self.prefixes
            .iter()
            .filter(|p| path.starts_with(&p.prefix))
            .max_by_key(|p| p.prefix.len())
    }
}

/// Expand `$VAR` and `${VAR}` references from the process environment.
/// Unset variables expand to the empty string.
fn expand_env(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.char_indices().peekable();
    while let Some((_, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        let braced = matches!(chars.peek(), Some((_, '{')));
        if braced {
            chars.next();
        }
        let mut name = String::new();
        while let Some(&(_, nc)) = chars.peek() {
            if braced && nc == '}' {
                chars.next();
                break;
            }
            if !braced && !(nc.is_ascii_alphanumeric() || nc == '_') {
                break;
            }
            name.push(nc);
            chars.next();
        }
        if name.is_empty() {
            out.push('$');
            if braced {
                out.push_str("{}");
            }
            continue;
        }
        if let Ok(val) = std::env::var(&name) {
            out.push_str(&val);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
prefixes:
  - prefix: /data
    database: /tmp/idu/data.db
    concurrent_scans: 4
    concurrent_stats: 8
    concurrent_stats_threshold: 100
    exclusions:
      - "\\.snapshot"
    layout:
      calculator: block
      parameters:
        size: 4096
  - prefix: /data/archive
    database: /tmp/idu/archive.db
    count_hardlinks_as_files: true
"#;

    #[test]
    fn test_parse() {
        let cfg = Config::parse(SAMPLE).unwrap();
        assert_eq!(cfg.prefixes.len(), 2);

        let p = &cfg.prefixes[0];
        assert_eq!(p.prefix, "/data");
        assert_eq!(p.concurrent_scans, 4);
        assert_eq!(p.concurrent_stats, 8);
        assert_eq!(p.concurrent_stats_threshold, 100);
        assert_eq!(p.separator, MAIN_SEPARATOR.to_string());
        assert_eq!(p.effective_scan_size(), DEFAULT_SCAN_SIZE);
        assert!(!p.count_hardlinks_as_files);
        assert_eq!(p.calculator().raw_bytes(1), 4096);

        let p = &cfg.prefixes[1];
        assert!(p.count_hardlinks_as_files);
        assert_eq!(p.calculator().raw_bytes(1), 1);
    }

    #[test]
    fn test_longest_prefix_routing() {
        let cfg = Config::parse(SAMPLE).unwrap();
        assert_eq!(cfg.for_prefix("/data/x").unwrap().prefix, "/data");
        assert_eq!(
            cfg.for_prefix("/data/archive/x").unwrap().prefix,
            "/data/archive"
        );
        assert!(cfg.for_prefix("/other").is_none());
    }

    #[test]
    fn test_exclusions() {
        let cfg = Config::parse(SAMPLE).unwrap();
        let p = &cfg.prefixes[0];
        assert!(p.is_excluded("/data/.snapshot/hourly.0"));
        assert!(!p.is_excluded("/data/file.txt"));
    }

    #[test]
    fn test_bad_regex() {
        let yaml = r#"
prefixes:
  - prefix: /data
    database: /tmp/db
    exclusions: ["["]
"#;
        assert!(matches!(
            Config::parse(yaml),
            Err(Error::RegexCompile { .. })
        ));
    }

    #[test]
    fn test_bad_calculator() {
        let yaml = r#"
prefixes:
  - prefix: /data
    database: /tmp/db
    layout:
      calculator: zfs
"#;
        assert!(matches!(
            Config::parse(yaml),
            Err(Error::UnsupportedCalculator(_))
        ));
    }

    #[test]
    fn test_duplicate_prefix() {
        let yaml = r#"
prefixes:
  - prefix: /data
    database: /tmp/a
  - prefix: /data
    database: /tmp/b
"#;
        assert!(matches!(Config::parse(yaml), Err(Error::BadConfig(_))));
    }

    #[test]
    fn test_env_expansion() {
        std::env::set_var("IDU_TEST_ROOT", "/mnt/pool");
        let yaml = r#"
prefixes:
  - prefix: $IDU_TEST_ROOT/data
    database: ${IDU_TEST_ROOT}/idu.db
"#;
        let cfg = Config::parse(yaml).unwrap();
        assert_eq!(cfg.prefixes[0].prefix, "/mnt/pool/data");
        assert_eq!(cfg.prefixes[0].database, "/mnt/pool/idu.db");
    }

    #[test]
    fn test_expand_env_literal_dollar() {
        assert_eq!(expand_env("a$"), "a$");
        assert_eq!(expand_env("plain"), "plain");
    }
}
