//! Load configuration: which read strategy a path is opened with.
//!
//! Rules are checked in order; the first pattern matching the virtual path
//! decides the open type, otherwise `default_open_type` applies.

use std::fmt;
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Read strategy for a file reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenType {
    /// Whole file loaded into memory and cached.
    InMem,
    /// Memory-mapped (disk tier only).
    Mmap,
    /// Fixed-size block cache.
    Cache,
    /// Ranged reads straight from storage.
    Buffered,
    /// Follow the load configuration.
    Auto,
}

impl fmt::Display for OpenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OpenType::InMem => "in_mem",
            OpenType::Mmap => "mmap",
            OpenType::Cache => "cache",
            OpenType::Buffered => "buffered",
            OpenType::Auto => "auto",
        };
        f.write_str(s)
    }
}

impl FromStr for OpenType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "in_mem" | "inmem" | "mem" => Ok(OpenType::InMem),
            "mmap" => Ok(OpenType::Mmap),
            "cache" => Ok(OpenType::Cache),
            "buffered" => Ok(OpenType::Buffered),
            "auto" => Ok(OpenType::Auto),
            other => Err(ConfigError::UnknownOpenType(other.to_string())),
        }
    }
}

/// A single `pattern -> open type` rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadRule {
    /// Regular expression matched against the absolute virtual path
    pub pattern: String,
    pub open_type: OpenType,
    #[serde(skip)]
    compiled: Option<Regex>,
}

impl LoadRule {
    pub fn new(pattern: impl Into<String>, open_type: OpenType) -> Self {
        Self {
            pattern: pattern.into(),
            open_type,
            compiled: None,
        }
    }

    fn compile(&mut self) -> Result<(), ConfigError> {
        let regex = Regex::new(&self.pattern).map_err(|source| ConfigError::Pattern {
            pattern: self.pattern.clone(),
            source,
        })?;
        self.compiled = Some(regex);
        Ok(())
    }

    fn matches(&self, path: &str) -> bool {
        match &self.compiled {
            Some(regex) => regex.is_match(path),
            // Uncompiled rules come from hand-built configs; invalid ones never match.
            None => Regex::new(&self.pattern)
                .map(|r| r.is_match(path))
                .unwrap_or(false),
        }
    }
}

/// Load configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    pub default_open_type: OpenType,
    pub rules: Vec<LoadRule>,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            default_open_type: OpenType::Mmap,
            rules: Vec::new(),
        }
    }
}

impl LoadConfig {
    /// Compile every rule pattern, reporting the first invalid one.
    pub fn compile(&mut self) -> Result<(), ConfigError> {
        for rule in &mut self.rules {
            rule.compile()?;
        }
        Ok(())
    }

    /// Resolve the open type for `path`.
    ///
    /// Never returns [`OpenType::Auto`]: an `auto` rule or default falls
    /// back to in-memory loading.
    pub fn resolve(&self, path: &str) -> OpenType {
        let resolved = self
            .rules
            .iter()
            .find(|rule| rule.matches(path))
            .map(|rule| rule.open_type)
            .unwrap_or(self.default_open_type);
        match resolved {
            OpenType::Auto => OpenType::InMem,
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_type_parse() {
        assert_eq!("mmap".parse::<OpenType>().unwrap(), OpenType::Mmap);
        assert_eq!("IN_MEM".parse::<OpenType>().unwrap(), OpenType::InMem);
        assert_eq!("buffered".parse::<OpenType>().unwrap(), OpenType::Buffered);
        assert!("floppy".parse::<OpenType>().is_err());
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let mut config = LoadConfig {
            default_open_type: OpenType::Mmap,
            rules: vec![
                LoadRule::new(r".*/attribute/.*", OpenType::Cache),
                LoadRule::new(r".*/segment_\d+/.*", OpenType::Buffered),
            ],
        };
        config.compile().unwrap();

        assert_eq!(config.resolve("/p/segment_0/attribute/price"), OpenType::Cache);
        assert_eq!(config.resolve("/p/segment_0/index/title"), OpenType::Buffered);
        assert_eq!(config.resolve("/p/version.0"), OpenType::Mmap);
    }

    #[test]
    fn test_auto_resolves_to_in_mem() {
        let config = LoadConfig {
            default_open_type: OpenType::Auto,
            rules: Vec::new(),
        };
        assert_eq!(config.resolve("/anything"), OpenType::InMem);
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let mut config = LoadConfig {
            default_open_type: OpenType::Mmap,
            rules: vec![LoadRule::new("(unclosed", OpenType::Cache)],
        };
        assert!(matches!(config.compile(), Err(ConfigError::Pattern { .. })));
        // Uncompiled invalid rules simply never match
        assert_eq!(config.resolve("/x/(unclosed"), OpenType::Mmap);
    }
}
