// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Declarative string configuration.
//!
//! A configuration string is a `;`-separated sequence of `key=value` pairs,
//! e.g. `name=beat;type=uint;size=1`. Pair order is preserved — repeatable
//! keys like `record` apply in order. [`Configurable`] is the consuming side:
//! anything with settable keys implements `set_conf` and gets `configure`
//! for free.

use core::fmt;
use core::str::FromStr;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StrConfiguration {
    pairs: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required key was absent.
    MissingKey(String),
    /// The key is not understood by the target.
    UnknownKey(String),
    /// The value did not parse for its key.
    InvalidValue { key: String, value: String },
    /// A key addressed a tree path that did not resolve.
    NodeNotFound { key: String, path: String },
}

/// An object with declaratively settable keys.
pub trait Configurable {
    /// Applies one `key=value` pair.
    ///
    /// # Errors
    ///
    /// [`ConfigError::UnknownKey`] for keys the object does not define,
    /// [`ConfigError::InvalidValue`] for unparseable values.
    fn set_conf(&self, key: &str, value: &str) -> Result<(), ConfigError>;

    /// Parses `conf` and applies every pair in order, stopping at the first
    /// failure.
    ///
    /// # Errors
    ///
    /// Propagates the first [`ConfigError`] from [`Configurable::set_conf`].
    fn configure(&self, conf: &str) -> Result<(), ConfigError> {
        for (key, value) in StrConfiguration::parse(conf).iter() {
            self.set_conf(key, value)?;
        }
        Ok(())
    }
}

// === impl StrConfiguration ===

impl StrConfiguration {
    /// Parses `conf`. Segments without `=` become keys with empty values;
    /// segments with an empty key are dropped.
    pub fn parse(conf: &str) -> Self {
        let pairs = conf
            .split(';')
            .filter_map(|segment| {
                let (key, value) = segment.split_once('=').unwrap_or((segment, ""));
                (!key.is_empty()).then(|| (key.to_owned(), value.to_owned()))
            })
            .collect();
        Self { pairs }
    }

    /// The first value under `key`.
    pub fn find(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(candidate, _)| candidate == key)
            .map(|(_, value)| value.as_str())
    }

    /// The first value under `key`.
    ///
    /// # Errors
    ///
    /// Fails with [`ConfigError::MissingKey`] when the key is absent.
    pub fn get(&self, key: &str) -> Result<&str, ConfigError> {
        self.find(key)
            .ok_or_else(|| ConfigError::MissingKey(key.to_owned()))
    }

    pub fn has(&self, key: &str) -> bool {
        self.find(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

impl fmt::Display for StrConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, value)) in self.pairs.iter().enumerate() {
            if i > 0 {
                f.write_str(";")?;
            }
            write!(f, "{key}={value}")?;
        }
        Ok(())
    }
}

/// Parses a typed value for `key`, mapping parse failures to
/// [`ConfigError::InvalidValue`].
///
/// # Errors
///
/// Fails with [`ConfigError::InvalidValue`] when `value` does not parse as
/// `T`.
pub fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_owned(),
        value: value.to_owned(),
    })
}

/// Parses a boolean configuration value: `true`/`false`/`1`/`0`.
///
/// # Errors
///
/// Fails with [`ConfigError::InvalidValue`] for anything else.
pub fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_owned(),
            value: value.to_owned(),
        }),
    }
}

// === impl ConfigError ===

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::MissingKey(key) => write!(f, "missing configuration key '{key}'"),
            ConfigError::UnknownKey(key) => write!(f, "unknown configuration key '{key}'"),
            ConfigError::InvalidValue { key, value } => {
                write!(f, "invalid value '{value}' for configuration key '{key}'")
            }
            ConfigError::NodeNotFound { key, path } => {
                write!(f, "configuration key '{key}' addresses unknown node '{path}'")
            }
        }
    }
}

impl core::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parse_preserves_order_and_duplicates() {
        let conf = StrConfiguration::parse("record=a=..x;record=b=..y;frequency=10");
        let pairs: Vec<_> = conf.iter().collect();
        assert_eq!(
            pairs,
            vec![
                ("record", "a=..x"),
                ("record", "b=..y"),
                ("frequency", "10"),
            ]
        );
        assert_eq!(conf.find("record"), Some("a=..x"));
    }

    #[test]
    fn odd_segments() {
        let conf = StrConfiguration::parse(";key;other=;=value;");
        let pairs: Vec<_> = conf.iter().collect();
        assert_eq!(pairs, vec![("key", ""), ("other", "")]);
        assert!(StrConfiguration::parse("").is_empty());
    }

    #[test]
    fn get_reports_missing_keys() {
        let conf = StrConfiguration::parse("name=x");
        assert_eq!(conf.get("name"), Ok("x"));
        assert_eq!(
            conf.get("size"),
            Err(ConfigError::MissingKey("size".to_owned()))
        );
    }

    #[test]
    fn value_parsers() {
        assert_eq!(parse_value::<usize>("size", "4"), Ok(4));
        assert!(parse_value::<usize>("size", "toto").is_err());
        assert_eq!(parse_bool("flag", "true"), Ok(true));
        assert_eq!(parse_bool("flag", "0"), Ok(false));
        assert!(parse_bool("flag", "yes").is_err());
    }

    proptest! {
        #[test]
        fn display_parse_roundtrip(
            pairs in proptest::collection::vec(("[a-z]{1,8}", "[a-z0-9.]{0,8}"), 0..6)
        ) {
            let conf = StrConfiguration::parse(
                &pairs
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect::<Vec<_>>()
                    .join(";"),
            );
            let reparsed = StrConfiguration::parse(&conf.to_string());
            prop_assert_eq!(conf, reparsed);
        }
    }
}
