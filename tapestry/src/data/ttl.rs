//! Time-to-live annotations for handles

use crate::error::EntityError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

static TTL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^\s*(?:@ttl\(\s*['"]?)?\s*(\d+)\s*([dhm])\s*(?:['"]?\s*\))?\s*$"#)
        .expect("valid TTL regex")
});

const MINUTE_MILLIS: i64 = 60 * 1000;

/// How long entities written through a handle stay alive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Ttl {
    #[default]
    Infinite,
    Minutes(u32),
    Hours(u32),
    Days(u32),
}

impl Ttl {
    /// Parse `"2d"`, `"30m"`, `"1h"` or the annotation form `@ttl('2d')`
    pub fn parse(text: &str) -> Result<Ttl, EntityError> {
        let caps = TTL_RE
            .captures(text)
            .ok_or_else(|| EntityError::InvalidTtl(format!("cannot parse \"{}\"", text)))?;
        let count: u32 = caps[1]
            .parse()
            .map_err(|_| EntityError::InvalidTtl(format!("count out of range in \"{}\"", text)))?;
        if count == 0 {
            return Err(EntityError::InvalidTtl(format!(
                "count must be positive in \"{}\"",
                text
            )));
        }
        Ok(match &caps[2] {
            "m" => Ttl::Minutes(count),
            "h" => Ttl::Hours(count),
            _ => Ttl::Days(count),
        })
    }

    pub fn is_infinite(&self) -> bool {
        matches!(self, Ttl::Infinite)
    }

    /// Duration in milliseconds, `None` when infinite
    pub fn millis(&self) -> Option<i64> {
        match self {
            Ttl::Infinite => None,
            Ttl::Minutes(n) => Some(i64::from(*n) * MINUTE_MILLIS),
            Ttl::Hours(n) => Some(i64::from(*n) * 60 * MINUTE_MILLIS),
            Ttl::Days(n) => Some(i64::from(*n) * 24 * 60 * MINUTE_MILLIS),
        }
    }
}

impl fmt::Display for Ttl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ttl::Infinite => write!(f, "infinite"),
            Ttl::Minutes(n) => write!(f, "{}m", n),
            Ttl::Hours(n) => write!(f, "{}h", n),
            Ttl::Days(n) => write!(f, "{}d", n),
        }
    }
}
