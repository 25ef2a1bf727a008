//! Reading settings out of the environment. Unset means "keep the default",
//! so does a value we can't make sense of (with a warning).

use std::{fmt::Display, str::FromStr};

/// `1`/`true`/`on`/`yes` or `0`/`false`/`off`/`no`, case insensitive
pub fn flag(name: &str) -> Option<bool> {
    let value = std::env::var(name).ok()?;
    match parse_flag(&value) {
        Some(flag) => Some(flag),
        None => {
            log::warn!("{name}={value:?} is not a boolean, ignoring it");
            None
        }
    }
}

pub fn parse_flag(value: &str) -> Option<bool> {
    let value = value.trim();
    ["1", "true", "on", "yes"]
        .iter()
        .any(|v| value.eq_ignore_ascii_case(v))
        .then_some(true)
        .or_else(|| {
            ["0", "false", "off", "no"]
                .iter()
                .any(|v| value.eq_ignore_ascii_case(v))
                .then_some(false)
        })
}

pub fn parse<T>(name: &str) -> Option<T>
where
    T: FromStr,
    T::Err: Display,
{
    let value = std::env::var(name).ok()?;
    match value.trim().parse() {
        Ok(v) => Some(v),
        Err(e) => {
            log::warn!("{name}={value:?}: {e}, ignoring it");
            None
        }
    }
}
