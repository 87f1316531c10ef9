//! Argument vector parsing for utility scripts
//!
//! ```text
//! --name          flag `name` = true
//! --name=value    flag `name` = value
//! -name=value     flag `name` = value
//! -abc            flags `a`, `b`, `c` = true
//! anything else   positional
//! ```
//!
//! Values are unquoted strings when quoted, otherwise integers, then
//! floats, then the raw text. A bare negative number such as `-5` is
//! positional.

use std::collections::BTreeMap;
use tickscript_data::DataValue;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedArgs {
    pub positional: Vec<DataValue>,
    pub flags: BTreeMap<String, DataValue>,
}

impl ParsedArgs {
    pub fn flag(&self, name: &str) -> Option<&DataValue> {
        self.flags.get(name)
    }

    pub fn to_data(&self) -> DataValue {
        DataValue::map([
            ("positional", DataValue::list(self.positional.iter().cloned())),
            (
                "flags",
                DataValue::map(self.flags.iter().map(|(k, v)| (k.clone(), v.clone()))),
            ),
        ])
    }
}

/// Parse raw argv tokens
pub fn parse_argv<S: AsRef<str>>(tokens: &[S]) -> ParsedArgs {
    let mut parsed = ParsedArgs::default();

    for token in tokens {
        let token = token.as_ref();

        if let Some(long) = token.strip_prefix("--").filter(|name| !name.is_empty()) {
            let (name, value) = split_flag(long);
            parsed.flags.insert(name.to_string(), value);
            continue;
        }

        if let Some(short) = token.strip_prefix('-').filter(|_| token.len() > 1) {
            if !short.starts_with('-') && !is_number(token) {
                if short.contains('=') {
                    let (name, value) = split_flag(short);
                    parsed.flags.insert(name.to_string(), value);
                } else {
                    for ch in short.chars() {
                        parsed.flags.insert(ch.to_string(), DataValue::Bool(true));
                    }
                }
                continue;
            }
        }

        parsed.positional.push(parse_value(token));
    }

    parsed
}

fn split_flag(body: &str) -> (&str, DataValue) {
    match body.split_once('=') {
        Some((name, raw)) => (name, parse_value(raw)),
        None => (body, DataValue::Bool(true)),
    }
}

fn is_number(token: &str) -> bool {
    token.parse::<i64>().is_ok() || token.parse::<f64>().map(f64::is_finite).unwrap_or(false)
}

/// Interpret one argument value
pub fn parse_value(raw: &str) -> DataValue {
    if let Some(inner) = unquote(raw) {
        return DataValue::from(inner);
    }
    if let Ok(n) = raw.parse::<i64>() {
        return DataValue::Int(n);
    }
    match raw.parse::<f64>() {
        Ok(n) if n.is_finite() => DataValue::Float(n),
        _ => DataValue::from(raw),
    }
}

/// Strip one pair of matching quotes
pub fn unquote(raw: &str) -> Option<&str> {
    let first = raw.chars().next()?;
    if raw.len() >= 2 && (first == '"' || first == '\'') && raw.ends_with(first) {
        Some(&raw[1..raw.len() - 1])
    } else {
        None
    }
}

/// Caller and argv handed to a utility script
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub caller: String,
    pub argv: Vec<String>,
}

impl Invocation {
    pub fn new(caller: impl Into<String>, argv: Vec<String>) -> Self {
        Self {
            caller: caller.into(),
            argv,
        }
    }

    pub fn args(&self) -> ParsedArgs {
        parse_argv(self.argv.as_slice())
    }

    /// `{ caller, argv, args: { positional, flags } }`
    pub fn to_data(&self) -> DataValue {
        DataValue::map([
            ("caller", DataValue::from(self.caller.as_str())),
            (
                "argv",
                DataValue::list(self.argv.iter().map(|a| DataValue::from(a.as_str()))),
            ),
            ("args", self.args().to_data()),
        ])
    }
}
