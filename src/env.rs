//! Layered process environment
//!
//! Callers send `KEY=VALUE` override lines with each request. The process
//! environment is laid over those lines, so a variable set on the host
//! always wins over the same variable supplied by the caller.

use std::collections::BTreeMap;

/// Ordered environment mapping for a single RPC call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    vars: BTreeMap<String, String>,
}

impl Environment {
    /// Build from caller override lines, then overlay the process environment
    pub fn from_overrides(lines: &str) -> Self {
        Self::layered(lines, process_vars())
    }

    /// Build from override lines with an explicit top layer
    pub fn layered<I, K, V>(lines: &str, top: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut env = Self::parse(lines);
        for (key, value) in top {
            env.vars.insert(key.into(), value.into());
        }
        env
    }

    /// Parse `KEY=VALUE` lines; blank lines and `#` comments are skipped
    pub fn parse(lines: &str) -> Self {
        let mut vars = BTreeMap::new();
        for line in lines.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once('=').unwrap_or((line, ""));
            let key = key.trim();
            if key.is_empty() {
                continue;
            }
            vars.insert(key.to_string(), value.to_string());
        }
        Self { vars }
    }

    /// Look up a variable
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Look up a variable, treating an empty value as absent
    pub fn get_non_empty(&self, key: &str) -> Option<&str> {
        self.get(key).filter(|v| !v.is_empty())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.vars.iter()
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

}

/// Process variables; pairs that are not valid UTF-8 are skipped
fn process_vars() -> impl Iterator<Item = (String, String)> {
    std::env::vars_os()
        .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)))
}
