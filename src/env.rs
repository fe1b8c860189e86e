//! Boot environment, a flat string key/value store.

use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    vars: BTreeMap<String, String>,
}

impl Environment {
    pub fn new() -> Self {
        Environment::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(|s| s.as_str())
    }

    /// Setting an empty value deletes the variable
    pub fn set(&mut self, name: &str, value: &str) {
        if value.is_empty() {
            self.vars.remove(name);
        } else {
            self.vars.insert(name.to_string(), value.to_string());
        }
    }

    /// Parse a numeric variable, falling back to `default` when it is
    /// missing or malformed. A "0x" prefix forces hex, otherwise `base` is used.
    pub fn get_ulong(&self, name: &str, base: u32, default: u64) -> u64 {
        let Some(value) = self.get(name) else {
            return default;
        };
        let value = value.trim();
        let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
            Some(hex) => u64::from_str_radix(hex, 16),
            None => u64::from_str_radix(value, base),
        };
        parsed.unwrap_or(default)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.vars.iter()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Environment {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut env = Environment::new();
        for (k, v) in iter {
            env.set(&k.into(), &v.into());
        }
        env
    }
}
