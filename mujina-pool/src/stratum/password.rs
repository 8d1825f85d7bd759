//! Control variables in the `mining.authorize` password.
//!
//! Miners can pass settings through the password field as `;`-separated
//! `key=value` pairs, e.g. `x;d=4096`. Anything else is ignored.

use std::collections::HashMap;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PasswordVars {
    vars: HashMap<String, String>,
}

impl PasswordVars {
    pub fn parse(password: &str) -> Self {
        let vars = password
            .split(';')
            .filter_map(|pair| pair.split_once('='))
            .map(|(key, value)| (key.trim().to_lowercase(), value.trim().to_string()))
            .filter(|(key, _)| !key.is_empty())
            .collect();
        Self { vars }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Static difficulty requested with `d=<value>`.
    pub fn static_difficulty(&self) -> Option<f64> {
        self.get("d")?
            .parse::<f64>()
            .ok()
            .filter(|d| d.is_finite() && *d > 0.0)
    }
}
