//! Path template expansion
//!
//! Placeholders use `{name}` syntax. Lookups go through the secret's own
//! variables first, then the built-in `name`, then the manifest defaults.

use regex::{Captures, Regex};
use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid placeholder regex"))
}

/// Layered variable lookup for one secret
#[derive(Debug, Clone)]
pub struct Variables<'a> {
    secret: &'a BTreeMap<String, String>,
    name: &'a str,
    defaults: &'a HashMap<String, String>,
}

impl<'a> Variables<'a> {
    pub fn new(
        secret: &'a BTreeMap<String, String>,
        name: &'a str,
        defaults: &'a HashMap<String, String>,
    ) -> Self {
        Self {
            secret,
            name,
            defaults,
        }
    }

    /// Get a variable value
    pub fn get(&self, key: &str) -> Option<&str> {
        if let Some(value) = self.secret.get(key) {
            return Some(value);
        }
        if key == "name" {
            return Some(self.name);
        }
        self.defaults.get(key).map(String::as_str)
    }

    /// Replace every placeholder, failing on the first undefined variable
    pub fn substitute(&self, template: &str) -> Result<String, String> {
        if let Some(missing) = find_used_variables(template)
            .into_iter()
            .find(|var| self.get(var).is_none())
        {
            return Err(missing);
        }

        Ok(placeholder_re()
            .replace_all(template, |caps: &Captures| {
                self.get(&caps[1]).unwrap_or_default().to_string()
            })
            .into_owned())
    }
}

/// Find all variables used in a template, in order of first use
pub fn find_used_variables(template: &str) -> Vec<String> {
    let mut vars: Vec<String> = Vec::new();
    for cap in placeholder_re().captures_iter(template) {
        let var = cap[1].to_string();
        if !vars.contains(&var) {
            vars.push(var);
        }
    }
    vars
}
