//! Virtual-host resolution.
//!
//! Labels double as glob patterns (`*` expands to `.*`); patterns are
//! compiled once and matched in table order, first match wins. The reserved
//! label `all` matches every hostname.

use std::sync::RwLock;

use regex::Regex;
use tracing::debug;

pub const ALL: &str = "all";

struct VhostPattern {
    label: String,
    regex: Regex,
}

pub struct VhostTable {
    patterns: RwLock<Vec<VhostPattern>>,
    default_label: String,
}

impl VhostTable {
    /// Compile the vhost patterns. Labels are ordered deterministically
    /// (lexicographic, `all` last so it cannot shadow a narrower host).
    pub fn new(default_label: &str, labels: &[String]) -> anyhow::Result<Self> {
        let mut ordered: Vec<&String> = labels.iter().filter(|l| *l != ALL).collect();
        ordered.sort();

        let mut patterns = Vec::with_capacity(ordered.len() + 1);
        for label in ordered {
            patterns.push(VhostPattern {
                label: label.clone(),
                regex: compile_glob(label)?,
            });
        }
        if labels.iter().any(|l| l == ALL) {
            patterns.push(VhostPattern {
                label: ALL.to_string(),
                regex: Regex::new(".*")?,
            });
        }

        Ok(Self {
            patterns: RwLock::new(patterns),
            default_label: default_label.to_string(),
        })
    }

    /// Pick the vhost for a hostname; first match wins, else the default.
    pub fn select(&self, hostname: &str) -> String {
        let patterns = self.patterns.read().unwrap_or_else(|e| e.into_inner());
        for entry in patterns.iter() {
            if entry.label == ALL || entry.regex.is_match(hostname) {
                debug!(hostname, vhost = %entry.label, "virtual host matched");
                return entry.label.clone();
            }
        }
        self.default_label.clone()
    }

    pub fn default_label(&self) -> &str {
        &self.default_label
    }
}

/// Compile a hostname glob into an anchored case-insensitive regex.
fn compile_glob(glob: &str) -> anyhow::Result<Regex> {
    let mut source = String::with_capacity(glob.len() + 8);
    source.push_str("(?i)^");
    for ch in glob.chars() {
        match ch {
            '*' => source.push_str(".*"),
            c if "\\.+?()[]{}|^$".contains(c) => {
                source.push('\\');
                source.push(c);
            }
            c => source.push(c),
        }
    }
    source.push('$');
    Ok(Regex::new(&source)?)
}
