//! Process-wide settings read once from the environment.
//!
//! Environment variables:
//! - `VERBOSE`: `yes`, `true` or `1` raises the default log level to `debug`.
//! - `KADALU_VERSION`: version reported by the CSI driver and used as the
//!   storage-unit image tag. Defaults to the crate version.

use std::sync::LazyLock;

pub struct RuntimeConfig {
    pub verbose: bool,
    pub version: String,
}

fn truthy(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "yes" | "true" | "1")
}

pub static RUNTIME: LazyLock<RuntimeConfig> = LazyLock::new(|| RuntimeConfig {
    verbose: std::env::var("VERBOSE").is_ok_and(|v| truthy(&v)),
    version: std::env::var("KADALU_VERSION")
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_owned()),
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbose_values() {
        for v in ["yes", "TRUE", "1"] {
            assert!(truthy(v), "{v}");
        }
        for v in ["no", "0", "", "y"] {
            assert!(!truthy(v), "{v}");
        }
    }
}
