use std::env;
use std::sync::OnceLock;

static DNNC_LOG_PLANS: OnceLock<bool> = OnceLock::new();

/// Interprets `1`, `true`, `yes`, and `on` (any case) as enabled.
pub fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

/// Reads a boolean toggle; unset or blank means disabled.
pub fn flag(name: &str) -> bool {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => false,
    }
}

/// `DNNC_LOG_PLANS`: log every group plan as JSON at info level during build.
pub(crate) fn log_plans_enabled() -> bool {
    *DNNC_LOG_PLANS.get_or_init(|| flag("DNNC_LOG_PLANS"))
}

#[cfg(test)]
mod tests {
    use super::parse_bool;

    #[test]
    fn parse_bool_accepts_common_spellings() {
        for value in ["1", "true", "YES", " on "] {
            assert!(parse_bool(value), "{value}");
        }
        for value in ["0", "false", "off", "", "maybe"] {
            assert!(!parse_bool(value), "{value}");
        }
    }
}
