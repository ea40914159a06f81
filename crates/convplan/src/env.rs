use std::env;
use std::sync::OnceLock;

static CONVPLAN_CODE_OBJECT_V3: OnceLock<bool> = OnceLock::new();

pub(crate) const DEFAULT_DRIVER: &str = "hip";

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

/// Whether a runtime that loads both code-object v2 and v3 should be fed v3.
pub(crate) fn prefer_code_object_v3() -> bool {
    *CONVPLAN_CODE_OBJECT_V3.get_or_init(|| match env::var("CONVPLAN_CODE_OBJECT_V3") {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => false,
    })
}

/// Solver ids listed in `CONVPLAN_DISABLE_SOLVERS`, read on every call so a
/// registry built later observes the current environment.
pub(crate) fn disabled_solvers() -> Vec<String> {
    match env::var("CONVPLAN_DISABLE_SOLVERS") {
        Ok(value) => parse_list(&value),
        Err(_) => Vec::new(),
    }
}

pub(crate) fn driver_name() -> String {
    env::var("CONVPLAN_DRIVER")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_DRIVER.to_string())
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bool_accepts_common_spellings() {
        for value in ["1", "true", "YES", " on "] {
            assert!(parse_bool(value), "{value:?} should parse as true");
        }
        for value in ["0", "false", "off", "", "maybe"] {
            assert!(!parse_bool(value), "{value:?} should parse as false");
        }
    }

    #[test]
    fn parse_list_drops_blank_entries() {
        assert_eq!(
            parse_list(" a, ,b,,c "),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
        assert!(parse_list("").is_empty());
    }
}
