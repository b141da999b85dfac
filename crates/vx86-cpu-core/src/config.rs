use serde::{Deserialize, Serialize};

/// Tunables for the fatal-exception path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of frames walked when reporting an unhandled fault.
    pub backtrace_limit: usize,
    /// Ask the symbol resolver for function names while walking the stack.
    ///
    /// Resolution can be slow (it may run an external tool per frame); disable it when only
    /// module offsets are needed.
    pub symbolize_backtraces: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backtrace_limit: 64,
            symbolize_backtraces: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{"backtrace_limit": 4}"#).unwrap();
        assert_eq!(config.backtrace_limit, 4);
        assert!(config.symbolize_backtraces);
    }
}
