//! Structured logging facade.
//!
//! A thin helper over `log`/`env_logger`. Channel and manager code build a
//! [`LogContext`] once per event and render it into the log line at the call
//! site, rather than exposing a separate tracing-style span API.

/// Initialize the global logger from `RUST_LOG` (default `info`).
///
/// Safe to call more than once; subsequent calls are no-ops.
pub fn init() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .is_test(cfg!(test))
        .try_init();
}

/// Ordered key-value context attached to a log line.
///
/// Grounded on the `{type, origin, destination[, destination account]}`
/// context maps NodeChannel/AccountChannel contribute per their
/// specialization points.
#[derive(Debug, Default, Clone)]
pub struct LogContext {
    pairs: Vec<(&'static str, String)>,
}

impl LogContext {
    /// Start an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a key-value pair, returning `self` for chaining.
    #[must_use]
    pub fn with(mut self, key: &'static str, value: impl std::fmt::Display) -> Self {
        self.pairs.push((key, value.to_string()));
        self
    }
}

impl std::fmt::Display for LogContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, (key, value)) in self.pairs.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{key}={value}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_renders_in_insertion_order() {
        let ctx = LogContext::new()
            .with("type", "node")
            .with("origin", "0xabc")
            .with("destination", "0xdef");
        assert_eq!(ctx.to_string(), "type=node origin=0xabc destination=0xdef");
    }

    #[test]
    fn test_empty_context_renders_empty() {
        assert_eq!(LogContext::new().to_string(), "");
    }
}
