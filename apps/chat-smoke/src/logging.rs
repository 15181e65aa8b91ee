//! Tracing bootstrap for the smoke runner.

use std::env;

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,chat_smoke=debug,chat_engine=debug";

/// Install the global subscriber, filtered from the environment.
///
/// Precedence:
/// 1) `RUST_LOG`
/// 2) `MUDCHAT_SMOKE_LOG`
/// 3) `MUDCHAT_LOG`
/// 4) built-in default filter
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_target(true)
        .with_thread_names(true)
        .with_env_filter(filter_from_env())
        .try_init();
}

fn filter_from_env() -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }

    ["MUDCHAT_SMOKE_LOG", "MUDCHAT_LOG"]
        .into_iter()
        .find_map(|key| filter_from_var(env::var(key).ok()))
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}

fn filter_from_var(value: Option<String>) -> Option<EnvFilter> {
    let value = value.filter(|v| !v.trim().is_empty())?;
    EnvFilter::try_new(value).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_or_missing_values_fall_through() {
        assert!(filter_from_var(None).is_none());
        assert!(filter_from_var(Some("   ".into())).is_none());
    }

    #[test]
    fn accepts_directive_lists() {
        let filter = filter_from_var(Some("warn,chat_engine=trace".into()))
            .expect("valid directives");
        assert!(filter.to_string().contains("chat_engine=trace"));
    }
}
