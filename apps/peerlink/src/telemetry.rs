use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

pub const DEFAULT_LOG_FILTER: &str = "info,peerlink=debug";

/// Parses `directives`, falling back to [`DEFAULT_LOG_FILTER`] when they do not parse.
pub fn log_filter(directives: &str) -> EnvFilter {
    match EnvFilter::try_new(directives) {
        Ok(filter) => filter,
        Err(err) => {
            eprintln!("invalid log filter {directives:?} ({err}); using {DEFAULT_LOG_FILTER:?}");
            EnvFilter::new(DEFAULT_LOG_FILTER)
        }
    }
}

/// Installs the global subscriber. Events keep their module target so lines
/// from each crate stay distinguishable in one stream.
pub fn init_tracing(directives: &str) {
    let fmt_layer = fmt::layer().with_target(true).with_thread_names(true);
    Registry::default()
        .with(log_filter(directives))
        .with(fmt_layer)
        .init();
}
