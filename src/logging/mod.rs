//! Logger bootstrap.
//!
//! `RUST_LOG` always wins; the configuration may supply a fallback filter
//! so a bare node still reports height closures. With neither set, the
//! logger stays uninitialized and the `log` macros are no-ops.

pub fn init_logging(fallback_filter: Option<&str>) {
    let directives = match ::std::env::var("RUST_LOG") {
        Ok(env_filter) => env_filter,
        Err(_) => match fallback_filter {
            Some(filter) => filter.to_string(),
            None => {
                eprintln!("logging off: neither RUST_LOG nor node.log_filter is set");
                return;
            }
        },
    };
    eprintln!("logging with filter: {directives}");
    pretty_env_logger::formatted_timed_builder()
        .parse_filters(&directives)
        .format_timestamp_millis()
        .init();
}
