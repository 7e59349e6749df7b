use env_logger::Env;
use log::LevelFilter;
use once_cell::sync::OnceCell;

static RUST_LOG_LEVEL: OnceCell<LevelFilter> = OnceCell::new();

fn env_level() -> LevelFilter {
    std::env::var("PHOTOMETRY_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .as_deref()
        .and_then(parse_level)
        .unwrap_or(LevelFilter::Info)
}

fn level_to_str(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::Off => "off",
        LevelFilter::Error => "error",
        LevelFilter::Warn => "warn",
        LevelFilter::Info => "info",
        LevelFilter::Debug => "debug",
        LevelFilter::Trace => "trace",
    }
}

fn parse_level(input: &str) -> Option<LevelFilter> {
    input.trim().parse::<LevelFilter>().ok()
}

/// Initialize logging (stderr formatter) based on `PHOTOMETRY_LOG`/`RUST_LOG`.
///
/// Safe to call multiple times; the logger is installed on the first call and the
/// level chosen then is returned on every call.
pub fn init_rust_logging() -> LevelFilter {
    *RUST_LOG_LEVEL.get_or_init(|| {
        let level = env_level();
        let env = Env::default().default_filter_or(level_to_str(level));
        // Another logger may already be installed (tests, embedding applications).
        let _ = env_logger::Builder::from_env(env)
            .format_timestamp_millis()
            .format_module_path(true)
            .format_target(true)
            .try_init();
        level
    })
}

/// Override the global maximum level at runtime, e.g. from a `--verbose` flag.
pub fn set_log_level(level: Option<&str>) {
    let level = level.and_then(parse_level).unwrap_or_else(env_level);
    log::set_max_level(level);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level_accepts_names_case_insensitively() {
        assert_eq!(parse_level("debug"), Some(LevelFilter::Debug));
        assert_eq!(parse_level(" WARN "), Some(LevelFilter::Warn));
        assert_eq!(parse_level("loud"), None);
    }

    #[test]
    fn test_level_names_round_trip() {
        for level in [
            LevelFilter::Off,
            LevelFilter::Error,
            LevelFilter::Warn,
            LevelFilter::Info,
            LevelFilter::Debug,
            LevelFilter::Trace,
        ] {
            assert_eq!(parse_level(level_to_str(level)), Some(level));
        }
    }

    #[test]
    fn test_init_is_idempotent() {
        let first = init_rust_logging();
        let second = init_rust_logging();
        assert_eq!(first, second);
    }
}
