use env_logger::Target;

/// Initialise the process logger.
///
/// Logs go to stderr so `--json` output on stdout stays parseable. Default
/// level is `warn` (`debug` with `--verbose`); `RUST_LOG` overrides both.
pub fn init(verbose: bool) {
    let level = if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Warn
    };

    let _ = env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .target(Target::Stderr)
        .format_timestamp(None)
        .try_init();
}
