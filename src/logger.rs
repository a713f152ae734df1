use std::env;

use log::LevelFilter;
use simplelog::{ColorChoice, ConfigBuilder, TermLogger, TerminalMode};

/// Initializes terminal logging for the binary. The level comes from the
/// `VIGIL_LOG` env var and defaults to `info`. Logs go to stderr so they
/// never mix with the supervised command's stdout.
pub fn init() {
    let level = env::var("VIGIL_LOG")
        .ok()
        .and_then(|level| level.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Info);

    let config = ConfigBuilder::new()
        .set_time_level(LevelFilter::Debug)
        .set_target_level(LevelFilter::Debug)
        .build();

    // A second init (e.g. from tests) is harmless.
    let _ = TermLogger::init(level, config, TerminalMode::Stderr, ColorChoice::Auto);
}
