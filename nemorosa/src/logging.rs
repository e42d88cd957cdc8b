use log::LevelFilter;
use log4rs::append::console::ConsoleAppender;
use log4rs::config::{Appender, Logger, Root};
use log4rs::encode::pattern::PatternEncoder;
use log4rs::Config;
use std::sync::atomic::{AtomicBool, Ordering};

const LOG_FORMAT_CONSOLE: &str =
    "\x1B[37m{d(%Y-%m-%d %H:%M:%S%.3f)}\x1B[0m {h({l:>5.5})} \x1B[36m{t:<35.35}\x1B[0m \x1B[37m:\x1B[0m {m}{n}";
const CONSOLE_APPENDER: &str = "stdout";

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Initialize the application logger with the given root level.
/// Subsequent invocations are ignored.
pub fn init(root_level: LevelFilter) {
    if INITIALIZED.swap(true, Ordering::Relaxed) {
        return;
    }

    let config = Config::builder()
        .appender(
            Appender::builder().build(
                CONSOLE_APPENDER,
                Box::new(
                    ConsoleAppender::builder()
                        .encoder(Box::new(PatternEncoder::new(LOG_FORMAT_CONSOLE)))
                        .build(),
                ),
            ),
        )
        .logger(Logger::builder().build("hyper", LevelFilter::Info))
        .logger(Logger::builder().build("reqwest", LevelFilter::Info))
        .logger(Logger::builder().build("html5ever", LevelFilter::Info))
        .build(Root::builder().appender(CONSOLE_APPENDER).build(root_level))
        .expect("expected a valid logging configuration");

    log4rs::init_config(config).expect("expected the logger to initialize");
}
