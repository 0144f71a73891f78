//! Logging initialization, following the teacher crate's use of `log4rs` as
//! the logging backend behind the `log` facade.

/// Initialize logging from `log4rs.yaml` in the working directory, falling
/// back silently if the file is absent (the caller may have already set up
/// a logger of its own).
pub fn init() -> Result<(), Box<dyn std::error::Error>> {
    let _ = log4rs::init_file("log4rs.yaml", log4rs::config::Deserializers::default());
    Ok(())
}

/// Configure logging programmatically: a single rolling file appender in
/// `dir` (or the current directory), at the given level.
///
/// # Errors
/// Returns an error if the log directory cannot be created or the appender
/// cannot be built.
pub fn configure_logging(
    dir: Option<&std::path::Path>,
    level: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    use log::LevelFilter;
    use log4rs::append::console::ConsoleAppender;
    use log4rs::append::file::FileAppender;
    use log4rs::config::{Appender, Config, Root};
    use log4rs::encode::pattern::PatternEncoder;
    use std::path::PathBuf;

    let base = dir
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
    std::fs::create_dir_all(&base)?;
    let lvl = match level.unwrap_or("info").to_ascii_lowercase().as_str() {
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    };
    let pattern = "{d(%Y-%m-%d %H:%M:%S%.3f)} [{l}] {t} - {m}{n}";
    let file_appender = FileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(pattern)))
        .build(base.join("diskmeta.log"))?;
    let console = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new(pattern)))
        .build();
    let config = Config::builder()
        .appender(Appender::builder().build("file", Box::new(file_appender)))
        .appender(Appender::builder().build("console", Box::new(console)))
        .build(Root::builder().appender("file").appender("console").build(lvl))?;
    log4rs::init_config(config)?;
    Ok(())
}
