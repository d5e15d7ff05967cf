use crate::core::config::{LogConfig, LogFormat};
use std::io::Write;

/// Installs the process-wide logger. Safe to call more than once; later
/// calls are ignored.
pub fn init_logging(config: &LogConfig) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.level));

    if config.format == LogFormat::Json {
        builder.format(|buf, record| {
            let line = serde_json::json!({
                "ts": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
                "level": record.level().as_str(),
                "target": record.target(),
                "message": record.args().to_string(),
            });
            writeln!(buf, "{}", line)
        });
    } else {
        builder.write_style(env_logger::WriteStyle::Auto);
    }

    let _ = builder.try_init();
}
