//! Leveled logging bootstrap, mirroring the `SQRUFF_LOG`-style env-filtered
//! `fern` dispatch used elsewhere in this pack, renamed for this project.

pub fn init() -> Result<(), log::SetLoggerError> {
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{} [{}] {}",
                chrono::Utc::now().format("%d.%m.%y %H:%M:%S"),
                record.level(),
                message
            ))
        })
        .level(
            std::env::var("BOARDD_LOG")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(log::LevelFilter::Info),
        )
        .chain(std::io::stderr())
        .apply()
}
