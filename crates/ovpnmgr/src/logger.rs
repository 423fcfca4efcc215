use colored::Colorize;
use log::{Level, LevelFilter};
use std::io::Write;

/// Target used for raw management-channel reply lines.
pub const MGMT_LOG_TARGET: &str = "ovpnmgr::mgmt";

pub fn init_logger(level: LevelFilter) {
    env_logger::Builder::new()
        .filter(None, level)
        .format(|buf, record| {
            let level = match record.level() {
                Level::Error => "ERROR".red(),
                Level::Warn => "WARN".yellow(),
                Level::Info => "INFO".green(),
                Level::Debug => "DEBUG".blue(),
                Level::Trace => "TRACE".purple(),
            };
            if record.target() == MGMT_LOG_TARGET {
                writeln!(buf, "[{}] <mgmt> {}", level, record.args())
            } else {
                writeln!(buf, "[{}] {}", level, record.args())
            }
        })
        .init();
}
