//! Logging configuration for the shielded wallet
//!
//! Uses log4rs with appenders:
//! 1. ConsoleAppender - stdout output
//! 2. RollingFileAppender - log files with rotation
//! 3. EventBusAppender - forwards wallet warnings and errors to the event stream

use anyhow::anyhow;
use log::LevelFilter;
use log4rs::append::console::ConsoleAppender;
use log4rs::append::rolling_file::policy::compound::roll::fixed_window::FixedWindowRoller;
use log4rs::append::rolling_file::policy::compound::trigger::size::SizeTrigger;
use log4rs::append::rolling_file::policy::compound::CompoundPolicy;
use log4rs::append::rolling_file::RollingFileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;
use std::path::Path;
use std::sync::OnceLock;

use crate::events::{EventBus, WalletEvent};

/// Module targets whose warnings reach the event stream
const FORWARDED_TARGETS: [&str; 3] = [
    "shielded_wallet_lib::node",
    "shielded_wallet_lib::wallet",
    "shielded_wallet_lib::migration",
];

static EVENT_BUS: OnceLock<EventBus> = OnceLock::new();

/// Set the bus the EventBusAppender publishes to
pub fn set_event_bus(events: EventBus) {
    match EVENT_BUS.set(events) {
        Ok(_) => log::debug!("Event bus set for log forwarding"),
        Err(_) => log::warn!("Event bus for log forwarding already set"),
    }
}

/// Level name for forwarded records; `None` for levels that stay local
fn forwarded_level(record: &log::Record) -> Option<&'static str> {
    let target = record.target();
    if !FORWARDED_TARGETS.iter().any(|t| target.starts_with(t)) {
        return None;
    }

    match record.level() {
        log::Level::Error => Some("error"),
        log::Level::Warn => Some("warn"),
        _ => None,
    }
}

/// Custom log4rs appender that publishes wallet warnings as [`WalletEvent::Log`]
#[derive(Debug)]
pub struct EventBusAppender;

impl log4rs::append::Append for EventBusAppender {
    fn append(&self, record: &log::Record) -> anyhow::Result<()> {
        let Some(level) = forwarded_level(record) else {
            return Ok(());
        };

        if let Some(events) = EVENT_BUS.get() {
            events.emit(WalletEvent::Log {
                level: level.to_string(),
                message: format!("{}", record.args()),
            });
        }

        Ok(())
    }

    fn flush(&self) {}
}

/// Initialize log4rs with console, rolling file and event bus appenders
///
/// # Log File Configuration
/// - File: `{log_dir}/wallet.1.log`
/// - Max size: 20 MB per file
/// - Max count: 10 files (rotation)
/// - Pattern: `{timestamp} [{level}] {target} - {message}`
pub fn init_logger(log_dir: &Path) -> anyhow::Result<log4rs::Handle> {
    let console = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new(
            "{d(%H:%M:%S)} [{l}] {t} - {m}{n}",
        )))
        .build();

    std::fs::create_dir_all(log_dir)?;

    let log_file = log_dir.join("wallet.1.log");
    let log_pattern = log_dir.join("wallet.{}.log");
    let log_pattern = log_pattern
        .to_str()
        .ok_or_else(|| anyhow!("log directory {:?} is not valid UTF-8", log_dir))?;

    // Rolling file appender (20MB per file, 10 files max)
    let roller = FixedWindowRoller::builder().base(1).build(log_pattern, 10)?;
    let trigger = SizeTrigger::new(20 * 1024 * 1024);
    let policy = CompoundPolicy::new(Box::new(trigger), Box::new(roller));

    let logfile = RollingFileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(
            "{d(%Y-%m-%d %H:%M:%S)} [{l}] {t} - {m}{n}",
        )))
        .build(log_file, Box::new(policy))?;

    let config = Config::builder()
        .appender(Appender::builder().build("console", Box::new(console)))
        .appender(Appender::builder().build("logfile", Box::new(logfile)))
        .appender(Appender::builder().build("events", Box::new(EventBusAppender)))
        .build(
            Root::builder()
                .appender("console")
                .appender("logfile")
                .appender("events")
                .build(LevelFilter::Info),
        )?;

    Ok(log4rs::init_config(config)?)
}
