use log::{Level, LevelFilter, Metadata, Record};
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

const RESET: &str = "\x1b[0m";
const BANNER: &str = "\x1b[96m";
// Lines from the update pipeline get a marker so they stand out in a busy capture
const UPDATE_MODULES: [&str; 5] = ["orchestrator", "transfer", "validator", "transfer_server", "partitions"];

static STARTED: OnceLock<Instant> = OnceLock::new();
static LOGGER: ConsoleLogger = ConsoleLogger;

struct ConsoleLogger;

fn level_style(level: Level) -> (&'static str, char) {
    match level {
        Level::Error => ("\x1b[91m", 'E'),
        Level::Warn => ("\x1b[93m", 'W'),
        Level::Info => ("\x1b[92m", 'I'),
        Level::Debug => ("\x1b[94m", 'D'),
        Level::Trace => ("\x1b[90m", 'T'),
    }
}

/// `12.345s` under a minute, `4m07s` under an hour, `2h13m` after that
fn uptime_stamp(uptime: Duration) -> String {
    let secs = uptime.as_secs();
    match secs {
        0..=59 => format!("{:>3}.{:03}s", secs, uptime.subsec_millis()),
        60..=3599 => format!("{:>2}m{:02}s", secs / 60, secs % 60),
        _ => format!("{:>2}h{:02}m", secs / 3600, (secs % 3600) / 60),
    }
}

fn module_tag(path: Option<&str>) -> &str {
    let leaf = path.and_then(|p| p.rsplit("::").next()).unwrap_or("?");
    leaf.get(..12).unwrap_or(leaf)
}

impl log::Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let started = STARTED.get_or_init(Instant::now);
        let (color, level) = level_style(record.level());
        let tag = module_tag(record.module_path());
        let marker = if UPDATE_MODULES.iter().any(|m| tag.starts_with(m)) { '*' } else { ' ' };

        println!(
            "{}{} [{}]{}{:>12} | {}{}",
            color,
            uptime_stamp(started.elapsed()),
            level,
            marker,
            tag,
            record.args(),
            RESET
        );
    }

    fn flush(&self) {}
}

/// Install the serial logger at `Info`. Call once, first thing in `main`.
pub fn init_logger() -> Result<(), log::SetLoggerError> {
    STARTED.get_or_init(Instant::now);
    log::set_logger(&LOGGER)?;
    log::set_max_level(LevelFilter::Info);

    println!("{}== Driver Console {} =={}", BANNER, crate::version::DISPLAY_VERSION, RESET);
    Ok(())
}

/// Apply a level name such as `debug` or `warning`; false when unrecognized
pub fn set_max_level_from_str(level: &str) -> bool {
    let name = if level.eq_ignore_ascii_case("warning") { "warn" } else { level };
    match LevelFilter::from_str(name.trim()) {
        Ok(filter) => {
            log::set_max_level(filter);
            true
        }
        Err(_) => false,
    }
}
