use std::fmt;

use log::{Level, LevelFilter, Log, Metadata, Record};

// Packet dumps longer than this are cut, a full-size packet would flood the output.
const MAX_HEX_BYTES: usize = 128;

static LOGGER: Logger = Logger {
    crate_name: env!("CARGO_PKG_NAME"),
};

pub fn setup_logger(max_level: LevelFilter) -> Result<(), log::SetLoggerError> {
    log::set_logger(&LOGGER)?;
    log::set_max_level(max_level);
    Ok(())
}

struct Logger {
    crate_name: &'static str,
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        // Dependencies only get to report problems.
        metadata.target().starts_with(self.crate_name) || metadata.level() <= Level::Warn
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        println!(
            "{} {} -- {}",
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {}
}

/// Formats bytes as space-separated hex, truncated after `MAX_HEX_BYTES`.
pub fn fmt_slice_hex(data: &[u8]) -> impl fmt::Display + '_ {
    struct HexSlice<'a>(&'a [u8]);
    impl fmt::Display for HexSlice<'_> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let shown = &self.0[..self.0.len().min(MAX_HEX_BYTES)];
            for (i, b) in shown.iter().enumerate() {
                if i > 0 {
                    f.write_str(" ")?;
                }
                write!(f, "{b:02x}")?;
            }
            if shown.len() < self.0.len() {
                write!(f, " ... ({} bytes)", self.0.len())?;
            }
            Ok(())
        }
    }
    HexSlice(data)
}
