use crate::qemu_trace;
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

/// `log` backend writing `[LEVEL] target: message` lines to the QEMU debug
/// console.
pub struct QemuLogger {
    max_level: LevelFilter,
}

impl QemuLogger {
    #[must_use]
    pub const fn new(max_level: LevelFilter) -> Self {
        Self { max_level }
    }

    #[must_use]
    pub const fn max_level(&self) -> LevelFilter {
        self.max_level
    }

    /// Install as the global logger. Call once during pre-init.
    ///
    /// # Errors
    /// Fails if a logger was already installed.
    pub fn init(&'static self) -> Result<(), SetLoggerError> {
        log::set_logger(self)?;
        log::set_max_level(self.max_level);
        Ok(())
    }
}

impl Log for QemuLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        qemu_trace!(
            "[{}] {}: {}\n",
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {}
}
