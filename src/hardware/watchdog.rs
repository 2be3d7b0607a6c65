use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, warn};

/// Hardware watchdog; the system resets when it stops being fed
#[cfg_attr(test, mockall::automock)]
pub trait Watchdog: Send + Sync {
    fn feed(&self) -> std::io::Result<()>;

    /// Disarms the watchdog on orderly shutdown where supported
    fn disarm(&self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Linux watchdog character device (`/dev/watchdog`)
pub struct DeviceWatchdog {
    file: Mutex<File>,
}

impl DeviceWatchdog {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().write(true).open(path)?;
        info!(path = %path.display(), "hardware watchdog armed");
        Ok(Self { file: Mutex::new(file) })
    }
}

impl Watchdog for DeviceWatchdog {
    fn feed(&self) -> std::io::Result<()> {
        let mut file = self.file.lock();
        file.write_all(b"\0")?;
        file.flush()
    }

    /// Magic close: writing `V` before closing stops the timer
    fn disarm(&self) -> std::io::Result<()> {
        let mut file = self.file.lock();
        file.write_all(b"V")?;
        file.flush()?;
        warn!("hardware watchdog disarmed");
        Ok(())
    }
}

/// Counts feeds; used where no hardware watchdog exists
#[derive(Debug, Default)]
pub struct NullWatchdog {
    feeds: AtomicU64,
}

impl NullWatchdog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feeds(&self) -> u64 {
        self.feeds.load(Ordering::Relaxed)
    }
}

impl Watchdog for NullWatchdog {
    fn feed(&self) -> std::io::Result<()> {
        self.feeds.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
