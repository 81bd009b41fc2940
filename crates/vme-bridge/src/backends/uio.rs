//! Interrupt delivery through a UIO device
//!
//! The generic UIO driver exposes the bridge interrupt as `/dev/uioN`: a
//! 4-byte read returns the event count once the line has fired, and
//! writing `1` re-enables it.

use crate::error::{Result, VmeError};
use crate::platform::InterruptLine;
use rustix::event::{poll, PollFd, PollFlags};
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::time::Duration;

/// Shared interrupt line backed by `/dev/uioN`
#[derive(Debug)]
pub struct UioInterrupt {
    file: File,
}

impl UioInterrupt {
    /// Open a UIO device node
    ///
    /// # Errors
    ///
    /// Returns error if the node is missing or cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(VmeError::device_not_found(path));
        }
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let line = Self { file };
        line.unmask()?;
        tracing::info!("Interrupt line {} armed", path.display());
        Ok(line)
    }
}

impl InterruptLine for UioInterrupt {
    fn wait(&self, timeout: Duration) -> Result<bool> {
        let ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        let mut fds = [PollFd::new(&self.file, PollFlags::IN)];
        let ready = poll(&mut fds, ms).map_err(|e| VmeError::os("poll on UIO failed", e))?;
        if ready == 0 {
            return Ok(false);
        }

        let mut count = [0u8; 4];
        rustix::io::read(&self.file, &mut count)
            .map_err(|e| VmeError::os("UIO event read failed", e))?;
        tracing::trace!("UIO event #{}", u32::from_ne_bytes(count));
        Ok(true)
    }

    fn unmask(&self) -> Result<()> {
        rustix::io::write(&self.file, &1u32.to_ne_bytes())
            .map_err(|e| VmeError::os("UIO unmask failed", e))?;
        Ok(())
    }
}
