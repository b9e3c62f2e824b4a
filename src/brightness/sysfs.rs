//! Plain-text sysfs nodes of the panel backlight device.

use std::fmt::Display;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, Instant};

use tracing::{trace, warn};

use crate::error::{HwcError, Result};

fn no_resources(path: &Path, source: io::Error) -> HwcError {
    HwcError::NoResources {
        path: path.display().to_string(),
        source,
    }
}

/// A writable sysfs attribute.
///
/// Every write opens the node afresh, so a failed write never wedges later ones.
#[derive(Debug, Clone)]
pub struct SysfsNode {
    path: PathBuf,
}

impl SysfsNode {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn write_value(&self, value: impl Display) -> Result<()> {
        let _span = tracy_client::span!("SysfsNode::write_value");

        let text = value.to_string();
        let res = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.path)
            .and_then(|mut file| file.write_all(text.as_bytes()));

        match res {
            Ok(()) => {
                trace!("wrote {text} to {:?}", self.path);
                Ok(())
            }
            Err(err) => {
                warn!("error writing {text} to {:?}: {err}", self.path);
                Err(no_resources(&self.path, err))
            }
        }
    }

    pub fn read_value<T: FromStr>(&self) -> Result<T> {
        let text = fs::read_to_string(&self.path).map_err(|err| no_resources(&self.path, err))?;
        text.trim().parse().map_err(|_| {
            HwcError::BadValue(format!("unexpected {:?} in {:?}", text.trim(), self.path))
        })
    }
}

fn read_from_start(file: &mut File, buf: &mut String) -> io::Result<()> {
    buf.clear();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_string(buf)?;
    Ok(())
}

/// Waits until the node at `path` reads as one of `expected`.
///
/// The node is re-read whenever the kernel signals it with `POLLPRI`, and once more when
/// `timeout` runs out.
pub fn check_sysfs_status(path: &Path, expected: &[&str], timeout: Duration) -> Result<()> {
    let _span = tracy_client::span!("check_sysfs_status");

    let mut file = File::open(path).map_err(|err| no_resources(path, err))?;
    let deadline = Instant::now() + timeout;
    let mut buf = String::new();

    loop {
        read_from_start(&mut file, &mut buf).map_err(|err| no_resources(path, err))?;
        let status = buf.trim();
        if expected.contains(&status) {
            return Ok(());
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            warn!("{path:?} is {status:?} after {timeout:?}, expected one of {expected:?}");
            return Err(HwcError::TimedOut("sysfs status"));
        }

        let mut pfd = libc::pollfd {
            fd: file.as_raw_fd(),
            events: libc::POLLPRI,
            revents: 0,
        };
        let timeout_ms = remaining.as_millis().clamp(1, i32::MAX as u128) as i32;
        // SAFETY: pfd points to one valid pollfd for the duration of the call.
        let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(no_resources(path, err));
            }
        }
    }
}
