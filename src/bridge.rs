//! The I/O bridge.
//!
//! Translates synchronous filesystem reads/writes/fsyncs into the handler
//! command model and back. A submitted command either runs inline on the
//! caller's thread or is enqueued on the device's worker pool; the
//! completion callback fires exactly once either way. The bridge-initiated
//! blocking path parks the caller on a single-shot completion and turns a
//! non-OK status into an I/O error.

use std::sync::Arc;
use std::time::Instant;

use log::{debug, warn};

use crate::device::{Device, DeviceTable};
use crate::error::{Error, Result};
use crate::handler::{CmdKind, CmdStatus, Command, SgList};
use crate::sync::Completion;
use crate::tree::FileOps;

/// Completion callback for a submitted command.
pub type DoneFn = Box<dyn FnOnce(Command, CmdStatus) + Send>;

/// The synchronous-over-asynchronous translator.
pub struct IoBridge {
    devices: Arc<DeviceTable>,
}

impl IoBridge {
    /// A bridge resolving minors through `devices`.
    pub fn new(devices: Arc<DeviceTable>) -> Self {
        IoBridge { devices }
    }

    /// The device table the bridge resolves minors against.
    pub fn devices(&self) -> &Arc<DeviceTable> {
        &self.devices
    }

    fn precheck(dev: &Device, kind: CmdKind, nbyte: usize, seekpos: u64) -> Result<()> {
        match kind {
            CmdKind::Read if !dev.handler().can_read() => return Err(Error::NoEnt),
            CmdKind::Write if !dev.handler().can_write() => return Err(Error::NoEnt),
            CmdKind::Flush => return Ok(()),
            _ => {}
        }
        let size = dev.size();
        let end = seekpos
            .checked_add(nbyte as u64)
            .ok_or(Error::Invalid)?;
        if seekpos >= size || end > size {
            return Err(Error::Invalid);
        }
        Ok(())
    }

    /// Submit a command. Returns as soon as the command is accepted; the
    /// pre-checks are the only errors reported here, everything later
    /// arrives through `done`.
    pub fn submit(&self, dev: &Arc<Device>, cmd: Command, done: DoneFn) -> Result<()> {
        Self::precheck(dev, cmd.kind, cmd.sg.total_len(), cmd.offset)?;
        dev.note_submit();
        debug!(
            "submit {:?} minor={} off={} len={} qd={}",
            cmd.kind,
            dev.minor(),
            cmd.offset,
            cmd.sg.total_len(),
            dev.queue_depth()
        );
        // A handler without flush support still flushes successfully; the
        // command never reaches it.
        if cmd.kind == CmdKind::Flush && !dev.handler().has_flush() {
            Self::complete(dev, cmd, CmdStatus::Ok, done);
            return Ok(());
        }
        match dev.worker() {
            Some(pool) => {
                let dev = dev.clone();
                pool.submit(Box::new(move || {
                    let mut cmd = cmd;
                    let status = Self::execute(&dev, &mut cmd);
                    Self::complete(&dev, cmd, status, done);
                }));
            }
            None => {
                let mut cmd = cmd;
                let status = Self::execute(dev, &mut cmd);
                Self::complete(dev, cmd, status, done);
            }
        }
        Ok(())
    }

    fn execute(dev: &Device, cmd: &mut Command) -> CmdStatus {
        let handler = dev.handler();
        match cmd.kind {
            CmdKind::Read => handler.read(dev, &mut cmd.sg, cmd.offset),
            CmdKind::Write => handler.write(dev, &cmd.sg, cmd.offset),
            CmdKind::Flush => handler.flush(dev),
        }
    }

    fn complete(dev: &Device, cmd: Command, status: CmdStatus, done: DoneFn) {
        dev.note_complete();
        if !status.is_ok() {
            warn!(
                "minor {} {:?} failed with {:?}",
                dev.minor(),
                cmd.kind,
                status
            );
        }
        done(cmd, status);
    }

    fn run_sync(&self, dev: &Arc<Device>, cmd: Command) -> Result<(Command, CmdStatus)> {
        let completion = Arc::new(Completion::new());
        let signal = completion.clone();
        let started = Instant::now();
        self.submit(
            dev,
            cmd,
            Box::new(move |cmd, status| signal.signal((cmd, status))),
        )?;
        let (cmd, status) = completion.wait();
        debug!(
            "minor {} {:?} completed in {:?}",
            dev.minor(),
            cmd.kind,
            started.elapsed()
        );
        Ok((cmd, status))
    }

    /// Blocking read of `size` bytes at `seekpos`.
    pub fn read(&self, minor: u16, size: usize, seekpos: u64) -> Result<Vec<u8>> {
        let dev = self.devices.get(minor)?;
        let cmd = Command {
            kind: CmdKind::Read,
            offset: seekpos,
            sg: SgList::with_len(size),
        };
        let (cmd, status) = self.run_sync(&dev, cmd)?;
        if status.is_ok() {
            Ok(cmd.sg.into_contiguous())
        } else {
            Err(Error::Io)
        }
    }

    /// Blocking write of `data` at `seekpos`, returning the bytes written.
    pub fn write(&self, minor: u16, data: &[u8], seekpos: u64) -> Result<usize> {
        let dev = self.devices.get(minor)?;
        let len = data.len();
        let cmd = Command {
            kind: CmdKind::Write,
            offset: seekpos,
            sg: SgList::from_vec(data.to_vec()),
        };
        let (_, status) = self.run_sync(&dev, cmd)?;
        if status.is_ok() {
            Ok(len)
        } else {
            Err(Error::Io)
        }
    }

    /// Blocking flush.
    pub fn flush(&self, minor: u16) -> Result<()> {
        let dev = self.devices.get(minor)?;
        let cmd = Command {
            kind: CmdKind::Flush,
            offset: 0,
            sg: SgList::from_segments(Vec::new()),
        };
        let (_, status) = self.run_sync(&dev, cmd)?;
        if status.is_ok() {
            Ok(())
        } else {
            Err(Error::Io)
        }
    }
}

/// Ops vector installed on `/dev/<devname>` nodes; the embedded minor is
/// the node's private payload.
pub struct DeviceFileOps {
    minor: u16,
    devices: Arc<DeviceTable>,
    bridge: Arc<IoBridge>,
}

impl DeviceFileOps {
    /// Ops for the device bound at `minor`.
    pub fn new(minor: u16, devices: Arc<DeviceTable>, bridge: Arc<IoBridge>) -> Self {
        DeviceFileOps {
            minor,
            devices,
            bridge,
        }
    }
}

impl FileOps for DeviceFileOps {
    fn open(&self) -> Result<()> {
        self.devices.get(self.minor)?.hold();
        Ok(())
    }

    fn release(&self) -> Result<()> {
        if let Ok(dev) = self.devices.get(self.minor) {
            dev.unhold();
        }
        Ok(())
    }

    fn read(&self, size: usize, offset: u64) -> Result<Vec<u8>> {
        // The filesystem surface has file semantics: reads at or past the
        // end return short instead of failing the strict bridge pre-check.
        let dev_size = self.devices.get(self.minor)?.size();
        if offset >= dev_size {
            return Ok(Vec::new());
        }
        let n = size.min((dev_size - offset) as usize);
        self.bridge.read(self.minor, n, offset)
    }

    fn write(&self, data: &[u8], offset: u64) -> Result<usize> {
        self.bridge.write(self.minor, data, offset)
    }

    fn fsync(&self, _datasync: bool) -> Result<()> {
        self.bridge.flush(self.minor)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::registry::HandlerRegistry;

    fn bridge_with_ram() -> (Arc<DeviceTable>, IoBridge) {
        let registry = Arc::new(HandlerRegistry::new("/nonexistent/handler_"));
        registry.load("ram").unwrap();
        let devices = Arc::new(DeviceTable::new(registry));
        devices.add(0, None, "/ram/@").unwrap();
        let bridge = IoBridge::new(devices.clone());
        (devices, bridge)
    }

    #[test]
    fn fresh_device_reads_zeroes() {
        let (_devices, bridge) = bridge_with_ram();
        let data = bridge.read(0, 4096, 0).unwrap();
        assert_eq!(data, vec![0u8; 4096]);
    }

    #[test]
    fn write_then_read_round_trips() {
        let (_devices, bridge) = bridge_with_ram();
        let pattern = vec![0xA5u8; 4096];
        assert_eq!(bridge.write(0, &pattern, 8192).unwrap(), 4096);
        assert_eq!(bridge.read(0, 4096, 8192).unwrap(), pattern);
        // neighbouring blocks stay zero
        assert_eq!(bridge.read(0, 4096, 4096).unwrap(), vec![0u8; 4096]);
    }

    #[test]
    fn bounds_are_enforced() {
        let (devices, bridge) = bridge_with_ram();
        let size = devices.get(0).unwrap().size();
        assert_eq!(bridge.read(0, 1, size).unwrap_err(), Error::Invalid);
        assert_eq!(bridge.write(0, &[0], size).unwrap_err(), Error::Invalid);
        assert_eq!(
            bridge.read(0, 4096, u64::MAX - 2048).unwrap_err(),
            Error::Invalid
        );
        assert_eq!(bridge.read(1, 4096, 0).unwrap_err(), Error::NoDevice);
    }

    #[test]
    fn flush_without_handler_support_succeeds() {
        let (devices, bridge) = bridge_with_ram();
        bridge.flush(0).unwrap();
        let (submitted, completed) = devices.get(0).unwrap().counters();
        assert_eq!(submitted, 1);
        assert_eq!(completed, 1);
    }

    #[test]
    fn counters_balance_after_io() {
        let (devices, bridge) = bridge_with_ram();
        for i in 0..8 {
            bridge.write(0, &[i as u8; 512], i as u64 * 4096).unwrap();
        }
        let dev = devices.get(0).unwrap();
        let (submitted, completed) = dev.counters();
        assert_eq!(submitted, 8);
        assert!(submitted >= completed);
        assert_eq!(dev.queue_depth(), 0);
    }

    #[test]
    fn device_file_ops_clamp_reads() {
        let (devices, bridge) = bridge_with_ram();
        let bridge = Arc::new(bridge);
        let ops = DeviceFileOps::new(0, devices.clone(), bridge);
        let size = devices.get(0).unwrap().size();
        assert!(ops.read(4096, size).unwrap().is_empty());
        assert_eq!(ops.read(4096, size - 1024).unwrap().len(), 1024);
        ops.open().unwrap();
        assert_eq!(devices.get(0).unwrap().holds(), 1);
        ops.release().unwrap();
        assert_eq!(devices.get(0).unwrap().holds(), 0);
    }
}
