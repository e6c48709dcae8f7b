//! The device table.
//!
//! A fixed-capacity, minor-indexed table of device bindings. Each binding
//! ties a minor to one handler instance with a configuration string, carries
//! the device geometry and the handler's opaque state, and owns the optional
//! worker pool commands are dispatched on.

use std::any::Any;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};

use crate::error::{Error, Result};
use crate::handler::Handler;
use crate::registry::HandlerRegistry;
use crate::worker::WorkerPool;

/// Device table capacity; minors are `0..MAX_DEVICES`.
pub const MAX_DEVICES: usize = 256;

/// Upper bound on an accepted cfgstring, terminator included.
pub const CFGSTRING_MAX: usize = 2048;

const DEFAULT_BLOCK_SIZE: u32 = 4096;
const DEFAULT_NUM_LBAS: u64 = 262_144;
const DEFAULT_MAX_XFER_LEN: u32 = 1024 * 1024;

/// Split a cfgstring of the shape `/<subtype>/<backend-specific>` into the
/// subtype (the leading alphanumeric run) and the backend-specific body.
pub fn split_cfgstring(cfg: &str) -> Option<(&str, &str)> {
    let rest = cfg.strip_prefix('/')?;
    let end = rest
        .find(|c: char| !c.is_ascii_alphanumeric())
        .unwrap_or(rest.len());
    if end == 0 {
        return None;
    }
    let (subtype, body) = rest.split_at(end);
    Some((subtype, body.strip_prefix('/').unwrap_or(body)))
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("minor", &self.minor)
            .field("name", &self.name)
            .field("subtype", &self.subtype)
            .finish()
    }
}

/// One live device binding.
pub struct Device {
    minor: u16,
    name: String,
    subtype: String,
    handler: Arc<dyn Handler>,
    cfg_orig: String,
    cfg: Mutex<String>,
    num_lbas: AtomicU64,
    block_size: AtomicU32,
    max_xfer_len: AtomicU32,
    private: RwLock<Option<Arc<dyn Any + Send + Sync>>>,
    worker: Option<WorkerPool>,
    refs: AtomicU32,
    nsubmit: AtomicU64,
    ncomplete: AtomicU64,
}

impl Device {
    /// The minor this binding occupies.
    pub fn minor(&self) -> u16 {
        self.minor
    }

    /// The device name shown under `/dev`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Subtype of the bound handler.
    pub fn subtype(&self) -> &str {
        &self.subtype
    }

    /// The bound handler.
    pub fn handler(&self) -> &Arc<dyn Handler> {
        &self.handler
    }

    /// The working copy of the cfgstring.
    pub fn cfg(&self) -> String {
        self.cfg.lock().clone()
    }

    /// Replace the working copy; the original is untouched.
    pub fn set_cfg(&self, cfg: String) {
        *self.cfg.lock() = cfg;
    }

    /// Backend-specific part of the working cfgstring.
    pub fn cfg_body(&self) -> String {
        let cfg = self.cfg.lock();
        split_cfgstring(&cfg)
            .map(|(_, body)| body.to_string())
            .unwrap_or_default()
    }

    fn restore_cfg(&self) {
        *self.cfg.lock() = self.cfg_orig.clone();
    }

    /// Addressable blocks.
    pub fn num_lbas(&self) -> u64 {
        self.num_lbas.load(Ordering::Acquire)
    }

    /// Set the number of addressable blocks; handlers call this from `open`.
    pub fn set_num_lbas(&self, num_lbas: u64) {
        self.num_lbas.store(num_lbas, Ordering::Release);
    }

    /// Block size in bytes.
    pub fn block_size(&self) -> u32 {
        self.block_size.load(Ordering::Acquire)
    }

    /// Set the block size; handlers call this from `open`.
    pub fn set_block_size(&self, block_size: u32) {
        self.block_size.store(block_size, Ordering::Release);
    }

    /// Largest transfer accepted, in bytes.
    pub fn max_xfer_len(&self) -> u32 {
        self.max_xfer_len.load(Ordering::Acquire)
    }

    /// Set the transfer limit; handlers call this from `open`.
    pub fn set_max_xfer_len(&self, max_xfer_len: u32) {
        self.max_xfer_len.store(max_xfer_len, Ordering::Release);
    }

    /// Device size in bytes.
    pub fn size(&self) -> u64 {
        self.num_lbas() * u64::from(self.block_size())
    }

    /// Stash handler state on the binding.
    pub fn set_private<T: Any + Send + Sync>(&self, value: T) {
        *self.private.write() = Some(Arc::new(value));
    }

    /// Retrieve handler state stashed by [`Device::set_private`].
    pub fn private<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let guard = self.private.read();
        guard.clone()?.downcast::<T>().ok()
    }

    /// Drop handler state.
    pub fn clear_private(&self) {
        *self.private.write() = None;
    }

    /// Take a hold on the device.
    pub fn hold(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Release a hold.
    pub fn unhold(&self) {
        let prev = self.refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unbalanced device hold");
    }

    /// Outstanding holds.
    pub fn holds(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    pub(crate) fn note_submit(&self) {
        self.nsubmit.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn note_complete(&self) {
        self.ncomplete.fetch_add(1, Ordering::AcqRel);
    }

    /// Lifetime submit/complete counters. The reads are unsynchronized with
    /// each other and suit diagnostics only.
    pub fn counters(&self) -> (u64, u64) {
        (
            self.nsubmit.load(Ordering::Acquire),
            self.ncomplete.load(Ordering::Acquire),
        )
    }

    /// Commands submitted but not yet completed.
    pub fn queue_depth(&self) -> u64 {
        let (submitted, completed) = self.counters();
        submitted.saturating_sub(completed)
    }

    pub(crate) fn worker(&self) -> Option<&WorkerPool> {
        self.worker.as_ref()
    }
}

/// Slot-indexed table of device bindings.
pub struct DeviceTable {
    registry: Arc<HandlerRegistry>,
    slots: Mutex<Vec<Option<Arc<Device>>>>,
}

impl DeviceTable {
    /// An empty table resolving subtypes through `registry`.
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        let mut slots = Vec::with_capacity(MAX_DEVICES);
        slots.resize_with(MAX_DEVICES, || None);
        DeviceTable {
            registry,
            slots: Mutex::new(slots),
        }
    }

    /// Validate a cfgstring's shape and delegate to the named handler's own
    /// check, returning the handler on success.
    pub fn check_config(&self, cfg: &str) -> Result<Arc<dyn Handler>> {
        if cfg.len() >= CFGSTRING_MAX || !cfg.starts_with('/') {
            return Err(Error::Invalid);
        }
        let (subtype, _) = split_cfgstring(cfg).ok_or(Error::Invalid)?;
        let handler = self.registry.find(subtype).ok_or(Error::NoEnt)?;
        handler.check_config(cfg).map_err(Error::BadConfig)?;
        Ok(handler)
    }

    /// Bind `minor` to the handler named by `cfg`.
    ///
    /// The default geometry (4 KiB blocks, 262144 LBAs, 1 MiB transfers) is
    /// in place before the handler's `open` runs; whatever `open` leaves
    /// behind must still satisfy the geometry invariants.
    pub fn add(&self, minor: u16, devname: Option<&str>, cfg: &str) -> Result<Arc<Device>> {
        if minor as usize >= MAX_DEVICES {
            return Err(Error::NoDevice);
        }
        let mut slots = self.slots.lock();
        if slots[minor as usize].is_some() {
            return Err(Error::Busy);
        }
        let handler = self.check_config(cfg)?;
        let subtype = handler.subtype().to_string();
        let name = match devname {
            Some(n) => n.to_string(),
            None => format!("{}{:03}", subtype, minor),
        };
        if slots
            .iter()
            .flatten()
            .any(|d| d.name == name)
        {
            return Err(Error::Exists);
        }
        let worker = match handler.nr_threads() {
            0 => None,
            n => Some(WorkerPool::spawn(&name, n)?),
        };
        let dev = Arc::new(Device {
            minor,
            name,
            subtype,
            handler: handler.clone(),
            cfg_orig: cfg.to_string(),
            cfg: Mutex::new(cfg.to_string()),
            num_lbas: AtomicU64::new(DEFAULT_NUM_LBAS),
            block_size: AtomicU32::new(DEFAULT_BLOCK_SIZE),
            max_xfer_len: AtomicU32::new(DEFAULT_MAX_XFER_LEN),
            private: RwLock::new(None),
            worker,
            refs: AtomicU32::new(0),
            nsubmit: AtomicU64::new(0),
            ncomplete: AtomicU64::new(0),
        });
        handler.open(&dev, false)?;
        // Handlers may tokenize the working copy in place; put it back.
        dev.restore_cfg();
        if let Err(e) = check_geometry(&dev) {
            handler.close(&dev);
            return Err(e);
        }
        info!(
            "device {} bound: minor {} handler {} size {}",
            dev.name(),
            minor,
            dev.subtype(),
            dev.size()
        );
        slots[minor as usize] = Some(dev.clone());
        Ok(dev)
    }

    /// Unbind `minor`. Fails with `no-device` for an unused minor and `busy`
    /// while holds remain.
    pub fn remove(&self, minor: u16) -> Result<()> {
        let mut slots = self.slots.lock();
        let slot = slots
            .get_mut(minor as usize)
            .ok_or(Error::NoDevice)?;
        let dev = slot.as_ref().ok_or(Error::NoDevice)?;
        if dev.holds() > 0 {
            debug!("remove of minor {} refused: {} holds", minor, dev.holds());
            return Err(Error::Busy);
        }
        if dev.queue_depth() > 0 {
            return Err(Error::Busy);
        }
        let dev = slot.take().unwrap();
        drop(slots);
        dev.handler.close(&dev);
        dev.clear_private();
        info!("device {} (minor {}) removed", dev.name(), minor);
        Ok(())
    }

    /// The binding at `minor`.
    pub fn get(&self, minor: u16) -> Result<Arc<Device>> {
        let slots = self.slots.lock();
        slots
            .get(minor as usize)
            .and_then(|s| s.clone())
            .ok_or(Error::NoDevice)
    }

    /// Resolve a devname to its minor, taking a hold on the device.
    pub fn open(&self, devname: &str) -> Result<u16> {
        let slots = self.slots.lock();
        let dev = slots
            .iter()
            .flatten()
            .find(|d| d.name == devname)
            .ok_or(Error::NoDevice)?;
        dev.hold();
        Ok(dev.minor)
    }

    /// Release a hold taken by [`DeviceTable::open`].
    pub fn close(&self, minor: u16) -> Result<()> {
        self.get(minor)?.unhold();
        Ok(())
    }

    /// Device size in bytes, or `no-device`.
    pub fn size_of(&self, minor: u16) -> Result<u64> {
        Ok(self.get(minor)?.size())
    }

    /// Block size in bytes, or `no-device`.
    pub fn block_size_of(&self, minor: u16) -> Result<u32> {
        Ok(self.get(minor)?.block_size())
    }

    /// Transfer limit in bytes, or `no-device`.
    pub fn max_xfer_of(&self, minor: u16) -> Result<u32> {
        Ok(self.get(minor)?.max_xfer_len())
    }

    /// Device name, or `no-device`.
    pub fn name_of(&self, minor: u16) -> Result<String> {
        Ok(self.get(minor)?.name().to_string())
    }

    /// How many bindings use the given subtype.
    pub fn bound_count(&self, subtype: &str) -> usize {
        let slots = self.slots.lock();
        slots
            .iter()
            .flatten()
            .filter(|d| d.subtype == subtype)
            .count()
    }

    /// Minors currently bound, ascending.
    pub fn minors(&self) -> Vec<u16> {
        let slots = self.slots.lock();
        slots.iter().flatten().map(|d| d.minor).collect()
    }
}

fn check_geometry(dev: &Device) -> Result<()> {
    let block_size = dev.block_size();
    if dev.num_lbas() == 0 || block_size == 0 || !block_size.is_power_of_two() {
        warn!("handler left invalid geometry on {}", dev.name());
        return Err(Error::Invalid);
    }
    if dev.max_xfer_len() == 0 || dev.max_xfer_len() % block_size != 0 {
        warn!("handler left invalid transfer limit on {}", dev.name());
        return Err(Error::Invalid);
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn table() -> DeviceTable {
        let registry = Arc::new(HandlerRegistry::new("/nonexistent/handler_"));
        registry.load("ram").unwrap();
        DeviceTable::new(registry)
    }

    #[test]
    fn split_cfgstring_shapes() {
        assert_eq!(split_cfgstring("/ram/@"), Some(("ram", "@")));
        assert_eq!(split_cfgstring("/file/tmpfile"), Some(("file", "tmpfile")));
        assert_eq!(
            split_cfgstring("/file//abs/path"),
            Some(("file", "/abs/path"))
        );
        assert_eq!(split_cfgstring("/ram"), Some(("ram", "")));
        assert_eq!(split_cfgstring("ram/@"), None);
        assert_eq!(split_cfgstring("//"), None);
    }

    #[test]
    fn add_applies_defaults_and_devname() {
        let t = table();
        let dev = t.add(0, None, "/ram/@").unwrap();
        assert_eq!(dev.name(), "ram000");
        assert_eq!(dev.block_size(), 4096);
        assert_eq!(dev.num_lbas(), 262_144);
        assert_eq!(dev.max_xfer_len(), 1024 * 1024);
        assert_eq!(dev.size(), 1 << 30);
        assert_eq!(dev.cfg(), "/ram/@");
    }

    #[test]
    fn add_checks_minor_and_subtype() {
        let t = table();
        assert_eq!(
            t.add(MAX_DEVICES as u16, None, "/ram/@").unwrap_err(),
            Error::NoDevice
        );
        assert_eq!(t.add(1, None, "/zzz/@").unwrap_err(), Error::NoEnt);
        assert_eq!(t.add(1, None, "ram/@").unwrap_err(), Error::Invalid);
        t.add(1, None, "/ram/@").unwrap();
        assert_eq!(t.add(1, None, "/ram/@").unwrap_err(), Error::Busy);
        assert_eq!(
            t.add(2, Some("ram001"), "/ram/@").unwrap_err(),
            Error::Exists
        );
    }

    #[test]
    fn remove_respects_holds() {
        let t = table();
        t.add(0, None, "/ram/@").unwrap();
        let minor = t.open("ram000").unwrap();
        assert_eq!(minor, 0);
        assert_eq!(t.remove(0), Err(Error::Busy));
        t.close(0).unwrap();
        t.remove(0).unwrap();
        assert_eq!(t.remove(0), Err(Error::NoDevice));
        assert_eq!(t.get(0).unwrap_err(), Error::NoDevice);
    }

    #[test]
    fn geometry_accessors_need_a_binding() {
        let t = table();
        assert_eq!(t.size_of(0), Err(Error::NoDevice));
        t.add(0, None, "/ram/@").unwrap();
        assert_eq!(t.size_of(0).unwrap(), 1 << 30);
        assert_eq!(t.block_size_of(0).unwrap(), 4096);
        assert_eq!(t.max_xfer_of(0).unwrap(), 1024 * 1024);
        assert_eq!(t.name_of(0).unwrap(), "ram000");
    }

    #[test]
    fn bound_count_tracks_subtype() {
        let t = table();
        assert_eq!(t.bound_count("ram"), 0);
        t.add(0, None, "/ram/@").unwrap();
        t.add(7, None, "/ram/@").unwrap();
        assert_eq!(t.bound_count("ram"), 2);
        assert_eq!(t.minors(), vec![0, 7]);
        t.remove(7).unwrap();
        assert_eq!(t.bound_count("ram"), 1);
    }

    #[test]
    fn cfgstring_length_is_bounded() {
        let t = table();
        let long = format!("/ram/{}", "x".repeat(CFGSTRING_MAX));
        assert_eq!(t.add(0, None, &long).unwrap_err(), Error::Invalid);
    }
}
