//! The ramdisk handler.
//!
//! A sparse, block-indexed in-memory store: blocks never written read back
//! as zeroes and cost nothing. The cfg body is `@` (or empty) for the
//! default geometry, or a size such as `64m`, `2g`, `4096`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::device::Device;
use crate::error::Result;
use crate::handler::{CmdStatus, Handler, HandlerRegistrar, SgList};

/// Module entry point; registers the ramdisk handler.
pub fn handler_init(reg: &dyn HandlerRegistrar) -> i32 {
    match reg.register(Arc::new(RamHandler)) {
        Ok(()) => 0,
        Err(e) => -e.errno(),
    }
}

/// Parse the cfg body: `@` or empty keeps the defaults; otherwise a decimal
/// byte count with an optional `k`/`m`/`g` suffix.
fn parse_size(body: &str) -> Result<Option<u64>, String> {
    if body.is_empty() || body == "@" {
        return Ok(None);
    }
    let (digits, shift) = match body.as_bytes().last().map(u8::to_ascii_lowercase) {
        Some(b'k') => (&body[..body.len() - 1], 10),
        Some(b'm') => (&body[..body.len() - 1], 20),
        Some(b'g') => (&body[..body.len() - 1], 30),
        _ => (body, 0),
    };
    let n: u64 = digits
        .parse()
        .map_err(|_| format!("unparseable ramdisk size {:?}", body))?;
    n.checked_shl(shift)
        .filter(|bytes| *bytes > 0)
        .map(Some)
        .ok_or_else(|| format!("ramdisk size {:?} out of range", body))
}

struct RamStore {
    block_size: usize,
    blocks: Mutex<HashMap<u64, Box<[u8]>>>,
}

impl RamStore {
    fn read(&self, buf: &mut [u8], off: u64) {
        let bs = self.block_size;
        let blocks = self.blocks.lock();
        let mut done = 0;
        while done < buf.len() {
            let pos = off + done as u64;
            let idx = pos / bs as u64;
            let within = (pos % bs as u64) as usize;
            let n = (buf.len() - done).min(bs - within);
            match blocks.get(&idx) {
                Some(block) => buf[done..done + n].copy_from_slice(&block[within..within + n]),
                None => buf[done..done + n].fill(0),
            }
            done += n;
        }
    }

    fn write(&self, data: &[u8], off: u64) {
        let bs = self.block_size;
        let mut blocks = self.blocks.lock();
        let mut done = 0;
        while done < data.len() {
            let pos = off + done as u64;
            let idx = pos / bs as u64;
            let within = (pos % bs as u64) as usize;
            let n = (data.len() - done).min(bs - within);
            let block = blocks
                .entry(idx)
                .or_insert_with(|| vec![0u8; bs].into_boxed_slice());
            block[within..within + n].copy_from_slice(&data[done..done + n]);
            done += n;
        }
    }
}

/// Handler for the `ram` subtype.
pub struct RamHandler;

impl Handler for RamHandler {
    fn subtype(&self) -> &str {
        "ram"
    }

    fn name(&self) -> &str {
        "in-memory ramdisk"
    }

    fn check_config(&self, cfg: &str) -> Result<(), String> {
        let body = crate::device::split_cfgstring(cfg)
            .map(|(_, body)| body)
            .unwrap_or("");
        parse_size(body).map(|_| ())
    }

    fn open(&self, dev: &Device, _reopen: bool) -> Result<()> {
        if let Some(bytes) = parse_size(&dev.cfg_body()).unwrap_or(None) {
            let bs = u64::from(dev.block_size());
            dev.set_num_lbas(bytes.div_ceil(bs).max(1));
        }
        dev.set_private(RamStore {
            block_size: dev.block_size() as usize,
            blocks: Mutex::new(HashMap::new()),
        });
        Ok(())
    }

    fn close(&self, dev: &Device) {
        dev.clear_private();
    }

    fn read(&self, dev: &Device, sg: &mut SgList, mut offset: u64) -> CmdStatus {
        let Some(store) = dev.private::<RamStore>() else {
            return CmdStatus::ReadErr;
        };
        for seg in sg.segments_mut() {
            store.read(seg, offset);
            offset += seg.len() as u64;
        }
        CmdStatus::Ok
    }

    fn write(&self, dev: &Device, sg: &SgList, mut offset: u64) -> CmdStatus {
        let Some(store) = dev.private::<RamStore>() else {
            return CmdStatus::WriteErr;
        };
        for seg in sg.segments() {
            store.write(seg, offset);
            offset += seg.len() as u64;
        }
        CmdStatus::Ok
    }
}
