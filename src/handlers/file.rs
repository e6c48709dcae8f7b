//! The file-backed handler.
//!
//! Stores device blocks in an ordinary file named by the cfg body, created
//! on demand. An existing non-empty file dictates the device size. I/O is
//! positional and the file grows as blocks past its end are written, so a
//! freshly written region leaves a file just large enough to cover it.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::Arc;

use log::warn;

use crate::device::Device;
use crate::error::{Error, Result};
use crate::handler::{CmdStatus, Handler, HandlerRegistrar, SgList};

/// Module entry point; registers the file handler.
pub fn handler_init(reg: &dyn HandlerRegistrar) -> i32 {
    match reg.register(Arc::new(FileHandler)) {
        Ok(()) => 0,
        Err(e) => -e.errno(),
    }
}

struct FileStore {
    file: File,
    path: PathBuf,
}

/// Handler for the `file` subtype.
pub struct FileHandler;

impl Handler for FileHandler {
    fn subtype(&self) -> &str {
        "file"
    }

    fn name(&self) -> &str {
        "file-backed store"
    }

    fn nr_threads(&self) -> usize {
        1
    }

    fn has_flush(&self) -> bool {
        true
    }

    fn check_config(&self, cfg: &str) -> Result<(), String> {
        match crate::device::split_cfgstring(cfg) {
            Some((_, body)) if !body.is_empty() => Ok(()),
            _ => Err("missing backing file path".to_string()),
        }
    }

    fn open(&self, dev: &Device, _reopen: bool) -> Result<()> {
        let path = PathBuf::from(dev.cfg_body());
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| {
                warn!("cannot open backing file {}: {}", path.display(), e);
                Error::Io
            })?;
        let len = file.metadata().map_err(|_| Error::Io)?.len();
        if len > 0 {
            let bs = u64::from(dev.block_size());
            dev.set_num_lbas(len.div_ceil(bs));
        }
        dev.set_private(FileStore { file, path });
        Ok(())
    }

    fn close(&self, dev: &Device) {
        if let Some(store) = dev.private::<FileStore>() {
            if let Err(e) = store.file.sync_all() {
                warn!("sync of {} failed on close: {}", store.path.display(), e);
            }
        }
        dev.clear_private();
    }

    fn read(&self, dev: &Device, sg: &mut SgList, offset: u64) -> CmdStatus {
        let Some(store) = dev.private::<FileStore>() else {
            return CmdStatus::ReadErr;
        };
        let mut pos = offset;
        for seg in sg.segments_mut() {
            // Regions inside the device but past the backing file's end are
            // unwritten blocks and read as zeroes.
            let mut done = 0;
            while done < seg.len() {
                match store.file.read_at(&mut seg[done..], pos + done as u64) {
                    Ok(0) => {
                        seg[done..].fill(0);
                        break;
                    }
                    Ok(n) => done += n,
                    Err(e) => {
                        warn!("read from {} failed: {}", store.path.display(), e);
                        return CmdStatus::ReadErr;
                    }
                }
            }
            pos += seg.len() as u64;
        }
        CmdStatus::Ok
    }

    fn write(&self, dev: &Device, sg: &SgList, offset: u64) -> CmdStatus {
        let Some(store) = dev.private::<FileStore>() else {
            return CmdStatus::WriteErr;
        };
        let mut pos = offset;
        for seg in sg.segments() {
            if let Err(e) = store.file.write_all_at(seg, pos) {
                warn!("write to {} failed: {}", store.path.display(), e);
                return CmdStatus::WriteErr;
            }
            pos += seg.len() as u64;
        }
        CmdStatus::Ok
    }

    fn flush(&self, dev: &Device) -> CmdStatus {
        match dev.private::<FileStore>() {
            Some(store) => match store.file.sync_data() {
                Ok(()) => CmdStatus::Ok,
                Err(e) => {
                    warn!("flush of {} failed: {}", store.path.display(), e);
                    CmdStatus::WriteErr
                }
            },
            None => CmdStatus::WriteErr,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::device::DeviceTable;
    use crate::registry::HandlerRegistry;

    fn table() -> DeviceTable {
        let registry = Arc::new(HandlerRegistry::new("/nonexistent/handler_"));
        registry.load("file").unwrap();
        DeviceTable::new(registry)
    }

    #[test]
    fn config_requires_path() {
        let h = FileHandler;
        assert!(h.check_config("/file/backing").is_ok());
        assert!(h.check_config("/file").is_err());
        assert!(h.check_config("/file/").is_err());
    }

    #[test]
    fn existing_file_sets_geometry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backing");
        std::fs::write(&path, vec![9u8; 3 * 4096]).unwrap();
        let t = table();
        let dev = t
            .add(0, None, &format!("/file/{}", path.display()))
            .unwrap();
        assert_eq!(dev.num_lbas(), 3);
        assert_eq!(dev.size(), 3 * 4096);
        t.remove(0).unwrap();
    }

    #[test]
    fn writes_grow_the_backing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backing");
        let t = table();
        let dev = t
            .add(3, None, &format!("/file/{}", path.display()))
            .unwrap();
        assert_eq!(dev.name(), "file003");

        let h = FileHandler;
        let mut sg = SgList::from_vec(vec![0u8; 4096]);
        assert!(h.write(&dev, &sg, 8192).is_ok());
        assert!(h.flush(&dev).is_ok());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 12288);

        // unwritten leading blocks read back as zeroes, written data intact
        let mut readback = SgList::with_len(12288);
        assert!(h.read(&dev, &mut readback, 0).is_ok());
        let data = readback.into_contiguous();
        assert!(data.iter().all(|b| *b == 0));

        sg = SgList::from_vec(vec![0xA5u8; 512]);
        assert!(h.write(&dev, &sg, 0).is_ok());
        let mut readback = SgList::with_len(512);
        assert!(h.read(&dev, &mut readback, 0).is_ok());
        assert_eq!(readback.into_contiguous(), vec![0xA5u8; 512]);

        t.remove(3).unwrap();
    }
}
