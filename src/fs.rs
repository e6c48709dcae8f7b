//! FUSE dispatch into the tree.
//!
//! [`GatewayFs`] is the filesystem handed to the kernel bridge. Every
//! operation resolves an inode to a tree node and forwards to that node's
//! ops vector; the tree itself is only mutated by the control channel.

use std::ffi::OsStr;
use std::time::{Duration, SystemTime};

use fuser::consts::{FOPEN_DIRECT_IO, FOPEN_NONSEEKABLE};
use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry,
    ReplyOpen, ReplyWrite, Request, TimeOrNow,
};
use log::debug;
use std::sync::Arc;

use crate::tree::{NodeInfo, NodeKind, Vft};

// Attributes are synthetic and cheap to produce; a zero TTL keeps the kernel
// from caching a stale size after control commands reshape the tree.
const TTL: Duration = Duration::ZERO;

/// The filesystem implementation mounted by the gateway binary.
pub struct GatewayFs {
    tree: Arc<Vft>,
    uid: u32,
    gid: u32,
}

impl GatewayFs {
    /// Wrap the tree for mounting.
    pub fn new(tree: Arc<Vft>) -> Self {
        GatewayFs {
            tree,
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
        }
    }

    fn attr_of(&self, info: &NodeInfo) -> FileAttr {
        // Block nodes are reported as regular files so the kernel does not
        // route their rdev to a host driver instead of this process.
        let (kind, nlink, perm) = match info.kind {
            NodeKind::Directory => (FileType::Directory, 2, info.mode as u16),
            NodeKind::Regular | NodeKind::Block => (FileType::RegularFile, 1, info.mode as u16),
        };
        let blksize = if info.block_size > 0 {
            info.block_size
        } else {
            512
        };
        FileAttr {
            ino: info.id,
            size: info.size,
            blocks: info.size.div_ceil(512),
            atime: info.atime,
            mtime: info.mtime,
            ctime: info.ctime,
            crtime: info.ctime,
            kind,
            perm,
            nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: info.rdev,
            blksize,
            flags: 0,
        }
    }
}

impl Filesystem for GatewayFs {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(name) = name.to_str() else {
            reply.error(libc::ENOENT);
            return;
        };
        match self
            .tree
            .child_by_name(parent, name)
            .and_then(|id| self.tree.info(id))
        {
            Some(info) => reply.entry(&TTL, &self.attr_of(&info), 0),
            None => reply.error(libc::ENOENT),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.tree.info(ino) {
            Some(info) => reply.attr(&TTL, &self.attr_of(&info)),
            None => reply.error(libc::ENOENT),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        _size: Option<u64>,
        _atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        // Size changes are ignored: node sizes are owned by the control
        // channel, and truncation on open must not fail shell redirection.
        if let Some(mode) = mode {
            if let Err(e) = self.tree.update_mode(ino, mode) {
                reply.error(e.errno());
                return;
            }
        }
        if mtime.is_some() {
            let _ = self.tree.update_mtime(ino);
        }
        match self.tree.info(ino) {
            Some(info) => reply.attr(&TTL, &self.attr_of(&info)),
            None => reply.error(libc::ENOENT),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let (kind, ops) = match self.tree.open_node(ino) {
            Ok(v) => v,
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        };
        if kind == NodeKind::Directory {
            self.tree.release_node(ino);
            reply.error(libc::EISDIR);
            return;
        }
        if let Some(ops) = &ops {
            if let Err(e) = ops.open() {
                self.tree.release_node(ino);
                reply.error(e.errno());
                return;
            }
        }
        // Non-block nodes have sizes the kernel cannot trust (the control
        // node's dump changes under it), so force direct unbuffered I/O.
        let flags = match kind {
            NodeKind::Block => 0,
            _ => FOPEN_DIRECT_IO | FOPEN_NONSEEKABLE,
        };
        debug!("open ino={} kind={:?}", ino, kind);
        reply.opened(ino, flags);
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        match self
            .tree
            .ops_of(ino)
            .and_then(|ops| ops.read(size as usize, offset as u64))
        {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        match self
            .tree
            .ops_of(ino)
            .and_then(|ops| ops.write(data, offset as u64))
        {
            Ok(n) => reply.written(n as u32),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, datasync: bool, reply: ReplyEmpty) {
        match self.tree.ops_of(ino).and_then(|ops| ops.fsync(datasync)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        if let Ok(ops) = self.tree.ops_of(ino) {
            if let Err(e) = ops.release() {
                debug!("release op on ino {} failed: {}", ino, e);
            }
        }
        self.tree.release_node(ino);
        reply.ok();
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let children = match self.tree.children(ino) {
            Ok(c) => c,
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        };
        let parent = self
            .tree
            .info(ino)
            .and_then(|i| i.parent)
            .unwrap_or(ino);
        let mut entries: Vec<(u64, FileType, String)> = Vec::with_capacity(children.len() + 2);
        entries.push((ino, FileType::Directory, ".".to_string()));
        entries.push((parent, FileType::Directory, "..".to_string()));
        for child in children {
            let kind = match child.kind {
                NodeKind::Directory => FileType::Directory,
                _ => FileType::RegularFile,
            };
            entries.push((child.id, kind, child.name));
        }
        for (i, (id, kind, name)) in entries.into_iter().enumerate().skip(offset as usize) {
            // i + 1 is the offset of the next entry
            if reply.add(id, (i + 1) as i64, kind, &name) {
                break;
            }
        }
        self.tree.touch_atime(ino);
        reply.ok();
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, _mask: i32, reply: ReplyEmpty) {
        match self.tree.info(ino) {
            Some(_) => reply.ok(),
            None => reply.error(libc::ENOENT),
        }
    }
}
