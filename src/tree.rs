//! The virtual filesystem tree.
//!
//! A process-owned hierarchy of named nodes backing the external filesystem
//! operations. Client syscalls never create nodes; only the host program
//! mutates the tree, and the FUSE dispatch layer ([`crate::fs`]) translates
//! path-keyed operations into per-node ops.
//!
//! Nodes live in an arena keyed by stable ids; the id doubles as the FUSE
//! inode number. A single mutex guards the whole node graph. References are
//! counted per node: one for the link, one per outstanding open, and a node
//! can only be unlinked while the link reference is the last one.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::SystemTime;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::error::{Error, Result};

const S_IFMT: u32 = libc::S_IFMT as u32;
const S_IFREG: u32 = libc::S_IFREG as u32;
const S_IFDIR: u32 = libc::S_IFDIR as u32;
const S_IFBLK: u32 = libc::S_IFBLK as u32;

/// Stable node identifier; also the inode number reported to the kernel.
pub type NodeId = u64;

/// Id of the tree root, fixed to the FUSE root inode.
pub const ROOT_ID: NodeId = 1;

/// What a node is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Plain file.
    Regular,
    /// Directory; the only kind that may have children.
    Directory,
    /// Backend device file.
    Block,
}

/// Per-node operations vector.
///
/// Directories carry none. Regular and block nodes must supply one at
/// creation; the implementor closes over whatever private state its
/// operations need.
pub trait FileOps: Send + Sync {
    /// Called once per successful open.
    fn open(&self) -> Result<()> {
        Ok(())
    }

    /// Called once per release, balancing `open`.
    fn release(&self) -> Result<()> {
        Ok(())
    }

    /// Read up to `size` bytes at `offset`.
    fn read(&self, size: usize, offset: u64) -> Result<Vec<u8>>;

    /// Write `data` at `offset`, returning the bytes consumed.
    fn write(&self, data: &[u8], offset: u64) -> Result<usize>;

    /// Persist node data; absence of an override means success.
    fn fsync(&self, _datasync: bool) -> Result<()> {
        Ok(())
    }
}

/// Attribute snapshot handed to the FUSE layer.
#[derive(Clone)]
pub struct NodeInfo {
    /// Node id (inode).
    pub id: NodeId,
    /// Parent id; `None` only for the root.
    pub parent: Option<NodeId>,
    /// Entry name.
    pub name: String,
    /// Node kind.
    pub kind: NodeKind,
    /// Permission bits.
    pub mode: u32,
    /// Byte size.
    pub size: u64,
    /// Block size; meaningful for block nodes.
    pub block_size: u32,
    /// Last access.
    pub atime: SystemTime,
    /// Last data modification.
    pub mtime: SystemTime,
    /// Last status change.
    pub ctime: SystemTime,
    /// Device number, when assigned.
    pub rdev: u32,
    /// Number of children (directories).
    pub nchildren: usize,
}

struct Node {
    name: String,
    kind: NodeKind,
    mode: u32,
    size: u64,
    block_size: u32,
    atime: SystemTime,
    mtime: SystemTime,
    ctime: SystemTime,
    rdev: u32,
    refs: u32,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    ops: Option<Arc<dyn FileOps>>,
}

impl Node {
    fn info(&self, id: NodeId) -> NodeInfo {
        NodeInfo {
            id,
            parent: self.parent,
            name: self.name.clone(),
            kind: self.kind,
            mode: self.mode,
            size: self.size,
            block_size: self.block_size,
            atime: self.atime,
            mtime: self.mtime,
            ctime: self.ctime,
            rdev: self.rdev,
            nchildren: self.children.len(),
        }
    }
}

struct TreeState {
    nodes: HashMap<NodeId, Node>,
    next_id: NodeId,
    root: Option<NodeId>,
}

impl TreeState {
    fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes.get(&id).ok_or(Error::NotFound)
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.nodes.get_mut(&id).ok_or(Error::NotFound)
    }

    fn child_of(&self, parent: &Node, name: &str) -> Option<NodeId> {
        parent
            .children
            .iter()
            .copied()
            .find(|id| self.nodes.get(id).is_some_and(|n| n.name == name))
    }
}

/// The tree itself: one root, one lock.
pub struct Vft {
    state: Mutex<TreeState>,
}

impl Vft {
    /// An uninitialized tree; call [`Vft::init`] before use.
    pub fn new() -> Self {
        Vft {
            state: Mutex::new(TreeState {
                nodes: HashMap::new(),
                next_id: ROOT_ID,
                root: None,
            }),
        }
    }

    /// Create the root from the mountpoint's final path segment, directory
    /// kind, mode `0555`. The mountpoint must start with `/` and not end
    /// with one. Fails with `exists` if already initialized.
    pub fn init(&self, mountpoint: &str) -> Result<()> {
        if !mountpoint.starts_with('/') || mountpoint.ends_with('/') {
            return Err(Error::Invalid);
        }
        let name = mountpoint.rsplit('/').next().unwrap_or("");
        if name.is_empty() {
            return Err(Error::Invalid);
        }
        let mut state = self.state.lock();
        if state.root.is_some() {
            return Err(Error::Exists);
        }
        let now = SystemTime::now();
        state.nodes.insert(
            ROOT_ID,
            Node {
                name: name.to_string(),
                kind: NodeKind::Directory,
                mode: 0o555,
                size: 0,
                block_size: 0,
                atime: now,
                mtime: now,
                ctime: now,
                rdev: 0,
                refs: 1,
                parent: None,
                children: Vec::new(),
                ops: None,
            },
        );
        state.root = Some(ROOT_ID);
        state.next_id = ROOT_ID + 1;
        Ok(())
    }

    /// Tear the tree down. Fails with `busy` while the root has children or
    /// outstanding references.
    pub fn exit(&self) -> Result<()> {
        let mut state = self.state.lock();
        let root = state.root.ok_or(Error::Invalid)?;
        let node = state.node(root)?;
        if !node.children.is_empty() || node.refs > 1 {
            return Err(Error::Busy);
        }
        state.nodes.remove(&root);
        state.root = None;
        Ok(())
    }

    /// Create a node under `parent` (root when `None`).
    ///
    /// The kind comes from the type bits of `mode`; without one the node is
    /// regular. If a directory of the same name already exists and a
    /// directory was requested, the existing id is returned. Regular and
    /// block nodes require `ops`.
    pub fn node_add(
        &self,
        name: &str,
        parent: Option<NodeId>,
        mode: u32,
        ops: Option<Arc<dyn FileOps>>,
    ) -> Result<NodeId> {
        if name.is_empty() || name.contains('/') {
            return Err(Error::Invalid);
        }
        let kind = match mode & S_IFMT {
            0 | S_IFREG => NodeKind::Regular,
            S_IFDIR => NodeKind::Directory,
            S_IFBLK => NodeKind::Block,
            _ => return Err(Error::Invalid),
        };
        if kind != NodeKind::Directory && ops.is_none() {
            return Err(Error::Invalid);
        }
        let mut state = self.state.lock();
        let parent_id = parent.or(state.root).ok_or(Error::Invalid)?;
        let pnode = state.node(parent_id)?;
        if pnode.kind != NodeKind::Directory {
            return Err(Error::NotDirectory);
        }
        if let Some(existing) = state.child_of(pnode, name) {
            let enode = state.node(existing)?;
            if enode.kind == NodeKind::Directory && kind == NodeKind::Directory {
                return Ok(existing);
            }
            return Err(Error::Exists);
        }
        let id = state.next_id;
        state.next_id += 1;
        let now = SystemTime::now();
        state.nodes.insert(
            id,
            Node {
                name: name.to_string(),
                kind,
                mode: mode & 0o7777,
                size: 0,
                block_size: if kind == NodeKind::Block { 512 } else { 0 },
                atime: now,
                mtime: now,
                ctime: now,
                rdev: 0,
                refs: 1,
                parent: Some(parent_id),
                children: Vec::new(),
                ops,
            },
        );
        let pnode = state.node_mut(parent_id)?;
        pnode.children.push(id);
        pnode.mtime = now;
        debug!("node {} added under {} as {}", name, parent_id, id);
        Ok(id)
    }

    /// Create (or find) a directory with mode `0555`.
    pub fn mkdir(&self, name: &str, parent: Option<NodeId>) -> Result<NodeId> {
        self.node_add(name, parent, S_IFDIR | 0o555, None)
    }

    /// Remove a direct child of `parent` (root when `None`). Fails with
    /// `not-empty` for a populated directory, `busy` while references other
    /// than the link remain, `not-found` without a child of that name.
    pub fn node_remove(&self, name: &str, parent: Option<NodeId>) -> Result<()> {
        self.remove_child(name, parent, None)
    }

    /// [`Vft::node_remove`] restricted to directories.
    pub fn rmdir(&self, name: &str, parent: Option<NodeId>) -> Result<()> {
        self.remove_child(name, parent, Some(NodeKind::Directory))
    }

    fn remove_child(
        &self,
        name: &str,
        parent: Option<NodeId>,
        want_kind: Option<NodeKind>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let parent_id = parent.or(state.root).ok_or(Error::Invalid)?;
        let pnode = state.node(parent_id)?;
        let child = state.child_of(pnode, name).ok_or(Error::NotFound)?;
        let cnode = state.node(child)?;
        if let Some(kind) = want_kind {
            if cnode.kind != kind {
                return Err(Error::NotDirectory);
            }
        }
        if !cnode.children.is_empty() {
            return Err(Error::NotEmpty);
        }
        if cnode.refs > 1 {
            return Err(Error::Busy);
        }
        state.nodes.remove(&child);
        let now = SystemTime::now();
        let pnode = state.node_mut(parent_id)?;
        pnode.children.retain(|id| *id != child);
        pnode.mtime = now;
        debug!("node {} ({}) removed", name, child);
        Ok(())
    }

    /// Resolve an absolute path relative to the tree root. Duplicate
    /// separators collapse and a trailing separator is tolerated.
    pub fn lookup_path(&self, path: &str) -> Option<NodeId> {
        let state = self.state.lock();
        let mut cur = state.root?;
        for seg in path.split('/').filter(|s| !s.is_empty()) {
            let node = state.nodes.get(&cur)?;
            cur = state.child_of(node, seg)?;
        }
        Some(cur)
    }

    /// Direct child lookup by name.
    pub fn child_by_name(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        let state = self.state.lock();
        let pnode = state.nodes.get(&parent)?;
        state.child_of(pnode, name)
    }

    /// Attribute snapshot of one node.
    pub fn info(&self, id: NodeId) -> Option<NodeInfo> {
        let state = self.state.lock();
        state.nodes.get(&id).map(|n| n.info(id))
    }

    /// Attribute snapshots of a directory's children, in insertion order.
    pub fn children(&self, id: NodeId) -> Result<Vec<NodeInfo>> {
        let state = self.state.lock();
        let node = state.node(id)?;
        if node.kind != NodeKind::Directory {
            return Err(Error::NotDirectory);
        }
        Ok(node
            .children
            .iter()
            .filter_map(|cid| state.nodes.get(cid).map(|n| n.info(*cid)))
            .collect())
    }

    /// Take a reference on a node for an open, returning its kind and ops.
    /// The caller must balance with [`Vft::release_node`].
    pub fn open_node(&self, id: NodeId) -> Result<(NodeKind, Option<Arc<dyn FileOps>>)> {
        let mut state = self.state.lock();
        let node = state.node_mut(id)?;
        node.refs += 1;
        Ok((node.kind, node.ops.clone()))
    }

    /// Drop a reference taken by [`Vft::open_node`].
    pub fn release_node(&self, id: NodeId) {
        let mut state = self.state.lock();
        match state.node_mut(id) {
            Ok(node) => {
                debug_assert!(node.refs > 1, "release without matching open");
                node.refs = node.refs.saturating_sub(1);
            }
            Err(_) => warn!("release of unknown node {}", id),
        }
    }

    /// Ops vector of a file node; `is-directory` for directories.
    pub fn ops_of(&self, id: NodeId) -> Result<Arc<dyn FileOps>> {
        let state = self.state.lock();
        let node = state.node(id)?;
        if node.kind == NodeKind::Directory {
            return Err(Error::IsDirectory);
        }
        node.ops.clone().ok_or(Error::Invalid)
    }

    /// Set permission bits.
    pub fn update_mode(&self, id: NodeId, mode: u32) -> Result<()> {
        let mut state = self.state.lock();
        let node = state.node_mut(id)?;
        node.mode = mode & 0o7777;
        node.ctime = SystemTime::now();
        Ok(())
    }

    /// Set byte size.
    pub fn update_size(&self, id: NodeId, size: u64) -> Result<()> {
        let mut state = self.state.lock();
        let node = state.node_mut(id)?;
        node.size = size;
        node.mtime = SystemTime::now();
        Ok(())
    }

    /// Set block size; must be a power of two.
    pub fn update_block_size(&self, id: NodeId, block_size: u32) -> Result<()> {
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(Error::Invalid);
        }
        let mut state = self.state.lock();
        state.node_mut(id)?.block_size = block_size;
        Ok(())
    }

    /// Stamp the data-modification time to now.
    pub fn update_mtime(&self, id: NodeId) -> Result<()> {
        let mut state = self.state.lock();
        state.node_mut(id)?.mtime = SystemTime::now();
        Ok(())
    }

    /// Set the device number.
    pub fn update_rdev(&self, id: NodeId, rdev: u32) -> Result<()> {
        let mut state = self.state.lock();
        state.node_mut(id)?.rdev = rdev;
        Ok(())
    }

    /// Stamp the access time to now.
    pub fn touch_atime(&self, id: NodeId) {
        let mut state = self.state.lock();
        if let Ok(node) = state.node_mut(id) {
            node.atime = SystemTime::now();
        }
    }

    /// Current reference count of a node.
    pub fn refs(&self, id: NodeId) -> Option<u32> {
        let state = self.state.lock();
        state.nodes.get(&id).map(|n| n.refs)
    }

    /// Number of live nodes.
    pub fn node_count(&self) -> usize {
        self.state.lock().nodes.len()
    }

    /// Freshly allocated human-readable dump of the whole tree.
    pub fn fmt_tree(&self) -> String {
        let state = self.state.lock();
        let mut out = String::new();
        if let Some(root) = state.root {
            fmt_node(&state, root, 0, &mut out);
        } else {
            out.push_str("(no tree)\n");
        }
        out
    }
}

impl Default for Vft {
    fn default() -> Self {
        Self::new()
    }
}

fn fmt_node(state: &TreeState, id: NodeId, depth: usize, out: &mut String) {
    let Some(node) = state.nodes.get(&id) else {
        return;
    };
    let indent = "  ".repeat(depth);
    match node.kind {
        NodeKind::Directory => {
            let _ = writeln!(out, "{}{}/ [{:04o}] refs={}", indent, node.name, node.mode, node.refs);
        }
        NodeKind::Regular => {
            let _ = writeln!(out, "{}{} [{:04o}] refs={}", indent, node.name, node.mode, node.refs);
        }
        NodeKind::Block => {
            let _ = writeln!(
                out,
                "{}{} [{:04o}] block size={} bs={} refs={}",
                indent, node.name, node.mode, node.size, node.block_size, node.refs
            );
        }
    }
    for child in &node.children {
        fmt_node(state, *child, depth + 1, out);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct NullOps;

    impl FileOps for NullOps {
        fn read(&self, size: usize, _offset: u64) -> Result<Vec<u8>> {
            Ok(vec![0; size])
        }

        fn write(&self, data: &[u8], _offset: u64) -> Result<usize> {
            Ok(data.len())
        }
    }

    fn tree() -> Vft {
        let t = Vft::new();
        t.init("/tcmur").unwrap();
        t
    }

    fn ops() -> Option<Arc<dyn FileOps>> {
        Some(Arc::new(NullOps))
    }

    #[test]
    fn init_validates_mountpoint() {
        let t = Vft::new();
        assert_eq!(t.init("tcmur"), Err(Error::Invalid));
        assert_eq!(t.init("/tcmur/"), Err(Error::Invalid));
        assert!(t.init("/mnt/tcmur").is_ok());
        assert_eq!(t.init("/tcmur"), Err(Error::Exists));
        assert_eq!(t.info(ROOT_ID).unwrap().name, "tcmur");
    }

    #[test]
    fn exit_requires_empty_root() {
        let t = tree();
        t.mkdir("dev", None).unwrap();
        assert_eq!(t.exit(), Err(Error::Busy));
        t.rmdir("dev", None).unwrap();
        t.exit().unwrap();
        assert_eq!(t.node_count(), 0);
    }

    #[test]
    fn kind_comes_from_mode() {
        let t = tree();
        let f = t.node_add("plain", None, 0o644, ops()).unwrap();
        assert_eq!(t.info(f).unwrap().kind, NodeKind::Regular);
        let b = t
            .node_add("blk", None, S_IFBLK | 0o664, ops())
            .unwrap();
        assert_eq!(t.info(b).unwrap().kind, NodeKind::Block);
        let d = t.node_add("d", None, S_IFDIR | 0o555, None).unwrap();
        assert_eq!(t.info(d).unwrap().kind, NodeKind::Directory);
    }

    #[test]
    fn file_nodes_require_ops() {
        let t = tree();
        assert_eq!(t.node_add("plain", None, 0o644, None), Err(Error::Invalid));
    }

    #[test]
    fn bad_names_rejected() {
        let t = tree();
        assert_eq!(t.node_add("", None, 0o644, ops()), Err(Error::Invalid));
        assert_eq!(t.node_add("a/b", None, 0o644, ops()), Err(Error::Invalid));
    }

    #[test]
    fn mkdir_twice_returns_existing() {
        let t = tree();
        let a = t.mkdir("dev", None).unwrap();
        let b = t.mkdir("dev", None).unwrap();
        assert_eq!(a, b);
        assert_eq!(t.node_add("dev", None, 0o644, ops()), Err(Error::Exists));
    }

    #[test]
    fn mkdir_rmdir_restores_parent() {
        let t = tree();
        let before: Vec<String> = t
            .children(ROOT_ID)
            .unwrap()
            .into_iter()
            .map(|i| i.name)
            .collect();
        t.mkdir("scratch", None).unwrap();
        t.rmdir("scratch", None).unwrap();
        let after: Vec<String> = t
            .children(ROOT_ID)
            .unwrap()
            .into_iter()
            .map(|i| i.name)
            .collect();
        assert_eq!(before, after);
    }

    #[test]
    fn remove_nonempty_directory_fails() {
        let t = tree();
        let d = t.mkdir("dev", None).unwrap();
        t.node_add("ctl", Some(d), 0o664, ops()).unwrap();
        assert_eq!(t.node_remove("dev", None), Err(Error::NotEmpty));
        t.node_remove("ctl", Some(d)).unwrap();
        t.node_remove("dev", None).unwrap();
    }

    #[test]
    fn remove_held_node_fails_busy() {
        let t = tree();
        let id = t.node_add("ctl", None, 0o664, ops()).unwrap();
        let (_, _ops) = t.open_node(id).unwrap();
        assert_eq!(t.node_remove("ctl", None), Err(Error::Busy));
        t.release_node(id);
        t.node_remove("ctl", None).unwrap();
        assert_eq!(t.node_remove("ctl", None), Err(Error::NotFound));
    }

    #[test]
    fn refs_track_link_plus_opens() {
        let t = tree();
        let id = t.node_add("ctl", None, 0o664, ops()).unwrap();
        assert_eq!(t.refs(id), Some(1));
        t.open_node(id).unwrap();
        t.open_node(id).unwrap();
        assert_eq!(t.refs(id), Some(3));
        t.release_node(id);
        t.release_node(id);
        assert_eq!(t.refs(id), Some(1));
    }

    #[test]
    fn lookup_is_path_canonical() {
        let t = tree();
        let d = t.mkdir("a", None).unwrap();
        let f = t.node_add("b", Some(d), 0o644, ops()).unwrap();
        assert_eq!(t.lookup_path("/a/b"), Some(f));
        assert_eq!(t.lookup_path("//a///b"), Some(f));
        assert_eq!(t.lookup_path("/a/b/"), Some(f));
        assert_eq!(t.lookup_path("/a/c"), None);
        assert_eq!(t.lookup_path("/"), Some(ROOT_ID));
    }

    #[test]
    fn block_size_must_be_power_of_two() {
        let t = tree();
        let b = t
            .node_add("blk", None, S_IFBLK | 0o664, ops())
            .unwrap();
        assert_eq!(t.update_block_size(b, 0), Err(Error::Invalid));
        assert_eq!(t.update_block_size(b, 3000), Err(Error::Invalid));
        t.update_block_size(b, 4096).unwrap();
        assert_eq!(t.info(b).unwrap().block_size, 4096);
    }

    #[test]
    fn tree_dump_lists_every_node() {
        let t = tree();
        let d = t.mkdir("dev", None).unwrap();
        t.node_add("ctl", Some(d), 0o664, ops()).unwrap();
        let dump = t.fmt_tree();
        assert!(dump.contains("tcmur/"));
        assert!(dump.contains("dev/"));
        assert!(dump.contains("ctl"));
    }
}
