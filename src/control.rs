//! The control channel.
//!
//! A write-driven, line-oriented command interpreter bound to a
//! distinguished node (conventionally `/dev/tcmur`). Writing command lines
//! reconfigures the registry, the device table and the tree; reading the
//! node yields the current tree dump. Command failures are reported as
//! human text on stderr, and the write itself always reports full
//! consumption so the writing tool never retries.

use std::io::Read;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::Sender;
use log::{debug, warn};
use parking_lot::Mutex;

use crate::bridge::{DeviceFileOps, IoBridge};
use crate::device::DeviceTable;
use crate::error::{Error, Result};
use crate::registry::HandlerRegistry;
use crate::tree::{FileOps, Vft};

const S_IFREG: u32 = libc::S_IFREG as u32;
const S_IFBLK: u32 = libc::S_IFBLK as u32;

/// Default cap on a sourced script, in bytes.
pub const DEFAULT_SOURCE_CAP: usize = 4096;

/// How deep `source` may nest before the interpreter refuses.
const MAX_SOURCE_DEPTH: usize = 8;

/// Delay before `exit` fires, long enough for the write reply to drain.
const EXIT_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cmd {
    Load,
    Unload,
    Add,
    Remove,
    Source,
    Dump,
    Echo,
    Exit,
}

// Matching is a case-insensitive initial substring of the keyword; `echo`
// precedes `exit` so a bare `e` stays harmless.
const COMMANDS: &[(&str, Cmd)] = &[
    ("load", Cmd::Load),
    ("unload", Cmd::Unload),
    ("add", Cmd::Add),
    ("remove", Cmd::Remove),
    ("source", Cmd::Source),
    ("dump", Cmd::Dump),
    ("echo", Cmd::Echo),
    ("exit", Cmd::Exit),
];

fn match_keyword(word: &str) -> Option<Cmd> {
    let word = word.to_ascii_lowercase();
    COMMANDS
        .iter()
        .find(|(kw, _)| kw.starts_with(&word))
        .map(|(_, cmd)| *cmd)
}

/// The command interpreter and the glue it drives.
pub struct Controller {
    tree: Arc<Vft>,
    registry: Arc<HandlerRegistry>,
    devices: Arc<DeviceTable>,
    bridge: Arc<IoBridge>,
    shutdown: Mutex<Option<Sender<()>>>,
    source_cap: AtomicUsize,
}

impl Controller {
    /// Wire an interpreter over the given subsystems.
    pub fn new(
        tree: Arc<Vft>,
        registry: Arc<HandlerRegistry>,
        devices: Arc<DeviceTable>,
        bridge: Arc<IoBridge>,
    ) -> Arc<Self> {
        Arc::new(Controller {
            tree,
            registry,
            devices,
            bridge,
            shutdown: Mutex::new(None),
            source_cap: AtomicUsize::new(DEFAULT_SOURCE_CAP),
        })
    }

    /// Install the shutdown channel the `exit` command signals.
    pub fn set_shutdown(&self, tx: Sender<()>) {
        *self.shutdown.lock() = Some(tx);
    }

    /// Change the byte cap applied to sourced scripts.
    pub fn set_source_cap(&self, cap: usize) {
        self.source_cap.store(cap, Ordering::Relaxed);
    }

    /// Create the skeletal directories and the control node itself.
    pub fn install(self: &Arc<Self>, ctl_name: &str) -> Result<()> {
        let dev = self.tree.mkdir("dev", None)?;
        let sys = self.tree.mkdir("sys", None)?;
        self.tree.mkdir("module", Some(sys))?;
        self.tree.node_add(
            ctl_name,
            Some(dev),
            S_IFREG | 0o664,
            Some(Arc::new(ControlFileOps {
                ctl: Arc::clone(self),
            })),
        )?;
        Ok(())
    }

    /// Remove the control-created subtrees; called at shutdown. Anything
    /// still populated is left behind with a warning.
    pub fn teardown(&self, ctl_name: &str) {
        let dev = self.tree.lookup_path("/dev");
        if let Err(e) = self.tree.node_remove(ctl_name, dev) {
            warn!("control node left behind: {}", e);
        }
        let sys = self.tree.lookup_path("/sys");
        for (name, parent) in [("module", sys), ("sys", None), ("dev", None)] {
            if let Err(e) = self.tree.rmdir(name, parent) {
                warn!("directory {} left behind: {}", name, e);
            }
        }
    }

    /// Feed bytes written to the control node through the interpreter.
    /// Always reports the whole buffer consumed.
    pub fn write(&self, data: &[u8]) -> usize {
        self.run_script(&String::from_utf8_lossy(data), 0);
        data.len()
    }

    fn run_script(&self, text: &str, depth: usize) {
        for line in text.lines() {
            self.run_line(line, depth);
        }
    }

    fn run_line(&self, raw: &str, depth: usize) {
        let line = raw.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            return;
        }
        let mut words = line.split_whitespace();
        let keyword = words.next().unwrap_or("");
        let args: Vec<&str> = words.collect();
        debug!("control: {:?}", line);
        let result = match match_keyword(keyword) {
            Some(Cmd::Load) => self.cmd_load(&args),
            Some(Cmd::Unload) => self.cmd_unload(&args),
            Some(Cmd::Add) => self.cmd_add(&args),
            Some(Cmd::Remove) => self.cmd_remove(&args),
            Some(Cmd::Source) => self.cmd_source(&args, depth),
            Some(Cmd::Dump) => {
                eprint!("{}", self.tree.fmt_tree());
                Ok(())
            }
            Some(Cmd::Echo) => Ok(()),
            Some(Cmd::Exit) => self.cmd_exit(),
            None => Err(Error::Invalid),
        };
        if let Err(e) = result {
            eprintln!("tcmurfs: {:?}: {}", line, e);
        }
    }

    fn cmd_load(&self, args: &[&str]) -> Result<()> {
        let [subtype] = args else {
            return Err(Error::Invalid);
        };
        self.registry.load(subtype)?;
        let module_dir = self.tree.lookup_path("/sys/module");
        if let Err(e) = self.tree.mkdir(subtype, module_dir) {
            warn!("no module directory for {}: {}", subtype, e);
        }
        Ok(())
    }

    fn cmd_unload(&self, args: &[&str]) -> Result<()> {
        let [subtype] = args else {
            return Err(Error::Invalid);
        };
        if self.devices.bound_count(subtype) > 0 {
            return Err(Error::Busy);
        }
        self.registry.unload(subtype)?;
        let module_dir = self.tree.lookup_path("/sys/module");
        if let Err(e) = self.tree.rmdir(subtype, module_dir) {
            warn!("module directory for {} not removed: {}", subtype, e);
        }
        Ok(())
    }

    fn cmd_add(&self, args: &[&str]) -> Result<()> {
        let [minor, cfg] = args else {
            return Err(Error::Invalid);
        };
        let minor: u16 = minor.parse().map_err(|_| Error::Invalid)?;
        let dev = self.devices.add(minor, None, cfg)?;
        let parent = self.tree.lookup_path("/dev");
        let added = self.tree.node_add(
            dev.name(),
            parent,
            S_IFBLK | 0o664,
            Some(Arc::new(DeviceFileOps::new(
                minor,
                self.devices.clone(),
                self.bridge.clone(),
            ))),
        );
        let node = match added {
            Ok(node) => node,
            Err(e) => {
                // no node, no device
                let _ = self.devices.remove(minor);
                return Err(e);
            }
        };
        self.tree.update_size(node, dev.size())?;
        self.tree.update_block_size(node, dev.block_size())?;
        self.tree.update_rdev(node, u32::from(minor))?;
        Ok(())
    }

    fn cmd_remove(&self, args: &[&str]) -> Result<()> {
        let [minor] = args else {
            return Err(Error::Invalid);
        };
        let minor: u16 = minor.parse().map_err(|_| Error::Invalid)?;
        let dev = self.devices.get(minor)?;
        let parent = self.tree.lookup_path("/dev");
        self.tree.node_remove(dev.name(), parent)?;
        self.devices.remove(minor)
    }

    fn cmd_source(&self, args: &[&str], depth: usize) -> Result<()> {
        let [path] = args else {
            return Err(Error::Invalid);
        };
        if depth >= MAX_SOURCE_DEPTH {
            warn!("source nesting deeper than {}", MAX_SOURCE_DEPTH);
            return Err(Error::Invalid);
        }
        let cap = self.source_cap.load(Ordering::Relaxed);
        let mut text = String::new();
        std::fs::File::open(path)?
            .take(cap as u64)
            .read_to_string(&mut text)?;
        self.run_script(&text, depth + 1);
        Ok(())
    }

    fn cmd_exit(&self) -> Result<()> {
        let Some(tx) = self.shutdown.lock().clone() else {
            warn!("exit requested but no shutdown channel is wired");
            return Err(Error::Invalid);
        };
        thread::spawn(move || {
            // let the in-flight write reply reach the writer first
            thread::sleep(EXIT_DELAY);
            let _ = tx.send(());
        });
        Ok(())
    }
}

/// Ops vector of the control node: reads dump the tree, writes run commands.
struct ControlFileOps {
    ctl: Arc<Controller>,
}

impl FileOps for ControlFileOps {
    fn read(&self, size: usize, offset: u64) -> Result<Vec<u8>> {
        let dump = self.ctl.tree.fmt_tree().into_bytes();
        let start = (offset as usize).min(dump.len());
        let end = start.saturating_add(size).min(dump.len());
        Ok(dump[start..end].to_vec())
    }

    fn write(&self, data: &[u8], _offset: u64) -> Result<usize> {
        Ok(self.ctl.write(data))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write as _;

    fn gateway() -> (Arc<Vft>, Arc<HandlerRegistry>, Arc<DeviceTable>, Arc<Controller>) {
        let tree = Arc::new(Vft::new());
        tree.init("/tcmur").unwrap();
        let registry = Arc::new(HandlerRegistry::new("/nonexistent/handler_"));
        let devices = Arc::new(DeviceTable::new(registry.clone()));
        let bridge = Arc::new(IoBridge::new(devices.clone()));
        let ctl = Controller::new(tree.clone(), registry.clone(), devices.clone(), bridge);
        ctl.install("tcmur").unwrap();
        (tree, registry, devices, ctl)
    }

    #[test]
    fn keyword_matching_is_lenient() {
        assert_eq!(match_keyword("load"), Some(Cmd::Load));
        assert_eq!(match_keyword("LO"), Some(Cmd::Load));
        assert_eq!(match_keyword("rem"), Some(Cmd::Remove));
        assert_eq!(match_keyword("e"), Some(Cmd::Echo));
        assert_eq!(match_keyword("ex"), Some(Cmd::Exit));
        assert_eq!(match_keyword("bogus"), None);
    }

    #[test]
    fn install_builds_the_skeleton() {
        let (tree, _, _, _) = gateway();
        assert!(tree.lookup_path("/dev/tcmur").is_some());
        assert!(tree.lookup_path("/sys/module").is_some());
    }

    #[test]
    fn writes_always_report_full_length() {
        let (_, _, _, ctl) = gateway();
        assert_eq!(ctl.write(b"bogus command\n"), 14);
        assert_eq!(ctl.write(b"# comment only\n"), 15);
        assert_eq!(ctl.write(b"\n\n"), 2);
    }

    #[test]
    fn load_and_add_populate_the_tree() {
        let (tree, registry, devices, ctl) = gateway();
        ctl.write(b"load ram\nadd 0 /ram/@\n");
        assert!(registry.find("ram").is_some());
        assert!(tree.lookup_path("/sys/module/ram").is_some());
        let node = tree.lookup_path("/dev/ram000").expect("device node");
        let info = tree.info(node).unwrap();
        assert_eq!(info.size, 1 << 30);
        assert_eq!(info.block_size, 4096);
        devices.get(0).unwrap();
    }

    #[test]
    fn case_insensitive_prefixes_run_commands() {
        let (tree, _, devices, ctl) = gateway();
        ctl.write(b"LO ram\nAD 0 /ram/@\n");
        assert!(tree.lookup_path("/dev/ram000").is_some());
        devices.get(0).unwrap();
    }

    #[test]
    fn comments_and_echo_are_ignored() {
        let (_, registry, _, ctl) = gateway();
        ctl.write(b"# load ram\necho load ram\n   \n");
        assert!(registry.find("ram").is_none());
    }

    #[test]
    fn remove_unbinds_node_then_device() {
        let (tree, _, devices, ctl) = gateway();
        ctl.write(b"load ram\nadd 0 /ram/@\nremove 0\n");
        assert!(tree.lookup_path("/dev/ram000").is_none());
        assert_eq!(devices.get(0).unwrap_err(), Error::NoDevice);
    }

    #[test]
    fn unload_with_bound_device_is_refused() {
        let (tree, registry, _, ctl) = gateway();
        ctl.write(b"load ram\nadd 0 /ram/@\nunload ram\n");
        assert!(registry.find("ram").is_some());
        ctl.write(b"remove 0\nunload ram\n");
        assert!(registry.find("ram").is_none());
        assert!(tree.lookup_path("/sys/module/ram").is_none());
    }

    #[test]
    fn source_runs_a_script() {
        let (tree, _, devices, ctl) = gateway();
        let mut script = tempfile::NamedTempFile::new().unwrap();
        writeln!(script, "load ram").unwrap();
        writeln!(script, "add 1 /ram/@").unwrap();
        script.flush().unwrap();
        ctl.write(format!("source {}\n", script.path().display()).as_bytes());
        assert!(tree.lookup_path("/dev/ram001").is_some());
        devices.get(1).unwrap();
    }

    #[test]
    fn source_cap_bounds_script_size() {
        let (_, registry, _, ctl) = gateway();
        ctl.set_source_cap(4);
        let mut script = tempfile::NamedTempFile::new().unwrap();
        writeln!(script, "load ram").unwrap();
        script.flush().unwrap();
        // only "load" survives the cap; the truncated line cannot resolve
        ctl.write(format!("source {}\n", script.path().display()).as_bytes());
        assert!(registry.find("ram").is_none());
    }

    #[test]
    fn control_node_read_returns_dump() {
        let (tree, _, _, ctl) = gateway();
        ctl.write(b"load ram\nadd 0 /ram/@\n");
        let node = tree.lookup_path("/dev/tcmur").unwrap();
        let ops = tree.ops_of(node).unwrap();
        let dump = ops.read(65536, 0).unwrap();
        let text = String::from_utf8(dump).unwrap();
        assert!(text.contains("ram000"));
        let tail = ops.read(65536, text.len() as u64).unwrap();
        assert!(tail.is_empty());
    }

    #[test]
    fn teardown_removes_empty_skeleton() {
        let (tree, _, _, ctl) = gateway();
        ctl.teardown("tcmur");
        assert!(tree.lookup_path("/dev").is_none());
        assert!(tree.lookup_path("/sys").is_none());
        tree.exit().unwrap();
    }
}
