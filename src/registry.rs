//! The handler registry.
//!
//! A fixed-capacity slot table mapping a subtype to a loaded handler.
//! Loading consults the built-in module table first and falls back to the
//! dynamic loader with the configured path prefix. A handler's `Arc` strong
//! count doubles as its busy indicator: device bindings clone the `Arc`, so
//! a subtype cannot be unloaded while any device still binds it.

use std::sync::Arc;

use log::{info, warn};
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::handler::{Handler, HandlerRegistrar};
use crate::handlers;
use crate::loader::{self, DlLoader, ModuleHandle, ModuleLoader};

/// Registry capacity.
pub const MAX_HANDLERS: usize = 64;

struct Slot {
    handler: Arc<dyn Handler>,
    module: Option<ModuleHandle>,
}

/// Slot-indexed table of loaded handler modules.
pub struct HandlerRegistry {
    prefix: String,
    loader: Box<dyn ModuleLoader>,
    slots: Mutex<Vec<Option<Slot>>>,
}

impl HandlerRegistry {
    /// A registry using the platform dynamic loader and the given module
    /// path prefix. The prefix is fixed for the registry's lifetime.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self::with_loader(prefix, Box::new(DlLoader))
    }

    /// A registry with a caller-supplied loader.
    pub fn with_loader(prefix: impl Into<String>, loader: Box<dyn ModuleLoader>) -> Self {
        let mut slots = Vec::with_capacity(MAX_HANDLERS);
        slots.resize_with(MAX_HANDLERS, || None);
        HandlerRegistry {
            prefix: prefix.into(),
            loader,
            slots: Mutex::new(slots),
        }
    }

    /// Load the handler module for `subtype`. Fails with `exists` if the
    /// subtype is already registered and `no-space` when the table is full;
    /// loader and initializer failures surface as `bad-file` after the
    /// partial load is undone.
    pub fn load(&self, subtype: &str) -> Result<()> {
        if subtype.is_empty() || !subtype.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(Error::Invalid);
        }
        {
            let slots = self.slots.lock();
            if slots
                .iter()
                .flatten()
                .any(|s| s.handler.subtype() == subtype)
            {
                return Err(Error::Exists);
            }
            if slots.iter().all(Option::is_some) {
                return Err(Error::NoSpace);
            }
        }

        if let Some(init) = handlers::builtin(subtype) {
            let rc = unsafe { init(self) };
            if rc < 0 {
                return Err(Error::BadModule(format!(
                    "built-in {} init failed: {}",
                    subtype, rc
                )));
            }
        } else {
            let path = loader::module_path(&self.prefix, subtype);
            let module = self.loader.load(&path)?;
            let init = match self.loader.resolve_init(&module) {
                Ok(f) => f,
                Err(e) => {
                    let _ = self.loader.unload(module);
                    return Err(e);
                }
            };
            let rc = unsafe { init(self) };
            if rc < 0 {
                let _ = self.loader.unload(module);
                return Err(Error::BadModule(format!(
                    "{}: handler_init failed: {}",
                    path.display(),
                    rc
                )));
            }
            if let Err(e) = self.attach_module(subtype, module) {
                return Err(e);
            }
        }

        if self.find(subtype).is_none() {
            return Err(Error::BadModule(format!(
                "module for {} registered no matching handler",
                subtype
            )));
        }
        info!("loaded handler {}", subtype);
        Ok(())
    }

    /// Attach the loader handle to the slot its initializer registered.
    fn attach_module(&self, subtype: &str, module: ModuleHandle) -> Result<()> {
        let mut slots = self.slots.lock();
        match slots
            .iter_mut()
            .flatten()
            .find(|s| s.handler.subtype() == subtype)
        {
            Some(slot) => {
                slot.module = Some(module);
                Ok(())
            }
            None => {
                drop(slots);
                let path = module.path().display().to_string();
                let _ = self.loader.unload(module);
                Err(Error::BadModule(format!(
                    "{}: registered no handler for {}",
                    path, subtype
                )))
            }
        }
    }

    /// Drop the handler for `subtype`. Fails with `not-found` if no such
    /// handler and `busy` while any device binds it.
    pub fn unload(&self, subtype: &str) -> Result<()> {
        let mut slots = self.slots.lock();
        let idx = slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|s| s.handler.subtype() == subtype))
            .ok_or(Error::NotFound)?;
        {
            let slot = slots[idx].as_ref().unwrap();
            if Arc::strong_count(&slot.handler) > 1 {
                return Err(Error::Busy);
            }
        }
        let slot = slots[idx].take().unwrap();
        drop(slots);
        if let Some(module) = slot.module {
            let _ = self.loader.unload(module);
        }
        info!("unloaded handler {}", subtype);
        Ok(())
    }

    /// The handler registered for `subtype`, if any.
    pub fn find(&self, subtype: &str) -> Option<Arc<dyn Handler>> {
        let slots = self.slots.lock();
        slots
            .iter()
            .flatten()
            .find(|s| s.handler.subtype() == subtype)
            .map(|s| s.handler.clone())
    }

    /// Subtypes currently registered, in slot order.
    pub fn loaded(&self) -> Vec<String> {
        let slots = self.slots.lock();
        slots
            .iter()
            .flatten()
            .map(|s| s.handler.subtype().to_string())
            .collect()
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.slots.lock().iter().flatten().count()
    }

    /// Whether no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Final release at shutdown; refuses while handlers remain registered.
    pub fn shutdown(&self) -> Result<()> {
        let remaining = self.loaded();
        if remaining.is_empty() {
            Ok(())
        } else {
            warn!("handlers still registered at shutdown: {:?}", remaining);
            Err(Error::Busy)
        }
    }
}

impl HandlerRegistrar for HandlerRegistry {
    fn register(&self, handler: Arc<dyn Handler>) -> Result<()> {
        let mut slots = self.slots.lock();
        if slots
            .iter()
            .flatten()
            .any(|s| s.handler.subtype() == handler.subtype())
        {
            return Err(Error::Exists);
        }
        let free = slots
            .iter_mut()
            .find(|s| s.is_none())
            .ok_or(Error::NoSpace)?;
        info!("registered handler {} ({})", handler.subtype(), handler.name());
        *free = Some(Slot {
            handler,
            module: None,
        });
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::device::Device;
    use crate::handler::{CmdStatus, SgList};

    struct Dummy(String);

    impl Handler for Dummy {
        fn subtype(&self) -> &str {
            &self.0
        }

        fn name(&self) -> &str {
            "dummy"
        }

        fn open(&self, _dev: &Device, _reopen: bool) -> Result<()> {
            Ok(())
        }

        fn close(&self, _dev: &Device) {}

        fn read(&self, _dev: &Device, _sg: &mut SgList, _offset: u64) -> CmdStatus {
            CmdStatus::Ok
        }

        fn write(&self, _dev: &Device, _sg: &SgList, _offset: u64) -> CmdStatus {
            CmdStatus::Ok
        }
    }

    fn registry() -> HandlerRegistry {
        HandlerRegistry::new("/nonexistent/handler_")
    }

    #[test]
    fn load_builtin_then_unload() {
        let r = registry();
        r.load("ram").unwrap();
        assert!(r.find("ram").is_some());
        assert_eq!(r.load("ram"), Err(Error::Exists));
        r.unload("ram").unwrap();
        assert!(r.find("ram").is_none());
        assert_eq!(r.unload("ram"), Err(Error::NotFound));
        assert!(r.is_empty());
    }

    #[test]
    fn load_missing_module_is_bad_file() {
        let r = registry();
        let err = r.load("glfs").unwrap_err();
        assert!(matches!(err, Error::BadModule(_)));
        assert!(r.find("glfs").is_none());
    }

    #[test]
    fn load_rejects_bad_subtype() {
        let r = registry();
        assert_eq!(r.load(""), Err(Error::Invalid));
        assert_eq!(r.load("ram/0"), Err(Error::Invalid));
    }

    #[test]
    fn duplicate_register_fails() {
        let r = registry();
        r.register(Arc::new(Dummy("x".into()))).unwrap();
        assert_eq!(
            r.register(Arc::new(Dummy("x".into()))),
            Err(Error::Exists)
        );
    }

    #[test]
    fn capacity_is_bounded() {
        let r = registry();
        for i in 0..MAX_HANDLERS {
            r.register(Arc::new(Dummy(format!("h{}", i)))).unwrap();
        }
        assert_eq!(
            r.register(Arc::new(Dummy("overflow".into()))),
            Err(Error::NoSpace)
        );
        assert_eq!(r.load("ram"), Err(Error::NoSpace));
    }

    #[test]
    fn unload_busy_while_handler_borrowed() {
        let r = registry();
        r.load("ram").unwrap();
        let held = r.find("ram").unwrap();
        assert_eq!(r.unload("ram"), Err(Error::Busy));
        drop(held);
        r.unload("ram").unwrap();
    }
}
