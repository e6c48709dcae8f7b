//! Handler module loading.
//!
//! The only FFI point in the gateway. [`ModuleLoader`] abstracts the
//! platform dynamic loader so that in-process handler modules (see
//! [`crate::handlers`]) are expressible through the same entry-point shape:
//! every module exports `handler_init`, which receives the registrar and
//! calls `register` back with its descriptor.

use std::ffi::{CStr, CString};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use libc::c_void;
use log::debug;

use crate::error::{Error, Result};
use crate::handler::HandlerRegistrar;

/// Entry point every handler module exports. Returns 0 on success or a
/// negative errno after registering nothing.
pub type HandlerInitFn = unsafe fn(&dyn HandlerRegistrar) -> i32;

/// Opaque handle for a loaded module.
#[derive(Debug)]
pub struct ModuleHandle {
    raw: *mut c_void,
    path: PathBuf,
}

// The raw handle is an opaque loader token; it is only ever passed back to
// the loader that produced it.
unsafe impl Send for ModuleHandle {}

impl ModuleHandle {
    /// Path the module was loaded from.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Platform loader surface: load a module, resolve its init, unload it.
pub trait ModuleLoader: Send + Sync {
    /// Load the shared object at `path`.
    fn load(&self, path: &Path) -> Result<ModuleHandle>;

    /// Resolve the module's `handler_init`.
    fn resolve_init(&self, module: &ModuleHandle) -> Result<HandlerInitFn>;

    /// Give the handle back after the registry drops the module's handlers.
    fn unload(&self, module: ModuleHandle) -> Result<()>;
}

/// The real dynamic loader.
pub struct DlLoader;

fn dlerror_string() -> String {
    let err = unsafe { libc::dlerror() };
    if err.is_null() {
        "unknown loader error".to_string()
    } else {
        unsafe { CStr::from_ptr(err) }.to_string_lossy().into_owned()
    }
}

impl ModuleLoader for DlLoader {
    fn load(&self, path: &Path) -> Result<ModuleHandle> {
        let cpath = CString::new(path.as_os_str().as_bytes()).map_err(|_| Error::Invalid)?;
        let raw = unsafe { libc::dlopen(cpath.as_ptr(), libc::RTLD_NOW) };
        if raw.is_null() {
            return Err(Error::BadModule(format!(
                "{}: {}",
                path.display(),
                dlerror_string()
            )));
        }
        debug!("loaded module {}", path.display());
        Ok(ModuleHandle {
            raw,
            path: path.to_owned(),
        })
    }

    fn resolve_init(&self, module: &ModuleHandle) -> Result<HandlerInitFn> {
        let sym = unsafe { libc::dlsym(module.raw, c"handler_init".as_ptr()) };
        if sym.is_null() {
            return Err(Error::BadModule(format!(
                "{}: no handler_init: {}",
                module.path.display(),
                dlerror_string()
            )));
        }
        Ok(unsafe { std::mem::transmute::<*mut c_void, HandlerInitFn>(sym) })
    }

    fn unload(&self, module: ModuleHandle) -> Result<()> {
        // The handle is not dlclosed: code reachable through previously
        // registered descriptors may still be mapped. Closure is deferred to
        // process exit.
        debug!("unload of {} deferred to process exit", module.path.display());
        drop(module);
        Ok(())
    }
}

/// Compose the on-disk module path for a subtype: configured prefix, the
/// subtype, and the platform library suffix.
pub fn module_path(prefix: &str, subtype: &str) -> PathBuf {
    PathBuf::from(format!(
        "{}{}{}",
        prefix,
        subtype,
        std::env::consts::DLL_SUFFIX
    ))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn module_path_has_prefix_and_suffix() {
        let p = module_path("/usr/local/lib/tcmu-runner/handler_", "ram");
        let s = p.to_str().unwrap();
        assert!(s.starts_with("/usr/local/lib/tcmu-runner/handler_ram"));
        assert!(s.ends_with(std::env::consts::DLL_SUFFIX));
    }

    #[test]
    fn missing_module_reports_bad_module() {
        let err = DlLoader
            .load(Path::new("/nonexistent/handler_zzz.so"))
            .unwrap_err();
        assert!(matches!(err, Error::BadModule(_)));
        assert_eq!(err.errno(), libc::EBADF);
    }
}
