//! Loadable modules.
//!
//! A module is a bound unit of code with named, versioned exports and a
//! list of requested imports. The package store and on-disk format are
//! external; a [`ModuleProvider`] stands at that boundary and constructs
//! module instances on demand, inside the sync context the binder chose
//! for them.

use async_trait::async_trait;
use orb_core::error::{CoreResult, SystemException};
use orb_core::sync::SyncContext;
use orb_poa::request::ObjectRef;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::sync::Arc;

/// An interface version: `major.minor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
}

impl Version {
    pub const DEFAULT: Version = Version { major: 1, minor: 0 };

    /// Whether an export of this version satisfies a request for
    /// `requested`: same major, minor at least as high.
    pub fn satisfies(&self, requested: &Version) -> bool {
        self.major == requested.major && self.minor >= requested.minor
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.major
            .cmp(&other.major)
            .then_with(|| self.minor.cmp(&other.minor))
    }
}

/// A binding name: the symbolic name plus the requested version.
///
/// The textual form is `name` or `name:M.m`; a missing version means 1.0.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BindingName {
    pub name: String,
    pub version: Version,
}

impl BindingName {
    pub fn parse(text: &str) -> CoreResult<Self> {
        match text.rsplit_once(':') {
            Some((name, version)) if version.contains('.') => {
                let (major, minor) = version
                    .split_once('.')
                    .ok_or_else(|| SystemException::bad_param(0))?;
                let major = major.parse().map_err(|_| SystemException::bad_param(0))?;
                let minor = minor.parse().map_err(|_| SystemException::bad_param(0))?;
                if name.is_empty() {
                    return Err(SystemException::bad_param(0));
                }
                Ok(Self {
                    name: name.to_owned(),
                    version: Version { major, minor },
                })
            }
            _ => {
                if text.is_empty() {
                    return Err(SystemException::bad_param(0));
                }
                Ok(Self {
                    name: text.to_owned(),
                    version: Version::DEFAULT,
                })
            }
        }
    }
}

impl std::fmt::Display for BindingName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}.{}",
            self.name, self.version.major, self.version.minor
        )
    }
}

/// What a constructed module publishes and requests.
pub struct ModuleExports {
    /// Versioned-name exports.
    pub exports: Vec<(BindingName, ObjectRef)>,
    /// Names this module wants resolved once loaded.
    pub imports: Vec<String>,
}

/// A loaded module.
pub struct Module {
    name: String,
    singleton: bool,
    sync_context: SyncContext,
    exports: Vec<(BindingName, ObjectRef)>,
    imports: Vec<String>,
    // Bound imports are held for the module's lifetime.
    import_holds: Mutex<Vec<ObjectRef>>,
}

impl Module {
    pub(crate) fn new(
        name: String,
        singleton: bool,
        sync_context: SyncContext,
        exports: ModuleExports,
    ) -> Arc<Self> {
        let module = Arc::new(Self {
            name,
            singleton,
            sync_context: sync_context.clone(),
            exports: exports.exports,
            imports: exports.imports,
            import_holds: Mutex::new(Vec::new()),
        });
        // The domain roots its owning module for code lifetime.
        if let Some(domain) = sync_context.domain() {
            domain.set_owner_module(module.clone());
        }
        module
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_singleton(&self) -> bool {
        self.singleton
    }

    pub fn sync_context(&self) -> &SyncContext {
        &self.sync_context
    }

    pub fn exports(&self) -> &[(BindingName, ObjectRef)] {
        &self.exports
    }

    pub fn imports(&self) -> &[String] {
        &self.imports
    }

    pub(crate) fn hold_import(&self, object: ObjectRef) {
        self.import_holds.lock().push(object);
    }

    pub(crate) fn release_imports(&self) {
        self.import_holds.lock().clear();
    }
}

/// The boundary to the package store: constructs modules by name.
#[async_trait]
pub trait ModuleProvider: Send + Sync {
    /// The module (if any) whose exports cover `object_name`.
    fn module_for(&self, object_name: &str) -> Option<String>;

    /// Whether the named module must run inside a singleton domain.
    fn is_singleton(&self, module_name: &str) -> bool;

    /// Runs the module initializer inside `context` and reports its
    /// exports and imports.
    async fn construct(&self, module_name: &str, context: &SyncContext)
        -> CoreResult<ModuleExports>;
}
