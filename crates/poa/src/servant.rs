//! Servant contracts.
//!
//! A servant implements an object's operations; the adapter resolves object
//! keys to servants and dispatches requests into their sync context.
//! Servant managers supply servants on demand: activators incarnate and
//! etherealize under RETAIN, locators bracket each invocation under
//! NON_RETAIN.

use crate::error::PoaResult;
use crate::poa::Poa;
use crate::request::Request;
use async_trait::async_trait;
use bytes::Bytes;
use orb_core::error::CoreResult;
use std::any::Any;
use std::sync::Arc;

/// A user servant.
#[async_trait]
pub trait Servant: Send + Sync {
    /// Primary repository id of the implemented interface.
    fn primary_interface(&self) -> String;

    /// All repository ids this servant answers to.
    fn interfaces(&self) -> Vec<String> {
        vec![self.primary_interface()]
    }

    /// Executes `operation`, reading arguments from and writing results to
    /// the request's codec.
    async fn dispatch(&self, operation: &str, request: &mut dyn Request) -> CoreResult<()>;

    fn as_any(&self) -> &dyn Any;
}

/// Opaque state passed from `preinvoke` to `postinvoke`.
pub type LocatorCookie = Option<Box<dyn Any + Send>>;

/// Supplies servants for RETAIN adapters on AOM misses.
#[async_trait]
pub trait ServantActivator: Send + Sync {
    /// Produces the servant to register for `object_id`.
    async fn incarnate(&self, object_id: &Bytes, adapter: &Arc<Poa>)
        -> PoaResult<Arc<dyn Servant>>;

    /// Retires a servant removed from the AOM.
    async fn etherealize(
        &self,
        object_id: &Bytes,
        adapter: &Arc<Poa>,
        servant: Arc<dyn Servant>,
        cleanup_in_progress: bool,
        remaining_activations: bool,
    );
}

/// Brackets each invocation for NON_RETAIN adapters.
#[async_trait]
pub trait ServantLocator: Send + Sync {
    /// Produces the servant for one invocation.
    async fn preinvoke(
        &self,
        object_id: &Bytes,
        adapter: &Arc<Poa>,
        operation: &str,
    ) -> PoaResult<(Arc<dyn Servant>, LocatorCookie)>;

    /// Runs after the invocation, on success and failure alike.
    async fn postinvoke(
        &self,
        object_id: &Bytes,
        adapter: &Arc<Poa>,
        operation: &str,
        cookie: LocatorCookie,
        servant: Arc<dyn Servant>,
    );
}

/// The servant manager attached to a USE_SERVANT_MANAGER adapter.
#[derive(Clone)]
pub enum ServantManager {
    Activator(Arc<dyn ServantActivator>),
    Locator(Arc<dyn ServantLocator>),
}

/// Creates missing child adapters during `find_poa` and request routing.
#[async_trait]
pub trait AdapterActivator: Send + Sync {
    /// Returns true if the named child was created under `parent`.
    async fn unknown_adapter(&self, parent: &Arc<Poa>, name: &str) -> PoaResult<bool>;
}
