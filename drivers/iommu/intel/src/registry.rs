//! # Device Context Registry
//!
//! The parent IOMMU's collection of live device contexts, keyed by BDF. At
//! most one context may exist per requester; creating a second one means
//! the caller's bookkeeping is broken and is treated as fatal.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::context_entry::{ContextEntry, ExtendedContextEntry};
use crate::device_context::DeviceContext;
use crate::error::IommuResult;
use crate::parent::IommuParent;
use crate::types::{Bdf, DomainId};

/// A registered context and its domain
///
/// The domain never changes after creation, so it is kept outside the lock.
struct RegisteredContext {
    domain_id: DomainId,
    ctx: Mutex<DeviceContext>,
}

/// BDF to device context map
#[derive(Default)]
pub struct DeviceContextRegistry {
    contexts: BTreeMap<Bdf, RegisteredContext>,
}

impl DeviceContextRegistry {
    /// Create an empty registry
    pub const fn new() -> Self {
        Self { contexts: BTreeMap::new() }
    }

    /// Number of live contexts
    #[inline]
    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    /// Check if no context is live
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// Check if `bdf` has a context
    #[inline]
    pub fn contains(&self, bdf: Bdf) -> bool {
        self.contexts.contains_key(&bdf)
    }

    fn ensure_vacant(&self, bdf: Bdf) {
        if self.contains(bdf) {
            log::error!("VT-d: duplicate device context for {}", bdf);
            panic!("VT-d: duplicate device context for {}", bdf);
        }
    }

    fn insert(&mut self, ctx: DeviceContext) -> &Mutex<DeviceContext> {
        let bdf = ctx.bdf();
        let domain_id = ctx.domain_id();
        &self
            .contexts
            .entry(bdf)
            .or_insert(RegisteredContext { domain_id, ctx: Mutex::new(ctx) })
            .ctx
    }

    /// Create and register an extended context for `bdf`
    ///
    /// # Panics
    ///
    /// Panics if `bdf` already has a context.
    ///
    /// # Safety
    ///
    /// See [`DeviceContext::create_extended`].
    pub unsafe fn create_extended(
        &mut self,
        bdf: Bdf,
        domain_id: DomainId,
        parent: Arc<dyn IommuParent>,
        entry: *mut ExtendedContextEntry,
    ) -> IommuResult<&Mutex<DeviceContext>> {
        self.ensure_vacant(bdf);
        // Safety: forwarded from the caller
        let ctx = unsafe { DeviceContext::create_extended(bdf, domain_id, parent, entry)? };
        Ok(self.insert(ctx))
    }

    /// Create and register a legacy context for `bdf`
    ///
    /// # Panics
    ///
    /// Panics if `bdf` already has a context.
    ///
    /// # Safety
    ///
    /// See [`DeviceContext::create_legacy`].
    pub unsafe fn create_legacy(
        &mut self,
        bdf: Bdf,
        domain_id: DomainId,
        parent: Arc<dyn IommuParent>,
        entry: *mut ContextEntry,
    ) -> IommuResult<&Mutex<DeviceContext>> {
        self.ensure_vacant(bdf);
        // Safety: forwarded from the caller
        let ctx = unsafe { DeviceContext::create_legacy(bdf, domain_id, parent, entry)? };
        Ok(self.insert(ctx))
    }

    /// Context of `bdf`
    #[inline]
    pub fn get(&self, bdf: Bdf) -> Option<&Mutex<DeviceContext>> {
        self.contexts.get(&bdf).map(|entry| &entry.ctx)
    }

    /// Tear down the context of `bdf`
    ///
    /// The context is dropped before this returns. Returns whether one existed.
    pub fn remove(&mut self, bdf: Bdf) -> bool {
        match self.contexts.remove(&bdf) {
            Some(ctx) => {
                drop(ctx);
                true
            },
            None => false,
        }
    }

    /// Requesters bound to `domain`
    ///
    /// Takes no context lock.
    pub fn domain_members(&self, domain: DomainId) -> Vec<Bdf> {
        self.contexts
            .iter()
            .filter(|(_, entry)| entry.domain_id == domain)
            .map(|(&bdf, _)| bdf)
            .collect()
    }
}
