//! # Default Allocator Claims
//!
//! Per arena type, the first candidate constructed becomes the default. A
//! candidate that loses the race never becomes default later; dropping the
//! default clears its slot only if it still holds the claim.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::RwLock;

use crate::error::ArenaResult;
use crate::memory::{AllocRequest, Arena, ArenaIdentity};

struct Claim {
    token: u64,
    holder: Weak<dyn Any + Send + Sync>,
}

/// One default slot per arena type.
pub struct DefaultSlots {
    claims: RwLock<HashMap<TypeId, Claim>>,
    next_token: AtomicU64,
}

impl DefaultSlots {
    /// An empty set of slots.
    #[must_use]
    pub fn new() -> Self {
        Self {
            claims: RwLock::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }

    /// The current default candidate for arena type `A`, if any.
    #[must_use]
    pub fn current<A: Arena + Send + Sync + 'static>(&self) -> Option<Arc<DefaultCandidate<A>>> {
        let holder = self.claims.read().get(&TypeId::of::<A>())?.holder.upgrade()?;
        holder.downcast::<DefaultCandidate<A>>().ok()
    }

    /// Whether some candidate currently holds the slot for `A`.
    #[must_use]
    pub fn is_claimed<A: 'static>(&self) -> bool {
        self.claims.read().contains_key(&TypeId::of::<A>())
    }

    fn try_claim(&self, kind: TypeId, token: u64, holder: Weak<dyn Any + Send + Sync>) -> bool {
        let mut claims = self.claims.write();
        if claims.contains_key(&kind) {
            return false;
        }
        claims.insert(kind, Claim { token, holder });
        true
    }

    fn holds(&self, kind: TypeId, token: u64) -> bool {
        self.claims
            .read()
            .get(&kind)
            .is_some_and(|claim| claim.token == token)
    }

    fn release(&self, kind: TypeId, token: u64) -> bool {
        let mut claims = self.claims.write();
        if claims.get(&kind).is_some_and(|claim| claim.token == token) {
            claims.remove(&kind);
            true
        } else {
            false
        }
    }
}

impl Default for DefaultSlots {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DefaultSlots {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefaultSlots")
            .field("claimed", &self.claims.read().len())
            .finish_non_exhaustive()
    }
}

/// The process-wide default slots.
#[must_use]
pub fn default_slots() -> &'static Arc<DefaultSlots> {
    static SLOTS: OnceLock<Arc<DefaultSlots>> = OnceLock::new();
    SLOTS.get_or_init(|| Arc::new(DefaultSlots::new()))
}

/// An arena that tried to become the default for its type at construction.
///
/// Derefs to the wrapped arena and is an [`Arena`] itself.
///
/// # Example
///
/// ```rust,ignore
/// let first = DefaultCandidate::new(HeapArena::new());
/// let second = DefaultCandidate::new(HeapArena::new());
/// assert!(first.is_default());
/// assert!(!second.is_default());
///
/// drop(first);
/// assert!(default_slots().current::<HeapArena>().is_none());
/// ```
pub struct DefaultCandidate<A: Arena + Send + Sync + 'static> {
    arena: A,
    token: u64,
    claimed: bool,
    slots: Arc<DefaultSlots>,
}

impl<A: Arena + Send + Sync + 'static> DefaultCandidate<A> {
    /// Wraps `arena`, claiming the process-wide default slot if it is free.
    #[must_use]
    pub fn new(arena: A) -> Arc<Self> {
        Self::new_in(Arc::clone(default_slots()), arena)
    }

    /// Wraps `arena`, claiming the default slot in `slots` if it is free.
    #[must_use]
    pub fn new_in(slots: Arc<DefaultSlots>, arena: A) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let token = slots.next_token.fetch_add(1, Ordering::Relaxed);
            let holder: Weak<dyn Any + Send + Sync> = weak.clone();
            let claimed = slots.try_claim(TypeId::of::<A>(), token, holder);
            tracing::debug!(
                arena = std::any::type_name::<A>(),
                token,
                claimed,
                "default allocator candidate constructed"
            );
            Self {
                arena,
                token,
                claimed,
                slots,
            }
        })
    }

    /// Whether this candidate is the current default.
    #[must_use]
    pub fn is_default(&self) -> bool {
        self.claimed && self.slots.holds(TypeId::of::<A>(), self.token)
    }

    /// The wrapped arena.
    #[inline]
    #[must_use]
    pub const fn arena(&self) -> &A {
        &self.arena
    }
}

impl<A: Arena + Send + Sync + 'static> Deref for DefaultCandidate<A> {
    type Target = A;

    fn deref(&self) -> &A {
        &self.arena
    }
}

impl<A: Arena + Send + Sync + 'static> Arena for DefaultCandidate<A> {
    #[inline]
    fn allocate(&self, request: AllocRequest<'_>) -> Option<NonNull<u8>> {
        self.arena.allocate(request)
    }

    #[inline]
    #[allow(unsafe_code)]
    unsafe fn deallocate(&self, ptr: Option<NonNull<u8>>, size: usize) -> ArenaResult<()> {
        // SAFETY: forwarded contract.
        unsafe { self.arena.deallocate(ptr, size) }
    }

    #[inline]
    fn max_size(&self) -> usize {
        self.arena.max_size()
    }

    #[inline]
    fn identity(&self) -> ArenaIdentity {
        self.arena.identity()
    }
}

impl<A: Arena + Send + Sync + 'static> Drop for DefaultCandidate<A> {
    fn drop(&mut self) {
        if self.claimed && self.slots.release(TypeId::of::<A>(), self.token) {
            tracing::debug!(
                arena = std::any::type_name::<A>(),
                token = self.token,
                "default allocator released"
            );
        }
    }
}

impl<A: Arena + Send + Sync + 'static> std::fmt::Debug for DefaultCandidate<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefaultCandidate")
            .field("token", &self.token)
            .field("claimed", &self.claimed)
            .finish_non_exhaustive()
    }
}
