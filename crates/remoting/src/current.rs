//! Channel scope for synchronous (de)serialization
//!
//! Remote references and pipes only make sense relative to a channel, so
//! their serde impls look up the channel that is currently encoding or
//! decoding on this thread. A scope never lives across an `.await`.

use crate::Channel;
use remoting_proto::ObjectId;
use std::cell::{Cell, RefCell};
use std::marker::PhantomData;
use std::rc::Rc;

/// Exports made while recording, released together once the call completes
pub(crate) type Recording = Rc<RefCell<Vec<ObjectId>>>;

#[derive(Clone)]
pub(crate) struct Scope {
    pub channel: Channel,
    pub recording: Option<Recording>,
    /// Counted references written or read, one entry per count
    pub counted: Option<Recording>,
    pub created_at: Option<String>,
}

thread_local! {
    static SCOPES: RefCell<Vec<(u64, Scope)>> = const { RefCell::new(Vec::new()) };
    static NEXT_SCOPE: Cell<u64> = const { Cell::new(0) };
}

/// Removes the scope it pushed when dropped
pub(crate) struct ScopeGuard {
    id: u64,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        SCOPES.with(|scopes| {
            let mut scopes = scopes.borrow_mut();
            if let Some(index) = scopes.iter().rposition(|(id, _)| *id == self.id) {
                scopes.remove(index);
            }
        });
    }
}

pub(crate) fn enter(scope: Scope) -> ScopeGuard {
    let id = NEXT_SCOPE.with(|next| {
        let id = next.get();
        next.set(id.wrapping_add(1));
        id
    });
    SCOPES.with(|scopes| scopes.borrow_mut().push((id, scope)));
    ScopeGuard {
        id,
        _not_send: PhantomData,
    }
}

pub(crate) fn current() -> Option<Scope> {
    SCOPES.with(|scopes| scopes.borrow().last().map(|(_, scope)| scope.clone()))
}

/// Note one counted reference in the innermost scope, if it keeps a tally
pub(crate) fn count(oid: ObjectId) {
    SCOPES.with(|scopes| {
        if let Some(counted) = scopes.borrow().last().and_then(|(_, scope)| scope.counted.as_ref()) {
            counted.borrow_mut().push(oid);
        }
    });
}

pub(crate) fn with_scope<R>(scope: Scope, f: impl FnOnce() -> R) -> R {
    let _guard = enter(scope);
    f()
}
