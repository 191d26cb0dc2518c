//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use hbridge::host::MemoryHost;
use hbridge::{Bridge, BridgeOptions, HostException, HostRef, InvalidHandlePolicy};

/// A bridge over a fresh in-memory host that reports bad handles instead of
/// trapping, so tests can observe the pending error.
pub fn bridge() -> (Arc<MemoryHost>, Bridge) {
    let host = Arc::new(MemoryHost::new());
    let opts = BridgeOptions {
        invalid_handle: InvalidHandlePolicy::Report,
        ..Default::default()
    };
    let bridge = Bridge::with_options(host.clone(), opts).expect("bridge creation should succeed");
    (host, bridge)
}

/// Take the pending error, failing the test if there is none.
pub fn take_error(bridge: &Bridge) -> HostException {
    bridge
        .errors()
        .take()
        .expect("an error should be pending")
}

/// Whether `exc` is of exactly type `ty`.
pub fn is_type(exc: &HostException, ty: &HostRef) -> bool {
    exc.exc_type.ptr_eq(ty)
}
