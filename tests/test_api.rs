//! ABI version, options and context construction tests.

use std::sync::Arc;

use hbridge::host::{HostRuntime, MemoryHost};
use hbridge::types::{ENV_MAX_HANDLES, ENV_SHARDS};
use hbridge::{version, Bridge, BridgeOptions, InvalidHandlePolicy, Singleton};

#[test]
fn test_api_version() {
    let version = hbridge::api_version();
    assert_eq!(version, "1.1", "Expected ABI version 1.1, got {}", version);
}

#[test]
fn test_api_version_compatible() {
    // Compatible versions
    assert!(
        hbridge::api_version_compatible(1, 1),
        "1.1 should be compatible"
    );
    assert!(
        hbridge::api_version_compatible(1, 0),
        "1.0 should be compatible"
    );

    // Incompatible versions
    assert!(
        !hbridge::api_version_compatible(2, 0),
        "2.0 should NOT be compatible"
    );
    assert!(
        !hbridge::api_version_compatible(1, 99),
        "1.99 should NOT be compatible"
    );
}

#[test]
fn test_context_carries_version_and_singletons() {
    let host = Arc::new(MemoryHost::new());
    let bridge = Bridge::new(host.clone()).expect("bridge creation should succeed");
    let ctx = bridge.context();
    unsafe {
        assert_eq!((*ctx).ctx_version, version::packed());
        let handles = [
            ((*ctx).h_None, Singleton::None),
            ((*ctx).h_True, Singleton::True),
            ((*ctx).h_False, Singleton::False),
            ((*ctx).h_ValueError, Singleton::ValueError),
            ((*ctx).h_TypeError, Singleton::TypeError),
            ((*ctx).h_MemoryError, Singleton::MemoryError),
            ((*ctx).h_SystemError, Singleton::SystemError),
            ((*ctx).h_OverflowError, Singleton::OverflowError),
        ];
        for (h, which) in handles {
            assert_eq!(bridge.singleton(which), h);
            let target = bridge.resolve(h).expect("singleton should resolve");
            assert!(target.ptr_eq(&host.singleton(which)), "{which:?} mismatch");
        }
    }
    assert_eq!(bridge.handles().live_count(), Singleton::ALL.len());
}

#[test]
fn test_two_contexts_do_not_share_handles() {
    let host = Arc::new(MemoryHost::new());
    let first = Bridge::new(host.clone()).unwrap();
    let second = Bridge::new(host.clone()).unwrap();
    let h = first.wrap(host.from_i64(5).unwrap()).unwrap();
    assert!(first.resolve(h).is_ok());
    assert!(
        second.handles().live_count() == Singleton::ALL.len(),
        "the second table is untouched"
    );
}

#[test]
fn test_options_validation() {
    let host = Arc::new(MemoryHost::new());
    let bad = BridgeOptions {
        shards: 5,
        ..Default::default()
    };
    assert!(Bridge::with_options(host.clone(), bad).is_err());

    let tiny = BridgeOptions {
        max_handles: 4,
        shards: 1,
        invalid_handle: InvalidHandlePolicy::Report,
    };
    let err = Bridge::with_options(host, tiny)
        .err()
        .expect("singletons alone exceed the capacity");
    assert!(err.is_exhausted());
}

#[test]
fn test_options_from_env() {
    std::env::set_var(ENV_MAX_HANDLES, "4096");
    std::env::set_var(ENV_SHARDS, "not a number");
    let opts = BridgeOptions::from_env();
    std::env::remove_var(ENV_MAX_HANDLES);
    std::env::remove_var(ENV_SHARDS);
    assert_eq!(opts.max_handles, 4096);
    assert_eq!(opts.shards, 16, "unparseable values fall back to the default");
}
