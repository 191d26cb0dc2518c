//! Operation table tests, driven through the raw context the way native
//! extension code drives it.

mod common;

use std::ffi::CStr;
use std::sync::Arc;

use hbridge::host::{HostRuntime, MemoryHost};
use hbridge::{Bridge, BridgeOptions, Handle, HostRef, InvalidHandlePolicy, Singleton};

use common::{bridge, is_type, take_error};

#[test]
fn test_stale_handle_never_reaches_host() {
    let (host, bridge) = bridge();
    let ctx = bridge.context();
    unsafe {
        let list = ((*ctx).ctx_List_New)(ctx, 0);
        assert!(list.is_valid(), "List_New should succeed");
        ((*ctx).ctx_Close)(ctx, list);

        let before = host.invocations();
        let attr = ((*ctx).ctx_GetAttr_s)(ctx, list, c"append".as_ptr());
        let rc = ((*ctx).ctx_List_Append)(ctx, list, (*ctx).h_None);
        assert_eq!(host.invocations(), before, "host must not be called");
        assert!(!attr.is_valid(), "GetAttr_s should return the null handle");
        assert_eq!(rc, -1, "List_Append should fail");
    }
    let exc = take_error(&bridge);
    assert!(is_type(&exc, &host.singleton(Singleton::SystemError)));
}

#[test]
fn test_duplicate_then_close_original_keeps_list_usable() {
    let (host, bridge) = bridge();
    let ctx = bridge.context();
    unsafe {
        let h1 = ((*ctx).ctx_List_New)(ctx, 0);
        let h2 = ((*ctx).ctx_Dup)(ctx, h1);
        assert_ne!(h1, h2, "duplicate should be a distinct handle");
        ((*ctx).ctx_Close)(ctx, h1);

        let list = bridge.resolve(h2).expect("h2 should still resolve");
        let item = ((*ctx).ctx_Long_FromLong)(ctx, 7);
        assert_eq!(((*ctx).ctx_List_Append)(ctx, h2, item), 0);
        assert_eq!(host.list_items(&list).map(|v| v.len()), Some(1));

        let first = ((*ctx).ctx_GetItem_i)(ctx, h2, 0);
        assert_eq!(((*ctx).ctx_Long_AsLong)(ctx, first), 7);
        for h in [item, first, h2] {
            ((*ctx).ctx_Close)(ctx, h);
        }
    }
    assert!(!bridge.errors().occurred());
}

#[test]
fn test_read_only_attribute_fails_without_leaking() {
    let (host, bridge) = bridge();
    let ctx = bridge.context();
    let class = host.new_class("Point");
    let point = bridge
        .wrap(host.new_frozen_instance(&class))
        .expect("wrap should succeed");
    unsafe {
        let value = ((*ctx).ctx_Long_FromLong)(ctx, 3);
        let live = bridge.handles().live_count();

        let rc = ((*ctx).ctx_SetAttr_s)(ctx, point, c"x".as_ptr(), value);
        assert_eq!(rc, -1, "SetAttr_s should report failure");
        assert_eq!(bridge.handles().live_count(), live, "no handle leaked");
        let exc = take_error(&bridge);
        assert!(is_type(&exc, &host.attribute_error()));
        assert_eq!(
            host.exception_message(&exc.value).as_deref(),
            Some("'Point' object attribute 'x' is read-only")
        );
        ((*ctx).ctx_Close)(ctx, value);
    }
}

#[test]
fn test_set_attr_by_handle_fails_without_leaking() {
    let (host, bridge) = bridge();
    let ctx = bridge.context();
    let class = host.new_class("Point");
    let point = bridge.wrap(host.new_frozen_instance(&class)).unwrap();
    unsafe {
        let name = ((*ctx).ctx_Unicode_FromString)(ctx, c"x".as_ptr());
        let value = ((*ctx).ctx_Long_FromLong)(ctx, 3);
        let live = bridge.handles().live_count();

        let rc = ((*ctx).ctx_SetAttr)(ctx, point, name, value);
        assert_eq!(rc, -1, "SetAttr should report failure");
        assert_eq!(bridge.handles().live_count(), live, "no handle leaked");
        let exc = take_error(&bridge);
        assert!(is_type(&exc, &host.attribute_error()));

        let open = bridge.wrap(host.new_instance(&class)).unwrap();
        assert_eq!(((*ctx).ctx_SetAttr)(ctx, open, name, value), 0);
        assert_eq!(((*ctx).ctx_HasAttr)(ctx, open, name), 1);
        assert_eq!(((*ctx).ctx_HasAttr)(ctx, point, name), 0);
        assert_eq!(((*ctx).ctx_HasAttr)(ctx, open, value), 0, "a non-text name is just absent");
        assert!(!bridge.errors().occurred(), "HasAttr never leaves an error");

        let stored = host.peek_attr(&bridge.resolve(open).unwrap(), "x").unwrap();
        assert_eq!(host.int_value(&stored), Some(3));
        for h in [name, value, open, point] {
            ((*ctx).ctx_Close)(ctx, h);
        }
    }
}

#[test]
fn test_set_item_by_handle() {
    let (host, bridge) = bridge();
    let ctx = bridge.context();
    unsafe {
        let list = ((*ctx).ctx_List_New)(ctx, 3);
        let idx = ((*ctx).ctx_Long_FromLong)(ctx, -1);
        let value = ((*ctx).ctx_Unicode_FromString)(ctx, c"last".as_ptr());
        assert_eq!(((*ctx).ctx_SetItem)(ctx, list, idx, value), 0);
        let items = host.list_items(&bridge.resolve(list).unwrap()).unwrap();
        assert_eq!(host.str_value(&items[2]).as_deref(), Some("last"));

        let live = bridge.handles().live_count();
        assert_eq!(((*ctx).ctx_SetItem)(ctx, list, value, value), -1);
        assert_eq!(bridge.handles().live_count(), live);
        let exc = take_error(&bridge);
        assert!(is_type(&exc, &host.singleton(Singleton::TypeError)));

        let dict = ((*ctx).ctx_Dict_New)(ctx);
        assert_eq!(((*ctx).ctx_SetItem)(ctx, dict, value, idx), 0);
        assert_eq!(host.dict_len(&bridge.resolve(dict).unwrap()), Some(1));

        assert_eq!(((*ctx).ctx_SetItem)(ctx, value, idx, idx), -1, "text is immutable");
        take_error(&bridge);
        for h in [list, idx, value, dict] {
            ((*ctx).ctx_Close)(ctx, h);
        }
    }
}

#[test]
fn test_float_length_and_type_checks() {
    let (host, bridge) = bridge();
    let ctx = bridge.context();
    unsafe {
        let f = ((*ctx).ctx_Float_FromDouble)(ctx, 1.25);
        let n = ((*ctx).ctx_Long_FromLong)(ctx, 4);
        assert_eq!(((*ctx).ctx_Float_AsDouble)(ctx, f), 1.25);
        assert_eq!(((*ctx).ctx_Float_AsDouble)(ctx, n), 4.0, "integers widen");

        let list = ((*ctx).ctx_List_New)(ctx, 3);
        let dict = ((*ctx).ctx_Dict_New)(ctx);
        let text = ((*ctx).ctx_Unicode_FromString)(ctx, c"héllo".as_ptr());
        assert_eq!(((*ctx).ctx_Length)(ctx, list), 3);
        assert_eq!(((*ctx).ctx_Length)(ctx, dict), 0);
        assert_eq!(((*ctx).ctx_Length)(ctx, text), 5, "length counts characters");

        assert_eq!(((*ctx).ctx_Float_AsDouble)(ctx, text), -1.0);
        let exc = take_error(&bridge);
        assert!(is_type(&exc, &host.singleton(Singleton::TypeError)));
        assert_eq!(((*ctx).ctx_Length)(ctx, n), -1);
        let exc = take_error(&bridge);
        assert!(is_type(&exc, &host.singleton(Singleton::TypeError)));

        assert_eq!(((*ctx).ctx_Long_Check)(ctx, n), 1);
        assert_eq!(((*ctx).ctx_Long_Check)(ctx, f), 0);
        assert_eq!(((*ctx).ctx_List_Check)(ctx, list), 1);
        assert_eq!(((*ctx).ctx_List_Check)(ctx, dict), 0);
        assert_eq!(((*ctx).ctx_Dict_Check)(ctx, dict), 1);
        assert_eq!(((*ctx).ctx_Dict_Check)(ctx, text), 0);
        assert!(!bridge.errors().occurred(), "checks never raise");

        for h in [f, n, list, dict, text] {
            ((*ctx).ctx_Close)(ctx, h);
        }
        let before = host.invocations();
        assert_eq!(((*ctx).ctx_List_Check)(ctx, list), 0, "stale handles answer no");
        assert_eq!(((*ctx).ctx_Length)(ctx, list), -1);
        assert_eq!(host.invocations(), before);
        take_error(&bridge);
    }
}

#[test]
fn test_attribute_round_trip() {
    let (host, bridge) = bridge();
    let ctx = bridge.context();
    let class = host.new_class("Box");
    let obj = bridge.wrap(host.new_instance(&class)).unwrap();
    unsafe {
        let value = ((*ctx).ctx_Float_FromDouble)(ctx, 2.5);
        assert_eq!(((*ctx).ctx_SetAttr_s)(ctx, obj, c"size".as_ptr(), value), 0);
        assert_eq!(((*ctx).ctx_HasAttr_s)(ctx, obj, c"size".as_ptr()), 1);
        assert_eq!(((*ctx).ctx_HasAttr_s)(ctx, obj, c"colour".as_ptr()), 0);
        assert!(!bridge.errors().occurred(), "HasAttr never leaves an error");

        let name = ((*ctx).ctx_Unicode_FromString)(ctx, c"size".as_ptr());
        let got = ((*ctx).ctx_GetAttr)(ctx, obj, name);
        assert_eq!(host.float_value(&bridge.resolve(got).unwrap()), Some(2.5));

        let missing = ((*ctx).ctx_GetAttr_s)(ctx, obj, c"colour".as_ptr());
        assert!(!missing.is_valid());
        let exc = take_error(&bridge);
        assert!(is_type(&exc, &host.attribute_error()));
        for h in [value, name, got, obj] {
            ((*ctx).ctx_Close)(ctx, h);
        }
    }
}

#[test]
fn test_singletons_survive_close_and_duplicate() {
    let (host, bridge) = bridge();
    let ctx = bridge.context();
    unsafe {
        let none = (*ctx).h_None;
        ((*ctx).ctx_Close)(ctx, none);
        ((*ctx).ctx_Close)(ctx, none);
        assert_eq!(((*ctx).ctx_Dup)(ctx, none), none);
        let target = bridge.resolve(none).expect("None stays resolvable");
        assert!(target.ptr_eq(&host.singleton(Singleton::None)));

        assert!(bridge
            .resolve((*ctx).h_True)
            .unwrap()
            .ptr_eq(&host.singleton(Singleton::True)));
        assert!(bridge
            .resolve((*ctx).h_OverflowError)
            .unwrap()
            .ptr_eq(&host.singleton(Singleton::OverflowError)));
        assert_eq!(((*ctx).ctx_Object_IsTrue)(ctx, (*ctx).h_False), 0);
    }
    assert!(!bridge.errors().occurred());
}

#[test]
fn test_long_narrowing_overflow() {
    let (host, bridge) = bridge();
    let ctx = bridge.context();
    unsafe {
        let big = ((*ctx).ctx_Long_FromUnsignedLongLong)(ctx, u64::MAX);
        assert_eq!(((*ctx).ctx_Long_AsLong)(ctx, big), -1);
        assert_eq!(((*ctx).ctx_Err_Occurred)(ctx), 1);
        let exc = take_error(&bridge);
        assert!(is_type(&exc, &host.singleton(Singleton::OverflowError)));

        let minus_one = ((*ctx).ctx_Long_FromLongLong)(ctx, -1);
        assert_eq!(((*ctx).ctx_Long_AsLong)(ctx, minus_one), -1);
        assert_eq!(((*ctx).ctx_Err_Occurred)(ctx), 0, "-1 is a real value here");
        ((*ctx).ctx_Close)(ctx, big);
        ((*ctx).ctx_Close)(ctx, minus_one);
    }
}

#[test]
fn test_number_add_relays_host_errors() {
    let (host, bridge) = bridge();
    let ctx = bridge.context();
    unsafe {
        let a = ((*ctx).ctx_Long_FromLong)(ctx, 2);
        let b = ((*ctx).ctx_Long_FromLong)(ctx, 3);
        let sum = ((*ctx).ctx_Number_Add)(ctx, a, b);
        assert_eq!(((*ctx).ctx_Long_AsLong)(ctx, sum), 5);

        let list = ((*ctx).ctx_List_New)(ctx, 0);
        assert!(!((*ctx).ctx_Number_Add)(ctx, a, list).is_valid());
        let exc = take_error(&bridge);
        assert!(is_type(&exc, &host.singleton(Singleton::TypeError)));
        assert_eq!(
            host.exception_message(&exc.value).as_deref(),
            Some("unsupported operand type(s) for +: 'int' and 'list'"),
            "the host's message is relayed unchanged"
        );
        for h in [a, b, sum, list] {
            ((*ctx).ctx_Close)(ctx, h);
        }
    }
}

#[test]
fn test_error_set_fetch_clear() {
    let (host, bridge) = bridge();
    let ctx = bridge.context();
    unsafe {
        assert_eq!(((*ctx).ctx_Err_Occurred)(ctx), 0);
        assert!(!((*ctx).ctx_Err_Fetch)(ctx).is_valid());

        ((*ctx).ctx_Err_SetString)(ctx, (*ctx).h_ValueError, c"bad value".as_ptr());
        assert_eq!(((*ctx).ctx_Err_Occurred)(ctx), 1);
        let exc = ((*ctx).ctx_Err_Fetch)(ctx);
        assert!(exc.is_valid(), "Fetch returns the exception");
        assert_eq!(((*ctx).ctx_Err_Occurred)(ctx), 0, "Fetch clears");
        let value = bridge.resolve(exc).unwrap();
        assert_eq!(host.exception_message(&value).as_deref(), Some("bad value"));
        ((*ctx).ctx_Close)(ctx, exc);

        ((*ctx).ctx_Err_SetString)(ctx, (*ctx).h_TypeError, c"again".as_ptr());
        ((*ctx).ctx_Err_Clear)(ctx);
        assert_eq!(((*ctx).ctx_Err_Occurred)(ctx), 0);
    }
}

#[test]
fn test_errors_are_isolated_between_contexts() {
    let (_, first) = bridge();
    let (_, second) = bridge();
    let a = first.context();
    let b = second.context();
    unsafe {
        ((*a).ctx_Err_SetString)(a, (*a).h_ValueError, c"only here".as_ptr());
        assert_eq!(((*a).ctx_Err_Occurred)(a), 1);
        assert_eq!(((*b).ctx_Err_Occurred)(b), 0);
        ((*a).ctx_Err_Clear)(a);
    }
}

#[test]
fn test_bytes_pinned_until_handle_closed() {
    let (host, bridge) = bridge();
    let ctx = bridge.context();
    let bytes = host.from_bytes(b"payload").unwrap();
    let h = bridge.wrap(bytes.clone()).unwrap();
    unsafe {
        assert_eq!(((*ctx).ctx_Bytes_Check)(ctx, h), 1);
        assert_eq!(((*ctx).ctx_Bytes_Size)(ctx, h), 7);
        let data = ((*ctx).ctx_Bytes_AsString)(ctx, h);
        assert!(!data.is_null());
        assert_eq!(((*ctx).ctx_Bytes_AS_STRING)(ctx, h), data, "one pin per handle");
        assert_eq!(host.pin_count(&bytes), 1);

        host.compact();
        assert_eq!(CStr::from_ptr(data).to_bytes(), b"payload");

        ((*ctx).ctx_Close)(ctx, h);
    }
    assert_eq!(host.pin_count(&bytes), 0, "closing the handle unpins");
    assert!(host.compact() >= 1, "the unpinned string may move again");
}

#[test]
fn test_bytes_accessors_reject_other_types() {
    let (host, bridge) = bridge();
    let ctx = bridge.context();
    unsafe {
        let text = ((*ctx).ctx_Unicode_FromString)(ctx, c"text".as_ptr());
        assert_eq!(((*ctx).ctx_Bytes_Check)(ctx, text), 0);
        assert_eq!(((*ctx).ctx_Unicode_Check)(ctx, text), 1);
        assert!(((*ctx).ctx_Bytes_AsString)(ctx, text).is_null());
        let exc = take_error(&bridge);
        assert!(is_type(&exc, &host.singleton(Singleton::TypeError)));
        assert_eq!(
            host.exception_message(&exc.value).as_deref(),
            Some("expected bytes, str found")
        );
        assert_eq!(((*ctx).ctx_Bytes_Size)(ctx, text), -1);
        take_error(&bridge);

        let encoded = ((*ctx).ctx_Unicode_AsUTF8String)(ctx, text);
        assert_eq!(((*ctx).ctx_Bytes_GET_SIZE)(ctx, encoded), 4);
        ((*ctx).ctx_Close)(ctx, encoded);
        ((*ctx).ctx_Close)(ctx, text);
    }
}

#[test]
fn test_unicode_from_wide_char() {
    let (host, bridge) = bridge();
    let ctx = bridge.context();
    let wide: Vec<libc::wchar_t> = "h\u{e9}llo\0"
        .chars()
        .map(|c| c as libc::wchar_t)
        .collect();
    unsafe {
        let all = ((*ctx).ctx_Unicode_FromWideChar)(ctx, wide.as_ptr(), -1);
        let two = ((*ctx).ctx_Unicode_FromWideChar)(ctx, wide.as_ptr(), 2);
        assert_eq!(host.str_value(&bridge.resolve(all).unwrap()).as_deref(), Some("h\u{e9}llo"));
        assert_eq!(host.str_value(&bridge.resolve(two).unwrap()).as_deref(), Some("h\u{e9}"));
        ((*ctx).ctx_Close)(ctx, all);
        ((*ctx).ctx_Close)(ctx, two);
    }
}

#[test]
fn test_items_and_dicts() {
    let (host, bridge) = bridge();
    let ctx = bridge.context();
    unsafe {
        let dict = ((*ctx).ctx_Dict_New)(ctx);
        let one = ((*ctx).ctx_Long_FromLong)(ctx, 1);
        assert_eq!(((*ctx).ctx_SetItem_s)(ctx, dict, c"one".as_ptr(), one), 0);
        let key = ((*ctx).ctx_Unicode_FromString)(ctx, c"one".as_ptr());
        let got = ((*ctx).ctx_Dict_GetItem)(ctx, dict, key);
        assert_eq!(((*ctx).ctx_Long_AsLong)(ctx, got), 1);

        let two = ((*ctx).ctx_Long_FromLong)(ctx, 2);
        assert_eq!(((*ctx).ctx_Dict_SetItem)(ctx, dict, key, two), 0);
        let again = ((*ctx).ctx_GetItem_s)(ctx, dict, c"one".as_ptr());
        assert_eq!(((*ctx).ctx_Long_AsLong)(ctx, again), 2);

        let missing = ((*ctx).ctx_GetItem_s)(ctx, dict, c"two".as_ptr());
        assert!(!missing.is_valid());
        let exc = take_error(&bridge);
        assert!(is_type(&exc, &host.key_error()));

        let list = ((*ctx).ctx_List_New)(ctx, 2);
        assert_eq!(((*ctx).ctx_SetItem_i)(ctx, list, 1, two), 0);
        assert_eq!(((*ctx).ctx_SetItem_i)(ctx, list, 5, two), -1);
        let exc = take_error(&bridge);
        assert!(is_type(&exc, &host.index_error()));
        let idx = ((*ctx).ctx_Long_FromLong)(ctx, 1);
        let second = ((*ctx).ctx_GetItem)(ctx, list, idx);
        assert_eq!(((*ctx).ctx_Long_AsLong)(ctx, second), 2);

        assert!(!((*ctx).ctx_List_New)(ctx, -1).is_valid());
        let exc = take_error(&bridge);
        assert!(is_type(&exc, &host.singleton(Singleton::ValueError)));

        for h in [dict, one, key, got, two, again, list, idx, second] {
            ((*ctx).ctx_Close)(ctx, h);
        }
    }
}

#[test]
fn test_call_with_positional_and_keywords() {
    let (host, bridge) = bridge();
    let ctx = bridge.context();
    let inner = Arc::clone(&host);
    let func = host.new_function("count", move |args, kwargs| {
        let extra = kwargs
            .and_then(|kw| inner.dict_len(kw))
            .unwrap_or(0);
        inner.from_i64((args.len() + extra) as i64)
    });
    let f = bridge.wrap(func).unwrap();
    unsafe {
        let a = ((*ctx).ctx_Long_FromLong)(ctx, 1);
        let args = [a, a, a];
        let r = ((*ctx).ctx_Call)(ctx, f, args.as_ptr(), 3, Handle::NULL);
        assert_eq!(((*ctx).ctx_Long_AsLong)(ctx, r), 3);

        let kw = ((*ctx).ctx_Dict_New)(ctx);
        assert_eq!(((*ctx).ctx_SetItem_s)(ctx, kw, c"k".as_ptr(), a), 0);
        let r2 = ((*ctx).ctx_Call)(ctx, f, args.as_ptr(), 1, kw);
        assert_eq!(((*ctx).ctx_Long_AsLong)(ctx, r2), 2);

        assert!(!((*ctx).ctx_Call)(ctx, a, args.as_ptr(), 0, Handle::NULL).is_valid());
        let exc = take_error(&bridge);
        assert!(is_type(&exc, &host.singleton(Singleton::TypeError)));

        for h in [a, r, kw, r2, f] {
            ((*ctx).ctx_Close)(ctx, h);
        }
    }
}

#[test]
fn test_truthiness_dispatches_to_host() {
    let (host, bridge) = bridge();
    let ctx = bridge.context();
    let class = host.new_class("Falsy");
    let inner = Arc::clone(&host);
    host.set_class_attr(
        &class,
        "__bool__",
        host.new_function("__bool__", move |_, _| Ok(inner.singleton(Singleton::False))),
    );
    let broken = host.new_class("Broken");
    let inner = Arc::clone(&host);
    host.set_class_attr(
        &broken,
        "__bool__",
        host.new_function("__bool__", move |_, _| inner.from_i64(1)),
    );
    let falsy = bridge.wrap(host.new_instance(&class)).unwrap();
    let bad = bridge.wrap(host.new_instance(&broken)).unwrap();
    unsafe {
        assert_eq!(((*ctx).ctx_Object_IsTrue)(ctx, falsy), 0);
        assert_eq!(((*ctx).ctx_Object_IsTrue)(ctx, bad), -1);
        let exc = take_error(&bridge);
        assert!(is_type(&exc, &host.singleton(Singleton::TypeError)));
    }
}

#[test]
fn test_context_version_and_layout() {
    let (_, bridge) = bridge();
    let ctx = bridge.context();
    let version = unsafe { hbridge::context_version(ctx) };
    assert_eq!(hbridge::version::unpack(version), (1, 1));
}

#[test]
#[should_panic(expected = "bad handle")]
fn test_trap_policy_panics_on_stale_handle() {
    let host = Arc::new(MemoryHost::new());
    let opts = BridgeOptions {
        invalid_handle: InvalidHandlePolicy::Trap,
        ..Default::default()
    };
    let bridge = Bridge::with_options(host, opts).unwrap();
    let h = bridge.wrap(HostRef::new(1u32)).unwrap();
    bridge.close(h).unwrap();
    bridge.resolve_arg(h);
}

#[test]
fn test_exhaustion_reports_memory_error() {
    let host = Arc::new(MemoryHost::new());
    let opts = BridgeOptions {
        max_handles: 10,
        shards: 1,
        invalid_handle: InvalidHandlePolicy::Report,
    };
    let bridge = Bridge::with_options(host.clone(), opts).unwrap();
    let ctx = bridge.context();
    unsafe {
        let a = ((*ctx).ctx_Long_FromLong)(ctx, 1);
        let b = ((*ctx).ctx_Long_FromLong)(ctx, 2);
        assert!(a.is_valid() && b.is_valid(), "8 singletons + 2 fit");
        let c = ((*ctx).ctx_Long_FromLong)(ctx, 3);
        assert!(!c.is_valid());
        let exc = take_error(&bridge);
        assert!(is_type(&exc, &host.singleton(Singleton::MemoryError)));

        ((*ctx).ctx_Close)(ctx, a);
        let d = ((*ctx).ctx_Long_FromLong)(ctx, 4);
        assert!(d.is_valid(), "a freed slot is reusable");
        ((*ctx).ctx_Close)(ctx, b);
        ((*ctx).ctx_Close)(ctx, d);
    }
}
