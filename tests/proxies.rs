//! Descriptor, C++ operator and realloc proxies against the global service.

use std::{ffi::CString, ptr};

use leakhook::{proxy, service, Config, FdLeak, ALL_LIBRARIES};
use serial_test::serial;

fn start() {
    service::init(&Config::default()).unwrap();
    service::reset_stats().unwrap();
    service::fd_reset_stats().unwrap();
}

#[test]
#[serial]
fn open_and_fopen_are_tracked_until_closed() {
    start();
    assert_eq!(service::fd_hook(&[ALL_LIBRARIES]).unwrap(), 6);

    let dir = tempfile::tempdir().unwrap();
    let created = CString::new(dir.path().join("created").to_str().unwrap()).unwrap();
    let streamed = CString::new(dir.path().join("streamed").to_str().unwrap()).unwrap();
    let mode = CString::new("w+").unwrap();

    let fd = unsafe {
        proxy::open_proxy(created.as_ptr(), libc::O_CREAT | libc::O_WRONLY, 0o600)
    };
    assert!(fd >= 0);
    let stream = unsafe { proxy::fopen_proxy(streamed.as_ptr(), mode.as_ptr()) };
    assert!(!stream.is_null());

    let stats = service::fd_stats().unwrap();
    assert_eq!(stats.total_open_count, 2);
    assert_eq!(stats.current_open_count, 2);

    let mut leaks: Vec<FdLeak> = serde_json::from_str(&service::fd_leaks_json().unwrap()).unwrap();
    leaks.sort_by_key(|l| l.path.clone());
    assert_eq!(leaks[0].path, created.to_str().unwrap());
    assert_eq!(leaks[0].fd, fd);
    assert_eq!(leaks[1].flags, libc::O_RDWR);

    let report = service::fd_report().unwrap();
    assert!(report.contains("Currently open: 2"));
    assert!(report.contains(&format!("FD={}, Path={}", fd, created.to_str().unwrap())));

    assert_eq!(unsafe { proxy::close_proxy(fd) }, 0);
    assert_eq!(unsafe { proxy::fclose_proxy(stream) }, 0);
    let stats = service::fd_stats().unwrap();
    assert_eq!(stats.total_close_count, 2);
    assert_eq!(stats.current_open_count, 0);
    assert!(service::fd_report()
        .unwrap()
        .contains("No file descriptor leaks detected."));

    let path = dir.path().join("fds.txt");
    service::fd_dump_report(&path).unwrap();
    assert!(std::fs::read_to_string(&path)
        .unwrap()
        .starts_with("=== File Descriptor Leak Report ==="));

    assert_eq!(service::fd_unhook_all().unwrap(), 6);
    service::teardown();
}

#[test]
#[serial]
fn failed_open_is_not_tracked() {
    start();
    let missing = CString::new("/nonexistent/leakhook/file").unwrap();
    let fd = unsafe { proxy::open_proxy(missing.as_ptr(), libc::O_RDONLY, 0) };
    assert_eq!(fd, -1);
    let read = CString::new("r").unwrap();
    let stream = unsafe { proxy::fopen_proxy(missing.as_ptr(), read.as_ptr()) };
    assert!(stream.is_null());
    assert_eq!(service::fd_stats().unwrap().total_open_count, 0);
    service::teardown();
}

#[test]
#[serial]
fn fortified_open_and_open64() {
    start();
    let null = CString::new("/dev/null").unwrap();
    let a = unsafe { proxy::open2_proxy(null.as_ptr(), libc::O_RDONLY) };
    let b = unsafe { proxy::open64_proxy(null.as_ptr(), libc::O_RDONLY, 0) };
    assert!(a >= 0 && b >= 0);
    assert_eq!(service::fd_stats().unwrap().current_open_count, 2);
    unsafe {
        proxy::close_proxy(a);
        proxy::close_proxy(b);
    }
    assert_eq!(service::fd_stats().unwrap().current_open_count, 0);
    service::teardown();
}

#[test]
#[serial]
fn cxx_operators_are_tracked() {
    start();
    unsafe {
        let single = proxy::new_proxy(40);
        let array = proxy::new_array_proxy(80);
        let sized = proxy::new_proxy(16);
        let sized_array = proxy::new_array_proxy(32);
        let stats = service::stats().unwrap();
        assert_eq!(stats.current_alloc_count, 4);
        assert_eq!(stats.current_alloc_size, 168);

        proxy::delete_proxy(single);
        proxy::delete_array_proxy(array);
        proxy::sized_delete_proxy(sized, 16);
        proxy::sized_delete_array_proxy(sized_array, 32);
    }
    let stats = service::stats().unwrap();
    assert_eq!(stats.total_free_count, 4);
    assert_eq!(stats.current_alloc_count, 0);
    service::teardown();
}

#[test]
#[serial]
fn realloc_moves_the_record() {
    start();
    unsafe {
        let p = proxy::malloc_proxy(16);
        let q = proxy::realloc_proxy(p, 4096);
        assert!(!q.is_null());
        let stats = service::stats().unwrap();
        assert_eq!(stats.total_alloc_count, 2);
        assert_eq!(stats.total_free_count, 1);
        assert_eq!(stats.current_alloc_count, 1);
        assert_eq!(stats.current_alloc_size, 4096);

        // realloc(NULL, n) behaves like malloc.
        let r = proxy::realloc_proxy(ptr::null_mut(), 8);
        assert_eq!(service::stats().unwrap().current_alloc_count, 2);
        proxy::free_proxy(q);
        proxy::free_proxy(r);
    }
    assert_eq!(service::stats().unwrap().current_alloc_count, 0);
    service::teardown();
}

#[test]
#[serial]
fn calloc_records_the_product() {
    start();
    unsafe {
        let p = proxy::calloc_proxy(12, 10);
        assert_eq!(service::stats().unwrap().current_alloc_size, 120);
        proxy::free_proxy(p);
        // Freeing something never tracked changes nothing.
        let untracked = leakhook::real::malloc(8);
        proxy::free_proxy(untracked);
    }
    let stats = service::stats().unwrap();
    assert_eq!(stats.total_free_count, 1);
    service::teardown();
}
