// Adopted from
// https://github.com/alexcrichton/dlmalloc-rs/blob/master/tests/global.rs

use segalloc::{DefaultMemory, LockedSegAlloc};
use std::collections::HashMap;
use std::thread;

#[global_allocator]
static A: LockedSegAlloc<DefaultMemory> = LockedSegAlloc::INIT;

#[test]
fn foo() {
    println!("hello");
}

#[test]
fn map() {
    let mut m = HashMap::new();
    m.insert(1, 2);
    m.insert(5, 3);
    drop(m);
}

#[test]
fn strings() {
    let s = format!("foo, bar, {}", "baz");
    assert_eq!(s.len(), 13);
}

#[test]
fn over_aligned_values() {
    #[repr(align(128))]
    struct Padded([u8; 200]);

    let boxes: Vec<Box<Padded>> = (0..32).map(|i| Box::new(Padded([i as u8; 200]))).collect();
    for (i, b) in boxes.iter().enumerate() {
        assert_eq!(&**b as *const Padded as usize % 128, 0);
        assert!(b.0.iter().all(|x| *x == i as u8));
    }
}

#[test]
fn threads() {
    assert!(thread::spawn(|| panic!()).join().is_err());
}

#[test]
fn vectors_grow_in_place_of_old_ones() {
    let mut v = Vec::new();
    for i in 0..100_000u32 {
        v.push(i);
    }
    assert_eq!(v.iter().map(|x| *x as u64).sum::<u64>(), 4_999_950_000);
    v.truncate(10);
    v.shrink_to_fit();
    assert_eq!(v, (0..10).collect::<Vec<_>>());
}

#[test]
fn zeroed_allocations_are_zero() {
    let v = vec![0u64; 10_000];
    assert!(v.iter().all(|x| *x == 0));
}

#[test]
fn heap_stays_consistent() {
    let boxes: Vec<Box<[u8]>> = (1..200).map(|n| vec![n as u8; n * 7].into_boxed_slice()).collect();
    for (n, b) in boxes.iter().enumerate() {
        assert!(b.iter().all(|x| *x == (n + 1) as u8));
    }
    drop(boxes);
    // Nothing may allocate while the lock is held.
    let valid = A.lock().validate().is_ok();
    assert!(valid);
}
