use cfg_if::cfg_if;
use quickcheck::{Arbitrary, Gen};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use segalloc::{AllocError, LockedSegAlloc, Memory, SegAlloc, CHUNK_SIZE};
use std::fs;
use std::path::Path;
use std::ptr::NonNull;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    // Allocate this many bytes.
    Alloc(usize),

    // Free the n^th allocation we've made, or no-op if it has already been
    // freed.
    Free(usize),

    // Resize the n^th allocation to this many bytes. Resizing a freed
    // allocation allocates it anew; resizing to zero frees it.
    Realloc(usize, usize),

    // Allocate a zeroed array of this many elements of this size.
    Calloc(usize, usize),
}

pub use Operation::*;

/// The largest request the generator makes.
pub const MAX_ALLOC: usize = 4 * CHUNK_SIZE;

impl Operation {
    fn arbitrary_size<R: Rng>(rng: &mut R) -> usize {
        // Zero sized allocation 1/1000 times.
        if rng.gen_bool(0.001) {
            return 0;
        }

        // Do a large allocation with probability P = 1/20.
        if rng.gen_bool(0.05) {
            return rng.gen_range(CHUNK_SIZE / 2..=MAX_ALLOC);
        }

        // Mini blocks hold up to 8 bytes; make sure they show up often.
        match rng.gen_range(0..4) {
            0 => rng.gen_range(1..=8),
            1 => rng.gen_range(9..=64),
            _ => rng.gen_range(65..=1024),
        }
    }

    #[inline]
    fn arbitrary_alloc<R: Rng>(rng: &mut R, active_allocs: &mut Vec<usize>, num_allocs: &mut usize) -> Self {
        active_allocs.push(*num_allocs);
        *num_allocs += 1;

        // Zeroed array allocation with probability P = 1/10.
        if rng.gen_bool(0.1) {
            let size = rng.gen_range(1..=16);
            let count = Self::arbitrary_size(rng) / size;
            return Calloc(count, size);
        }

        Alloc(Self::arbitrary_size(rng))
    }

    #[inline]
    fn arbitrary_free<R: Rng>(rng: &mut R, active_allocs: &mut Vec<usize>) -> Self {
        assert!(!active_allocs.is_empty());
        let i = rng.gen_range(0..active_allocs.len());
        Free(active_allocs.swap_remove(i))
    }

    #[inline]
    fn arbitrary_realloc<R: Rng>(rng: &mut R, active_allocs: &[usize]) -> Self {
        assert!(!active_allocs.is_empty());
        let i = rng.gen_range(0..active_allocs.len());
        Realloc(active_allocs[i], Self::arbitrary_size(rng))
    }
}

fn parse_args(s: &str, name: &str) -> Option<Vec<usize>> {
    let args = s.strip_prefix(name)?.strip_prefix('(')?.strip_suffix("),")?;
    args.split(',').map(|a| a.trim().parse().ok()).collect()
}

impl FromStr for Operation {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        let s = s.trim();
        if let Some(args) = parse_args(s, "Alloc") {
            if let &[n] = args.as_slice() {
                return Ok(Alloc(n));
            }
        }
        if let Some(args) = parse_args(s, "Free") {
            if let &[i] = args.as_slice() {
                return Ok(Free(i));
            }
        }
        if let Some(args) = parse_args(s, "Realloc") {
            if let &[i, n] = args.as_slice() {
                return Ok(Realloc(i, n));
            }
        }
        if let Some(args) = parse_args(s, "Calloc") {
            if let &[count, size] = args.as_slice() {
                return Ok(Calloc(count, size));
            }
        }
        Err(())
    }
}

#[derive(Debug, Clone)]
pub struct Operations(pub Vec<Operation>);

impl FromStr for Operations {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        let mut ops = vec![];
        for line in s.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            ops.push(line.parse()?);
        }
        Ok(Operations(ops))
    }
}

#[cfg(feature = "extra_assertions")]
const NUM_OPERATIONS: usize = 1_000;

#[cfg(not(feature = "extra_assertions"))]
const NUM_OPERATIONS: usize = 5_000;

impl Arbitrary for Operations {
    #[inline(never)]
    fn arbitrary(g: &mut Gen) -> Self {
        // Our tests would spend more time in quickcheck's generator than in
        // the allocator. Seed a fast RNG from it instead.
        let mut rng = StdRng::seed_from_u64(u64::arbitrary(g));
        let rng = &mut rng;

        let mut num_allocs = 0;
        let mut active_allocs = vec![];
        let mut operations = Vec::with_capacity(NUM_OPERATIONS);

        for _ in 0..NUM_OPERATIONS {
            if !active_allocs.is_empty() && rng.gen_bool(0.05) {
                operations.push(Operation::arbitrary_realloc(rng, &active_allocs));
            } else if !active_allocs.is_empty() && rng.gen_bool(0.4) {
                operations.push(Operation::arbitrary_free(rng, &mut active_allocs));
            } else {
                operations.push(Operation::arbitrary_alloc(rng, &mut active_allocs, &mut num_allocs));
            }
        }

        operations.reserve_exact(active_allocs.len());
        while !active_allocs.is_empty() {
            operations.push(Operation::arbitrary_free(rng, &mut active_allocs));
        }

        Operations(operations)
    }

    #[inline(never)]
    fn shrink(&self) -> Box<dyn Iterator<Item = Self>> {
        let ops = self.0.clone();
        let prefixes = (0..self.0.len()).map(move |i| Operations(ops.iter().cloned().take(i).collect()));

        let other_indices: Vec<_> = self
            .0
            .iter()
            .enumerate()
            .filter_map(|(i, op)| match *op {
                Free(_) | Realloc(..) => Some(i),
                _ => None,
            })
            .collect();

        let ops = self.0.clone();
        let without_others = other_indices.into_iter().map(move |i| {
            Operations(
                ops.iter()
                    .enumerate()
                    .filter_map(|(j, op)| if i == j { None } else { Some(*op) })
                    .collect(),
            )
        });

        let ops = self.0.clone();
        let smaller_allocs = (0..self.0.len())
            .filter(|&i| matches!(self.0[i], Alloc(n) if n > 0))
            .collect::<Vec<_>>()
            .into_iter()
            .map(move |i| {
                let mut ops = ops.clone();
                if let Alloc(n) = ops[i] {
                    ops[i] = Alloc(n / 2);
                }
                Operations(ops)
            });

        Box::new(prefixes.chain(without_others).chain(smaller_allocs))
    }
}

/// Fill a payload with a byte pattern unique to allocation `id`.
fn fill(ptr: NonNull<u8>, len: usize, id: usize) {
    for i in 0..len {
        unsafe {
            *ptr.as_ptr().add(i) = (id.wrapping_mul(31).wrapping_add(i)) as u8;
        }
    }
}

/// Check the first `len` bytes of a payload against `fill`'s pattern.
fn check(ptr: NonNull<u8>, len: usize, id: usize) {
    for i in 0..len {
        let byte = unsafe { *ptr.as_ptr().add(i) };
        assert_eq!(
            byte,
            (id.wrapping_mul(31).wrapping_add(i)) as u8,
            "allocation {} was clobbered at byte {}",
            id,
            i
        );
    }
}

/// How thoroughly to check the heap while replaying operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checking {
    /// Validate the heap and every live payload after each operation.
    Full,
    /// Just run the operations.
    None,
}

cfg_if! {
    if #[cfg(feature = "static_array_backend")] {
        /// The memory the single threaded tests run on.
        pub type TestMemory = segalloc::DefaultMemory;

        // The static array is too big for the stack, so every test shares it.
        static TEST_HEAP: LockedSegAlloc<TestMemory> = LockedSegAlloc::INIT;

        /// Run `f` on the shared test heap.
        pub fn with_test_heap<T>(f: impl FnOnce(&mut SegAlloc<TestMemory>) -> T) -> T {
            f(&mut TEST_HEAP.lock())
        }

        /// Run `f` on the shared test heap, through its lock.
        pub fn with_test_global<T>(f: impl FnOnce(&LockedSegAlloc<TestMemory>) -> T) -> T {
            f(&TEST_HEAP)
        }
    } else {
        /// The memory the single threaded tests run on.
        pub type TestMemory = segalloc::MmapMemory;

        /// Address space reserved for each test heap. Only touched pages are
        /// committed.
        pub const TEST_HEAP_BYTES: usize = 1 << 32;

        /// Fresh memory for one test heap.
        pub fn test_memory() -> TestMemory {
            TestMemory::with_capacity(TEST_HEAP_BYTES)
        }

        /// Run `f` on a fresh heap.
        pub fn with_test_heap<T>(f: impl FnOnce(&mut SegAlloc<TestMemory>) -> T) -> T {
            let mut heap = SegAlloc::new(test_memory());
            f(&mut heap)
        }

        /// Run `f` on a fresh heap behind a lock.
        pub fn with_test_global<T>(f: impl FnOnce(&LockedSegAlloc<TestMemory>) -> T) -> T {
            let heap = LockedSegAlloc::new(SegAlloc::new(test_memory()));
            f(&heap)
        }
    }
}

impl Operations {
    pub fn run_single_threaded(&self) {
        with_test_heap(|heap| self.run_with_allocator(heap, Checking::Full));
    }

    pub fn run_multi_threaded(ops0: Self, ops1: Self, ops2: Self, ops3: Self) {
        use std::thread;

        static SEG: LockedSegAlloc<segalloc::DefaultMemory> = LockedSegAlloc::INIT;

        let handle0 = thread::spawn(move || ops0.run_locked(&SEG));
        let handle1 = thread::spawn(move || ops1.run_locked(&SEG));
        let handle2 = thread::spawn(move || ops2.run_locked(&SEG));
        let handle3 = thread::spawn(move || ops3.run_locked(&SEG));

        handle0.join().expect("Thread 0 Failed");
        handle1.join().expect("Thread 1 Failed");
        handle2.join().expect("Thread 2 Failed");
        handle3.join().expect("Thread 3 Failed");
    }

    /// Run every operation against `a`, taking its lock once per operation so
    /// that other threads interleave with us.
    pub fn run_locked<M: Memory>(&self, a: &LockedSegAlloc<M>) {
        let mut allocs = vec![];
        for (step, op) in self.0.iter().cloned().enumerate() {
            let mut heap = a.lock();
            Self::apply(&mut heap, &mut allocs, op, Checking::Full);
            assert!(heap.check_heap(step as u32), "invalid heap after {:?}", op);
        }
        let mut heap = a.lock();
        for (ptr, _, _) in allocs.into_iter().flatten() {
            unsafe { heap.release(ptr.as_ptr()) };
        }
    }

    /// Replay these operations on `heap`, releasing whatever is left live at
    /// the end.
    pub fn run_with_allocator<M: Memory>(&self, heap: &mut SegAlloc<M>, checking: Checking) {
        let mut allocs = vec![];
        for (step, op) in self.0.iter().cloned().enumerate() {
            Self::apply(heap, &mut allocs, op, checking);
            if checking == Checking::Full {
                assert!(heap.check_heap(step as u32), "invalid heap after {:?}", op);
            }
        }
        for (ptr, _, _) in allocs.into_iter().flatten() {
            unsafe { heap.release(ptr.as_ptr()) };
        }
        if checking == Checking::Full {
            let stats = heap.stats().unwrap();
            assert_eq!(stats.allocated_blocks, 0);
        }
    }

    fn apply<M: Memory>(
        heap: &mut SegAlloc<M>,
        allocs: &mut Vec<Option<(NonNull<u8>, usize, usize)>>,
        op: Operation,
        checking: Checking,
    ) {
        let full = checking == Checking::Full;
        match op {
            Alloc(n) => {
                let id = allocs.len();
                allocs.push(match heap.allocate(n) {
                    Ok(ptr) => {
                        assert_eq!(ptr.as_ptr() as usize % segalloc::ALIGNMENT, 0);
                        if full {
                            assert!(unsafe { heap.usable_size(ptr.as_ptr()) } >= n);
                            fill(ptr, n, id);
                        }
                        Some((ptr, n, id))
                    }
                    Err(AllocError::ZeroSize) => {
                        assert_eq!(n, 0);
                        None
                    }
                    Err(_) => None,
                });
            }
            Calloc(count, size) => {
                let id = allocs.len();
                allocs.push(match heap.allocate_array(count, size) {
                    Ok(ptr) => {
                        let n = count * size;
                        if full {
                            let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), n) };
                            assert!(bytes.iter().all(|b| *b == 0), "calloc memory is not zeroed");
                            fill(ptr, n, id);
                        }
                        Some((ptr, n, id))
                    }
                    Err(_) => None,
                });
            }
            Free(idx) => {
                if let Some(entry) = allocs.get_mut(idx) {
                    if let Some((ptr, n, id)) = entry.take() {
                        if full {
                            check(ptr, n, id);
                        }
                        unsafe { heap.release(ptr.as_ptr()) };
                    }
                }
            }
            Realloc(idx, n) => {
                let entry = match allocs.get_mut(idx) {
                    Some(entry) => entry,
                    None => return,
                };
                let (old, old_len, id) = match *entry {
                    Some((ptr, len, id)) => (ptr.as_ptr(), len, id),
                    None => (std::ptr::null_mut(), 0, idx),
                };
                match unsafe { heap.resize(old, n) } {
                    Ok(Some(ptr)) => {
                        if full {
                            check(ptr, old_len.min(n), id);
                            fill(ptr, n, id);
                        }
                        *entry = Some((ptr, n, id));
                    }
                    Ok(None) => *entry = None,
                    Err(_) => {
                        // The original allocation must survive a failed resize.
                        if let (Some(ptr), true) = (NonNull::new(old), full) {
                            check(ptr, old_len, id);
                        }
                    }
                }
            }
        }
    }

    const NUM_BUCKETS: u64 = 20;

    pub fn size_histogram(&self) -> histo::Histogram {
        let mut histogram = histo::Histogram::with_buckets(Self::NUM_BUCKETS);
        for op in &self.0 {
            let n = match *op {
                Alloc(n) | Realloc(_, n) => n,
                Calloc(count, size) => count.saturating_mul(size),
                Free(_) => continue,
            };
            let n = (n as f64).log2().round();
            histogram.add(n as u64);
        }
        histogram
    }

    pub fn lifetime_histogram(&self) -> histo::Histogram {
        let mut histogram = histo::Histogram::with_buckets(Self::NUM_BUCKETS);
        let mut born = vec![];
        for (i, op) in self.0.iter().enumerate() {
            match *op {
                Alloc(_) | Calloc(..) => born.push(i),
                Free(j) => {
                    if let Some(&b) = born.get(j) {
                        histogram.add((i - b) as u64);
                    }
                }
                Realloc(..) => {}
            }
        }
        histogram
    }

    /// The most bytes requested and not yet freed at any one time.
    pub fn peak_live_bytes(&self) -> usize {
        let mut sizes = vec![];
        let mut live = 0usize;
        let mut peak = 0;
        for op in &self.0 {
            match *op {
                Alloc(n) => {
                    sizes.push(n);
                    live += n;
                }
                Calloc(count, size) => {
                    let n = count.checked_mul(size).unwrap_or(0);
                    sizes.push(n);
                    live += n;
                }
                Free(i) => {
                    if let Some(n) = sizes.get_mut(i) {
                        live -= *n;
                        *n = 0;
                    }
                }
                Realloc(i, n) => {
                    if let Some(old) = sizes.get_mut(i) {
                        live = live - *old + n;
                        *old = n;
                    }
                }
            }
            peak = peak.max(live);
        }
        peak
    }

    pub fn read_trace(trace: &str) -> Self {
        let trace_dir = Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/traces"));
        let contents = fs::read_to_string(trace_dir.join(trace)).unwrap();
        contents.parse().unwrap()
    }
}

/// Names of the traces under `traces/`.
pub const TRACES: &[&str] = &[
    "binary.trace",
    "coalesce.trace",
    "mini.trace",
    "realloc.trace",
    "short.trace",
];

////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::quickcheck;
    use segalloc::{Config, HeapStats, ALIGNMENT, FIT_CANDIDATES};

    macro_rules! run_quickchecks {
        ($name:ident) => {
            #[test]
            fn $name() {
                fn single_threaded(ops: Operations) {
                    ops.run_single_threaded();
                }

                quickcheck::QuickCheck::new()
                    .tests(1)
                    .quickcheck(single_threaded as fn(Operations));
            }
        };
    }

    // Let the test harness run each of our single threaded quickchecks
    // concurrently with each other.
    run_quickchecks!(quickchecks_0);
    run_quickchecks!(quickchecks_1);
    // Limit the extent of the stress testing for the limited-size static backend
    cfg_if! {
        if #[cfg(not(feature = "static_array_backend"))] {
            run_quickchecks!(quickchecks_2);
            run_quickchecks!(quickchecks_3);
            run_quickchecks!(quickchecks_4);
            run_quickchecks!(quickchecks_5);
        }
    }

    #[test]
    fn multi_threaded_quickchecks() {
        quickcheck::QuickCheck::new()
            .tests(1)
            .quickcheck(Operations::run_multi_threaded as fn(Operations, Operations, Operations, Operations));
    }

    static ALIGNS: [usize; 10] = [1, 2, 4, 8, 16, 32, 64, 128, 256, 512];

    quickcheck! {
        fn single_allocation_with_size_and_align(size: usize, align: usize) -> bool {
            use std::alloc::{GlobalAlloc, Layout};

            let size = size % 65536;
            let align = ALIGNS[align % ALIGNS.len()];

            with_test_global(|a| {
                let layout = Layout::from_size_align(size, align).unwrap();
                unsafe {
                    let p = a.alloc(layout);
                    if p.is_null() || p as usize % align != 0 {
                        return false;
                    }
                    std::ptr::write_bytes(p, 0x3c, size);

                    let new_size = size + ALIGNMENT;
                    let q = a.realloc(p, layout, new_size);
                    if q.is_null() || q as usize % align != 0 {
                        return false;
                    }
                    let kept = std::slice::from_raw_parts(q, size).iter().all(|b| *b == 0x3c);
                    a.dealloc(q, Layout::from_size_align(new_size, align).unwrap());
                    kept && a.lock().validate().is_ok()
                }
            })
        }

        fn operations_parse_back(ops: Vec<(u8, u16, u16)>) -> bool {
            let ops: Vec<Operation> = ops
                .into_iter()
                .map(|(kind, a, b)| match kind % 4 {
                    0 => Alloc(a as usize),
                    1 => Free(a as usize),
                    2 => Realloc(a as usize, b as usize),
                    _ => Calloc(a as usize, b as usize),
                })
                .collect();
            let text: String = ops.iter().map(|op| format!("{:?},\n", op)).collect();
            let parsed: Operations = text.parse().unwrap();
            parsed.0 == ops
        }
    }

    ////////////////////////////////////////////////////////////////////////////

    macro_rules! test_trace {
        ($name:ident, $trace:expr) => {
            #[test]
            fn $name() {
                let ops = Operations::read_trace($trace);
                ops.run_single_threaded();
            }
        };
    }

    test_trace!(test_trace_binary, "binary.trace");
    test_trace!(test_trace_coalesce, "coalesce.trace");
    test_trace!(test_trace_mini, "mini.trace");
    test_trace!(test_trace_realloc, "realloc.trace");
    test_trace!(test_trace_short, "short.trace");

    #[test]
    fn trace_comments_and_blank_lines_are_skipped() {
        let ops: Operations = "# header\n\nAlloc(8),\n  Free(0),\n".parse().unwrap();
        assert_eq!(ops.0, vec![Alloc(8), Free(0)]);
        assert!("Alloc(8)".parse::<Operation>().is_err());
        assert!("Realloc(1),".parse::<Operation>().is_err());
    }

    ////////////////////////////////////////////////////////////////////////////

    #[test]
    fn regression_test_0() {
        Operations(vec![Alloc(1)]).run_single_threaded();
    }

    #[test]
    fn regression_test_1() {
        Operations(vec![Alloc(1414), Free(0), Alloc(1414), Free(1)]).run_single_threaded();
    }

    #[test]
    fn regression_test_2() {
        Operations(vec![Alloc(168), Free(0), Alloc(0), Alloc(168), Free(2)]).run_single_threaded();
    }

    #[test]
    fn regression_test_3() {
        Operations(vec![Alloc(13672), Free(0), Alloc(1)]).run_single_threaded();
    }

    #[test]
    fn regression_test_4() {
        // A mini block freed between two free neighbors.
        Operations(vec![Alloc(40), Alloc(8), Alloc(40), Alloc(40), Free(0), Free(2), Free(1)])
            .run_single_threaded();
    }

    #[test]
    fn regression_test_5() {
        // Resizing a freed allocation allocates it again.
        Operations(vec![Alloc(24), Free(0), Realloc(0, 100), Realloc(0, 0), Free(0)]).run_single_threaded();
    }

    #[test]
    fn regression_test_6() {
        // Splitting a freed block whose old payload looks like block headers.
        with_test_heap(|heap| {
            let a = heap.allocate(248).unwrap();
            let b = heap.allocate(56).unwrap();
            unsafe {
                let words = a.as_ptr() as *mut u64;
                for i in 0..248 / 8 {
                    *words.add(i) = 0xf0;
                }
                fill(b, 56, 1);
                heap.release(a.as_ptr());
            }

            let c = heap.allocate(24).unwrap();
            let d = heap.allocate(8).unwrap();
            check(b, 56, 1);
            assert!(heap.check_heap(line!()));

            for p in [b, c, d].iter() {
                unsafe { heap.release(p.as_ptr()) };
            }
            assert!(heap.check_heap(line!()));
        });
    }

    #[test]
    fn allocate_size_zero() {
        use std::iter;
        Operations(
            iter::repeat(Alloc(0))
                .take(1000)
                .chain((0..1000).map(Free))
                .collect(),
        )
        .run_single_threaded();
    }

    #[test]
    fn allocate_many_small() {
        use std::iter;

        Operations(
            iter::repeat(Alloc(8))
                .take(100)
                .chain((0..100).map(Free))
                .chain(iter::repeat(Alloc(256)).take(100))
                .chain((0..100).map(|i| Free(i + 100)))
                .collect(),
        )
        .run_single_threaded();
    }

    #[test]
    fn allocate_many_large() {
        use std::iter;

        Operations(
            iter::repeat(Alloc(CHUNK_SIZE + 8))
                .take(100)
                .chain((0..100).map(Free))
                .chain(iter::repeat(Alloc(4 * CHUNK_SIZE)).take(100))
                .chain((0..100).map(|i| Free(i + 100)))
                .collect(),
        )
        .run_single_threaded();
    }

    #[test]
    fn heap_is_one_free_block_after_everything_is_freed() {
        with_test_heap(|heap| {
            Operations::read_trace("binary.trace").run_with_allocator(heap, Checking::Full);
            let stats = heap.stats().unwrap();
            assert_eq!(
                stats,
                HeapStats {
                    heap_bytes: stats.heap_bytes,
                    free_blocks: 1,
                    free_bytes: stats.heap_bytes - 16,
                    largest_free: stats.heap_bytes - 16,
                    ..HeapStats::default()
                }
            );
        });
    }

    #[test]
    fn alternate_frees_then_double_request_reuses_a_coalesced_pair() {
        with_test_heap(|heap| {
            let s = 64;
            let blocks: Vec<_> = (0..16).map(|_| heap.allocate(s).unwrap()).collect();
            for p in blocks.iter().step_by(2) {
                unsafe { heap.release(p.as_ptr()) };
            }
            let size = heap.heap_size();
            // Freeing one more block merges it with both of its neighbors.
            unsafe { heap.release(blocks[5].as_ptr()) };
            let p = heap.allocate(2 * s).unwrap();
            assert_eq!(p, blocks[4]);
            assert_eq!(heap.heap_size(), size);
            assert!(heap.check_heap(line!()));
            for q in blocks.iter().skip(1).step_by(2).filter(|q| **q != blocks[5]) {
                unsafe { heap.release(q.as_ptr()) };
            }
            unsafe { heap.release(p.as_ptr()) };
            assert_eq!(heap.stats().unwrap().allocated_blocks, 0);
        });
    }

    #[test]
    #[cfg(not(feature = "static_array_backend"))]
    fn fewer_fit_candidates_still_make_a_valid_heap() {
        let ops = Operations::read_trace("coalesce.trace");
        for k in [1, FIT_CANDIDATES, 64].iter() {
            let mut heap = SegAlloc::with_config(test_memory(), Config::new(CHUNK_SIZE, *k));
            ops.run_with_allocator(&mut heap, Checking::Full);
        }
    }

    ////////////////////////////////////////////////////////////////////////////

    // Tests taken from
    // https://github.com/alexcrichton/dlmalloc-rs/blob/master/tests/smoke.rs and
    // modified.

    #[test]
    fn smoke() {
        with_test_heap(|a| unsafe {
            let ptr = a.allocate(1).unwrap().as_ptr();
            *ptr = 9;
            assert_eq!(*ptr, 9);
            a.release(ptr);

            let ptr = a.allocate(1).unwrap().as_ptr();
            *ptr = 10;
            assert_eq!(*ptr, 10);
            a.release(ptr);
        });
    }

    // This takes too long with our extra assertion checks enabled,
    // and the fixed-sized static array backend is too small.
    #[test]
    #[cfg(not(any(feature = "extra_assertions", feature = "static_array_backend")))]
    fn stress() {
        use std::cmp;

        with_test_heap(|a| {
            let mut rng = StdRng::seed_from_u64(0x5eed);
            let mut ptrs: Vec<(NonNull<u8>, usize)> = Vec::new();
            unsafe {
                for _ in 0..100_000 {
                    let free = !ptrs.is_empty() && ((ptrs.len() < 1_000 && rng.gen_bool(1.0 / 3.0)) || rng.gen());
                    if free {
                        let idx = rng.gen_range(0..ptrs.len());
                        let (ptr, _) = ptrs.swap_remove(idx);
                        a.release(ptr.as_ptr());
                        continue;
                    }

                    if !ptrs.is_empty() && rng.gen_bool(0.01) {
                        let idx = rng.gen_range(0..ptrs.len());
                        let (ptr, old) = ptrs.swap_remove(idx);
                        let new = if rng.gen() {
                            rng.gen_range(old..old * 2)
                        } else if old > 10 {
                            rng.gen_range(old / 2..old)
                        } else {
                            continue;
                        };
                        let mut tmp = Vec::new();
                        for i in 0..cmp::min(old, new) {
                            tmp.push(*ptr.as_ptr().add(i));
                        }
                        let ptr = a.resize(ptr.as_ptr(), new).unwrap().unwrap();
                        for (i, byte) in tmp.iter().enumerate() {
                            assert_eq!(*byte, *ptr.as_ptr().add(i));
                        }
                        ptrs.push((ptr, new));
                    }

                    let size = if rng.gen() {
                        rng.gen_range(1..128)
                    } else {
                        rng.gen_range(1..128 * 1024)
                    };

                    let zero = rng.gen_bool(0.02);
                    let ptr = if zero {
                        a.allocate_array(1, size).unwrap()
                    } else {
                        a.allocate(size).unwrap()
                    };
                    for i in 0..size {
                        if zero {
                            assert_eq!(*ptr.as_ptr().add(i), 0);
                        }
                        *ptr.as_ptr().add(i) = 0xce;
                    }
                    ptrs.push((ptr, size));
                }
            }
            assert!(a.check_heap(line!()));
        });
    }
}
