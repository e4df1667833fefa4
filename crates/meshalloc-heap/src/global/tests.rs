#![cfg(any(target_os = "linux", target_os = "macos"))]

use std::{
  sync::{
    Arc,
    atomic::{
      AtomicBool,
      AtomicUsize,
      Ordering,
    },
  },
  thread,
  time::Duration,
};

use meshalloc_sync::quiesce;

use super::*;

const OBJECT: usize = 128;

fn heap() -> GlobalHeap {
  GlobalHeap::new(HeapConfig::default().with_seed(0x6d65_7368)).expect("global heap")
}

fn pattern(seed: u8) -> [u8; OBJECT] {
  let mut bytes = [0u8; OBJECT];
  for (i, byte) in bytes.iter_mut().take(OBJECT - 1).enumerate() {
    *byte = b'a' + ((i + seed as usize) % 26) as u8;
  }
  bytes
}

unsafe fn write_object(ptr: *mut u8, bytes: &[u8]) {
  unsafe { core::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len()) };
}

unsafe fn read_object(ptr: *const u8, len: usize) -> Vec<u8> {
  (0..len).map(|i| unsafe { ptr.add(i).read_volatile() }).collect()
}

#[test]
fn test_mesh_scenario() {
  let heap = heap();
  let a = heap.alloc_miniheap(OBJECT).unwrap();
  let b = heap.alloc_miniheap(OBJECT).unwrap();
  assert_eq!(heap.allocated_miniheap_count(), 2);
  assert_eq!(heap.with_miniheap(a, MiniHeap::max_count), Some(32));

  let first = heap.malloc_at(a, 0).as_ptr();
  let second = heap.malloc_at(b, 31).as_ptr();
  let (p1, p2) = (pattern(0), pattern(7));
  unsafe {
    write_object(first, &p1);
    write_object(second, &p2);
  }

  assert!(heap.meshable(a, b));
  let mut consumed = Some(b);
  assert!(heap.mesh(a, &mut consumed));
  assert_eq!(consumed, None, "consumed handle is nulled");

  assert_eq!(heap.in_use_count(a), Some(2));
  assert_eq!(heap.in_use_count(b), None);
  assert_eq!(heap.allocated_miniheap_count(), 1);

  unsafe {
    assert_eq!(read_object(first, OBJECT), p1);
    assert_eq!(read_object(second, OBJECT), p2);

    let aliased = (heap.base(a).unwrap() + 31 * OBJECT) as *mut u8;
    assert_eq!(read_object(aliased, OBJECT), p2);

    second.write_volatile(b'#');
    assert_eq!(aliased.read_volatile(), b'#', "writes through b land in a");
    aliased.add(1).write_volatile(b'!');
    assert_eq!(second.add(1).read_volatile(), b'!', "and the other way round");
  }

  assert_eq!(heap.lookup(second), Some(a), "b's span now resolves to a");
  heap.free(first);
  heap.free(second);
  assert_eq!(heap.in_use_count(a), Some(0));

  heap.free_miniheap(a);
  assert_eq!(heap.allocated_miniheap_count(), 0);
  assert_eq!(heap.lookup(first), None);
  assert_eq!(heap.lookup(second), None);

  let stats = heap.stats();
  assert_eq!(stats.miniheaps_created(), 2);
  assert_eq!(stats.meshes(), 1);
  assert_eq!(stats.miniheaps_freed(), 1);
  assert_eq!(stats.live_miniheaps(), 0);
  assert!(stats.bytes_released() >= OBJECT * 32);
}

#[test]
fn test_mesh_refusals() {
  let heap = heap();
  let a = heap.alloc_miniheap(OBJECT).unwrap();
  let b = heap.alloc_miniheap(OBJECT).unwrap();
  let wide = heap.alloc_miniheap(OBJECT * 2).unwrap();

  let mut same = Some(a);
  assert!(!heap.mesh(a, &mut same), "a miniheap never meshes with itself");
  assert_eq!(same, Some(a));

  let mut none = None;
  assert!(!heap.mesh(a, &mut none));

  let mut other_size = Some(wide);
  assert!(!heap.mesh(a, &mut other_size));

  let pa = heap.malloc_at(a, 3).as_ptr();
  let pb = heap.malloc_at(b, 3).as_ptr();
  assert!(!heap.meshable(a, b));
  let mut overlapping = Some(b);
  assert!(!heap.mesh(a, &mut overlapping));
  assert_eq!(overlapping, Some(b), "refused mesh leaves the handle alone");
  assert_eq!(heap.in_use_count(a), Some(1));
  assert_eq!(heap.in_use_count(b), Some(1));
  assert_eq!(heap.stats().meshes_refused(), 3);

  heap.free(pb);
  let mut consumed = Some(b);
  assert!(heap.mesh(a, &mut consumed));

  let mut stale = Some(b);
  assert!(!heap.mesh(a, &mut stale), "stale handles are refused");

  heap.free(pa);
  heap.free_miniheap(a);
  heap.free_miniheap(wide);
  assert_eq!(heap.allocated_miniheap_count(), 0);
}

#[test]
fn test_mesh_locked_under_guard() {
  let heap = heap();
  let a = heap.alloc_miniheap(OBJECT).unwrap();
  let b = heap.alloc_miniheap(OBJECT).unwrap();
  let pa = heap.malloc_at(a, 1).as_ptr();
  let pb = heap.malloc_at(b, 2).as_ptr();

  {
    let mut guard = heap.lock();
    assert!(guard.meshable(a, b));
    let mut consumed = Some(b);
    assert!(guard.mesh_locked(a, &mut consumed));
    assert_eq!(guard.allocated_miniheap_count(), 1);
    assert_eq!(guard.with_miniheap(a, MiniHeap::in_use_count), Some(2));
  }

  heap.free(pa);
  heap.free(pb);
  heap.free_miniheap(a);
}

#[test]
fn test_mesh_chain() {
  let heap = heap();
  let ids: Vec<MiniHeapId> = (0..3).map(|_| heap.alloc_miniheap(OBJECT).unwrap()).collect();
  let ptrs: Vec<*mut u8> = ids
    .iter()
    .enumerate()
    .map(|(slot, id)| heap.malloc_at(*id, slot).as_ptr())
    .collect();
  for (i, ptr) in ptrs.iter().enumerate() {
    unsafe { write_object(*ptr, &pattern(i as u8)) };
  }

  let mut b = Some(ids[1]);
  assert!(heap.mesh(ids[0], &mut b));
  let mut a = Some(ids[0]);
  assert!(heap.mesh(ids[2], &mut a), "a survivor can itself be consumed");

  let survivor = ids[2];
  assert_eq!(heap.in_use_count(survivor), Some(3));
  assert_eq!(heap.with_miniheap(survivor, |h| h.meshed().len()), Some(2));
  for (i, ptr) in ptrs.iter().enumerate() {
    assert_eq!(unsafe { read_object(*ptr, OBJECT) }, pattern(i as u8));
    assert_eq!(heap.lookup(*ptr), Some(survivor));
  }

  unsafe { ptrs[1].write_volatile(b'*') };
  assert_eq!(unsafe { ptrs[1].read_volatile() }, b'*');
  let view = (heap.base(survivor).unwrap() + OBJECT) as *const u8;
  assert_eq!(unsafe { view.read_volatile() }, b'*');

  for ptr in ptrs {
    heap.free(ptr);
  }
  heap.free_miniheap(survivor);
  assert_eq!(heap.allocated_miniheap_count(), 0);
}

fn mesh_under_writer(swap: bool) {
  let heap = heap();
  let a = heap.alloc_miniheap(OBJECT).unwrap();
  let b = heap.alloc_miniheap(OBJECT).unwrap();
  let first = heap.malloc_at(a, 0).as_ptr() as usize;
  let second = heap.malloc_at(b, 31).as_ptr() as usize;

  let running = Arc::new(AtomicBool::new(true));
  let rounds = Arc::new(AtomicUsize::new(0));
  let writer = {
    let running = Arc::clone(&running);
    let rounds = Arc::clone(&rounds);
    quiesce::spawn(move || {
      let mut value = 0u8;
      while running.load(Ordering::Relaxed) {
        value = value.wrapping_add(1);
        for i in 0..OBJECT {
          unsafe {
            (first as *mut u8).add(i).write_volatile(value);
            (second as *mut u8).add(i).write_volatile(value);
          }
        }
        rounds.fetch_add(1, Ordering::Release);
      }
      value
    })
  };

  while rounds.load(Ordering::Acquire) < 100 {
    thread::yield_now();
  }

  let (survivor, consumed) = if swap { (b, a) } else { (a, b) };
  let consumed_ptr = if swap { first } else { second };
  let offset = consumed_ptr - heap.base(consumed).unwrap();

  let mut handle = Some(consumed);
  assert!(heap.mesh(survivor, &mut handle));
  assert_eq!(heap.in_use_count(survivor), Some(2));

  let after = rounds.load(Ordering::Acquire);
  while rounds.load(Ordering::Acquire) < after + 100 {
    thread::yield_now();
  }
  running.store(false, Ordering::Relaxed);
  let last = writer.join().unwrap();

  for ptr in [first, second] {
    let bytes = unsafe { read_object(ptr as *const u8, OBJECT) };
    assert!(bytes.iter().all(|b| *b == last), "torn object at {ptr:#x}");
  }

  let view = (heap.base(survivor).unwrap() + offset) as *const u8;
  unsafe {
    (consumed_ptr as *mut u8).write_volatile(last.wrapping_add(1));
    assert_eq!(view.read_volatile(), last.wrapping_add(1));
  }

  heap.free(first as *const u8);
  heap.free(second as *const u8);
  heap.free_miniheap(survivor);
}

#[test]
fn test_mesh_with_concurrent_writer() {
  mesh_under_writer(false);
}

#[test]
fn test_mesh_with_concurrent_writer_swapped() {
  mesh_under_writer(true);
}

#[test]
#[should_panic(expected = "still holds")]
fn test_free_non_empty_miniheap() {
  let heap = heap();
  let id = heap.alloc_miniheap(OBJECT).unwrap();
  heap.malloc_at(id, 0);
  heap.free_miniheap(id);
}

#[test]
#[should_panic(expected = "not owned by any miniheap")]
fn test_free_untracked() {
  let heap = heap();
  let local = 0u64;
  heap.free(&local as *const u64 as *const u8);
}

#[test]
#[should_panic(expected = "double free")]
fn test_heap_double_free() {
  let heap = heap();
  let id = heap.alloc_miniheap(OBJECT).unwrap();
  let ptr = heap.malloc_at(id, 4).as_ptr();
  heap.free(ptr);
  heap.free(ptr);
}

#[test]
#[should_panic(expected = "stale miniheap handle")]
fn test_free_miniheap_twice() {
  let heap = heap();
  let id = heap.alloc_miniheap(OBJECT).unwrap();
  heap.free_miniheap(id);
  heap.free_miniheap(id);
}

#[test]
fn test_alloc_miniheap_rejects_sizes() {
  let heap = heap();
  assert_eq!(heap.alloc_miniheap(0), Err(HeapError::ZeroSize));
  assert_eq!(
    heap.alloc_miniheap(MAX_SIZE + 1),
    Err(HeapError::TooLarge {
      size: MAX_SIZE + 1,
      max: MAX_SIZE
    })
  );
  assert!(matches!(heap.allocate(4096), Err(HeapError::TooLarge { .. })));
  assert_eq!(heap.allocated_miniheap_count(), 0);
}

#[test]
fn test_free_miniheap_forgets_span() {
  let heap = heap();
  let keep = heap.alloc_miniheap(64).unwrap();
  let gone = heap.alloc_miniheap(64).unwrap();
  let ptr = heap.malloc_at(gone, 0).as_ptr();
  heap.free(ptr);

  heap.free_miniheap(gone);
  assert_eq!(heap.allocated_miniheap_count(), 1);
  assert_eq!(heap.lookup(ptr), None);
  assert!(heap.base(keep).is_some());
  heap.free_miniheap(keep);
}

#[test]
#[should_panic(expected = "not owned by any miniheap")]
fn test_free_after_free_miniheap() {
  let heap = heap();
  let id = heap.alloc_miniheap(64).unwrap();
  let ptr = heap.malloc_at(id, 3).as_ptr();
  heap.free(ptr);
  heap.free_miniheap(id);
  heap.free(ptr);
}

#[test]
fn test_allocate_routes_by_class() {
  let heap = heap();
  let ptrs: Vec<NonNull<u8>> = (0..100).map(|_| heap.allocate(100).unwrap()).collect();

  let mut addrs: Vec<usize> = ptrs.iter().map(|p| p.as_ptr() as usize).collect();
  addrs.sort_unstable();
  addrs.dedup();
  assert_eq!(addrs.len(), ptrs.len());

  let owner = heap.lookup(ptrs[0].as_ptr()).unwrap();
  assert_eq!(heap.with_miniheap(owner, MiniHeap::object_size), Some(112));
  assert_eq!(
    heap.with_miniheap(owner, |h| h.class().map(|c| c.object_size())),
    Some(Some(112))
  );
  let per_heap = crate::classes::max_count(112);
  assert_eq!(heap.allocated_miniheap_count(), 100usize.div_ceil(per_heap));

  for ptr in &ptrs {
    heap.deallocate(*ptr);
  }
  let again = heap.allocate(100).unwrap();
  assert!(heap.lookup(again.as_ptr()).is_some(), "freed slots are reused");
  heap.deallocate(again);

  let report = heap.compact();
  assert_eq!(report.reclaimed(), 100usize.div_ceil(per_heap));
  assert_eq!(heap.allocated_miniheap_count(), 0);
}

#[test]
fn test_allocate_never_uses_caller_owned() {
  let heap = heap();
  let owned = heap.alloc_miniheap(OBJECT).unwrap();
  let ptr = heap.allocate(OBJECT).unwrap();
  assert_ne!(heap.lookup(ptr.as_ptr()), Some(owned));

  heap.deallocate(ptr);
  let report = heap.compact();
  assert_eq!(report.reclaimed(), 1, "only the pooled miniheap is reclaimed");
  assert_eq!(heap.allocated_miniheap_count(), 1);
  heap.free_miniheap(owned);
}

fn sparse_pooled(heap: &GlobalHeap, object_size: usize, heaps: usize) -> Vec<NonNull<u8>> {
  let per_heap = crate::classes::max_count(object_size);
  let ptrs: Vec<NonNull<u8>> = (0..per_heap * heaps)
    .map(|_| heap.allocate(object_size).unwrap())
    .collect();
  assert_eq!(heap.allocated_miniheap_count(), heaps);

  let mut owners: Vec<MiniHeapId> = Vec::new();
  let mut kept = Vec::new();
  for ptr in ptrs {
    let owner = heap.lookup(ptr.as_ptr()).unwrap();
    let ordinal = match owners.iter().position(|o| *o == owner) {
      Some(pos) => pos,
      None => {
        owners.push(owner);
        owners.len() - 1
      }
    };
    let slot = (ptr.as_ptr() as usize - heap.base(owner).unwrap()) / object_size;
    if slot == ordinal {
      kept.push(ptr);
    } else {
      heap.deallocate(ptr);
    }
  }
  assert_eq!(kept.len(), heaps);
  kept
}

#[test]
fn test_compaction_meshes_sparse_miniheaps() {
  let heap = heap();
  let kept = sparse_pooled(&heap, 256, 4);
  for (i, ptr) in kept.iter().enumerate() {
    unsafe { ptr.as_ptr().write_bytes(b'0' + i as u8, 256) };
  }

  let report = heap.compact();
  assert_eq!(report.reclaimed(), 0);
  assert_eq!(report.meshed(), 2);
  assert!(report.bytes_released() > 0);
  assert_eq!(heap.allocated_miniheap_count(), 2);

  for (i, ptr) in kept.iter().enumerate() {
    let bytes = unsafe { read_object(ptr.as_ptr(), 256) };
    assert!(bytes.iter().all(|b| *b == b'0' + i as u8));
  }

  for ptr in kept {
    heap.deallocate(ptr);
  }
  assert_eq!(heap.compact().reclaimed(), 2);
  assert_eq!(heap.allocated_miniheap_count(), 0);
}

#[test]
fn test_compaction_without_meshing() {
  let heap = GlobalHeap::new(HeapConfig::default().with_seed(3).with_meshing(false)).unwrap();
  let kept = sparse_pooled(&heap, 256, 2);

  let report = heap.compact();
  assert_eq!(report.meshed(), 0);
  assert_eq!(heap.allocated_miniheap_count(), 2);

  for ptr in kept {
    heap.deallocate(ptr);
  }
}

#[test]
fn test_maybe_compact_is_rate_limited() {
  let config = HeapConfig::default()
    .with_seed(5)
    .with_mesh_period(Duration::from_secs(3600));
  let heap = GlobalHeap::new(config).unwrap();

  assert!(heap.maybe_compact().is_some());
  assert!(heap.maybe_compact().is_none());
  assert_eq!(heap.stats().compactions(), 1);

  let eager = GlobalHeap::new(HeapConfig::default().with_mesh_period(Duration::ZERO)).unwrap();
  assert!(eager.maybe_compact().is_some());
  assert!(eager.maybe_compact().is_some());
}

#[test]
fn test_free_entire_except_and_reattach() {
  let heap = heap();
  let id = heap.alloc_miniheap(OBJECT).unwrap();
  let keep = heap.malloc_at(id, 7).as_ptr();
  for slot in [0, 1, 2] {
    heap.malloc_at(id, slot);
  }

  heap.free_entire_except(id, keep).unwrap();
  assert_eq!(heap.in_use_count(id), Some(1));
  let bytes = heap.bitmap_bytes(id).unwrap();
  assert_eq!(bytes[0], 1 << 7);

  heap.reattach(id);
  let next = heap.malloc(id).unwrap();
  assert_ne!(next.as_ptr(), keep);
  heap.free(next.as_ptr());
  heap.free(keep);
  heap.free_miniheap(id);
}

#[test]
fn test_free_entire_except_returns_pooled_heap_to_routing() {
  let heap = heap();
  let ptrs: Vec<NonNull<u8>> = (0..32).map(|_| heap.allocate(OBJECT).unwrap()).collect();
  let id = heap.lookup(ptrs[0].as_ptr()).unwrap();
  assert!(ptrs.iter().all(|p| heap.lookup(p.as_ptr()) == Some(id)));
  assert_eq!(heap.with_miniheap(id, MiniHeap::is_full), Some(true));

  heap.reattach(id);
  let spill = heap.allocate(OBJECT).unwrap();
  assert_ne!(heap.lookup(spill.as_ptr()), Some(id), "a full heap stays out of its bin");
  assert_eq!(heap.allocated_miniheap_count(), 2);

  heap.free_entire_except(id, ptrs[0].as_ptr()).unwrap();
  assert_eq!(heap.in_use_count(id), Some(1));

  let next = heap.allocate(OBJECT).unwrap();
  assert_eq!(heap.lookup(next.as_ptr()), Some(id), "freed slots are routed to again");
  assert_eq!(heap.allocated_miniheap_count(), 2);
}

#[test]
fn test_unsupported_system_fails_softly() {
  let heap = GlobalHeap::with_system(
    HeapConfig::default().with_seed(1),
    Box::new(meshalloc_sys::system::UnsupportedSystem {}),
  );
  assert_eq!(
    heap.alloc_miniheap(OBJECT),
    Err(HeapError::System(SysError::Unsupported))
  );
  assert!(heap.allocate(8).is_err());
}
