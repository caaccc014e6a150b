#[cfg(all(test, not(loom)))]
mod tests {
    use crate::memory::backing::{Budgeted, SystemBacking, VmBacking};
    use crate::memory::buddy::{BinaryBlockTree, BuddyConfig};
    use crate::memory::policy::{MultiThreaded, SingleThreaded};
    use crate::memory::pool_box::PoolBox;
    use crate::memory::small_object::{SmallObjectAllocator, SmallObjectConfig};
    use crate::memory::stats::{self, MemoryStats};
    use crate::sync::Arc;
    use crate::sync::barrier::Barrier;
    use crate::sync::thread;

    #[test]
    fn test_integration_stress_mix() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        // Interleaved allocations from both allocators on VM-backed memory.
        let tree = BinaryBlockTree::<SingleThreaded, VmBacking>::with_backing(
            BuddyConfig {
                max_order: 18,
                min_order: 5,
            },
            VmBacking,
        )
        .unwrap();
        let small = SmallObjectAllocator::<SingleThreaded, VmBacking>::with_backing(
            SmallObjectConfig::default(),
            VmBacking,
        )
        .unwrap();

        let mut buddy_blocks = Vec::new();
        let mut small_blocks = Vec::new();
        for i in 0usize..600 {
            let size = 1 + (i * 37) % 700;
            if i % 2 == 0 {
                if let Some(p) = tree.allocate(size) {
                    // Safety: Test code.
                    unsafe { p.as_ptr().write_bytes(0x11, size) };
                    buddy_blocks.push((p, size));
                }
            } else {
                let p = small.allocate(size).unwrap();
                // Safety: Test code.
                unsafe { p.as_ptr().write_bytes(0x22, size) };
                small_blocks.push((p, size));
            }

            if i % 50 == 49 {
                // Free the older half of both sets.
                for (p, size) in buddy_blocks.drain(..buddy_blocks.len() / 2) {
                    // Safety: Test code.
                    unsafe { tree.deallocate(p, size) };
                }
                for (p, size) in small_blocks.drain(..small_blocks.len() / 2) {
                    // Safety: Test code.
                    unsafe { small.deallocate(p, size) };
                }
                assert!(!tree.is_corrupt());
                assert!(!small.is_corrupt());
            }
        }

        for (p, size) in buddy_blocks {
            // Safety: Test code.
            unsafe { tree.deallocate(p, size) };
        }
        for (p, size) in small_blocks {
            // Safety: Test code.
            unsafe { small.deallocate(p, size) };
        }
        assert_eq!(tree.free_nodes_per_level()[0], 1);
        assert_eq!(small.bypass_live_bytes(), 0);
        assert!(small.try_to_free_up_some_memory());
        assert!(tree.release_idle_memory() > 0);
    }

    #[test]
    fn test_integration_thread_contention() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let tree: Arc<BinaryBlockTree<MultiThreaded>> = Arc::new(
            BinaryBlockTree::with_config(BuddyConfig {
                max_order: 16,
                min_order: 4,
            })
            .unwrap(),
        );

        let barrier = Arc::new(Barrier::new(4));
        let handles: Vec<_> = (0..4usize)
            .map(|t| {
                let tree = Arc::clone(&tree);
                let b = Arc::clone(&barrier);
                thread::spawn(move || {
                    let size = 16 << t;
                    b.wait();
                    for round in 0..100u8 {
                        let blocks: Vec<_> = (0..8).filter_map(|_| tree.allocate(size)).collect();
                        for &p in &blocks {
                            // Safety: Test code.
                            unsafe { p.as_ptr().write_bytes(round, size) };
                        }
                        for &p in &blocks {
                            // Safety: Test code.
                            assert!(unsafe { p.as_ptr().read() } == round);
                        }
                        for p in blocks {
                            // Safety: Test code.
                            unsafe { tree.deallocate(p, size) };
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let mut expected = vec![0; tree.levels()];
        expected[0] = 1;
        assert_eq!(tree.free_nodes_per_level(), expected);
        assert!(!tree.is_corrupt());
    }

    #[test]
    fn test_integration_pool_boxes_across_threads() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let alloc = SmallObjectAllocator::<MultiThreaded>::with_config(SmallObjectConfig {
            alignment: 8,
            ..SmallObjectConfig::default()
        })
        .unwrap();

        thread::scope(|s| {
            for t in 0..4u64 {
                let alloc = &alloc;
                s.spawn(move || {
                    let boxes: Vec<_> = (0..300u64)
                        .map(|i| PoolBox::new_in((t, i, [0u8; 20]), alloc).unwrap())
                        .collect();
                    for (i, b) in boxes.iter().enumerate() {
                        assert_eq!(b.0, t);
                        assert_eq!(b.1, i as u64);
                    }
                });
            }
        });

        assert!(!alloc.is_corrupt());
        assert!(alloc.try_to_free_up_some_memory());
        assert!(alloc.free_blocks_per_bucket().iter().all(|&n| n == 0));
    }

    #[test]
    fn test_integration_shared_budget_between_allocators() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let budget = Budgeted::new(SystemBacking, 64 * 1024);

        let tree = BinaryBlockTree::<SingleThreaded, _>::with_backing(
            BuddyConfig {
                max_order: 15,
                min_order: 6,
            },
            budget.clone(),
        )
        .unwrap();
        assert_eq!(budget.remaining(), 32 * 1024);

        let small = SmallObjectAllocator::<SingleThreaded, _>::with_backing(
            SmallObjectConfig::default(),
            budget.clone(),
        )
        .unwrap();

        // Bypass blocks eat the rest of the budget.
        let big = small.allocate(30 * 1024).unwrap();
        assert!(small.allocate(4 * 1024).is_err());

        // Tearing down the buddy tree hands its arena back.
        drop(tree);
        let more = small.allocate(4 * 1024).unwrap();

        // Safety: Test code.
        unsafe {
            small.deallocate_unsized(more);
            small.deallocate_unsized(big);
        }
        drop(small);
        assert_eq!(budget.remaining(), 64 * 1024);
    }

    #[test]
    fn test_integration_stats_snapshot() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        let before = MemoryStats::snapshot();

        let tree = BinaryBlockTree::<SingleThreaded>::with_config(BuddyConfig {
            max_order: 12,
            min_order: 6,
        })
        .unwrap();
        let small = SmallObjectAllocator::<SingleThreaded>::new().unwrap();
        let p = small.allocate(64).unwrap();
        let big = small.allocate(1000).unwrap();

        let during = MemoryStats::snapshot();
        assert_eq!(during.buddy_arena_reserved, before.buddy_arena_reserved + 4096);
        assert_eq!(during.slabs_live, before.slabs_live + 1);
        assert_eq!(during.slab_committed, before.slab_committed + 4096);
        assert_eq!(during.bypass_live, before.bypass_live + 1000);
        assert_eq!(
            during.total_reserved,
            before.total_reserved + 4096 + 4096 + 1000
        );

        // Safety: Test code.
        unsafe {
            small.deallocate(p, 64);
            small.deallocate(big, 1000);
        }
        assert_eq!(stats::BYPASS_LIVE.get(), before.bypass_live);
        // The emptied slab stays retained until reclaimed.
        assert_eq!(stats::SLABS_LIVE.get(), before.slabs_live + 1);
        assert!(small.try_to_free_up_some_memory());
        assert_eq!(stats::SLABS_LIVE.get(), before.slabs_live);

        drop(tree);
        drop(small);
        assert_eq!(MemoryStats::snapshot(), before);
    }
}
