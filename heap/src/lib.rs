mod heap;
mod marking;
mod mutator;
mod root;

pub use heap::{GcStats, Heap, HeapError, HeapInner, HeapSettings};
pub use marking::{NoRoots, RootProvider, RootVisitor};
pub use mutator::Mutator;
pub use root::RootRef;

#[cfg(test)]
mod tests {
    use super::*;
    use object::{CoreType, ShapeId, SlotId, SlotSpec, SlotType, Value};

    struct Roots(Vec<Value>);

    impl RootProvider for Roots {
        fn visit_roots(&self, visitor: &mut dyn RootVisitor) {
            for &value in &self.0 {
                visitor.root_edge(value);
            }
        }
    }

    fn small_heap(threshold: usize) -> Heap {
        Heap::new(HeapSettings {
            initial_capacity: 16,
            collect_threshold: threshold,
        })
    }

    fn add_slot(heap: &Heap, object: object::ObjectRef, id: u32, value: Value) {
        let rooted = heap.root(object);
        heap.transition_layout(&NoRoots, &rooted, SlotSpec::value(SlotId(id)))
            .expect("transition");
        let descriptor = heap
            .lookup_slot(object, SlotId(id))
            .expect("lookup")
            .expect("slot exists after transition");
        heap.set_value(object, descriptor, value).expect("store");
    }

    #[test]
    fn new_object_has_empty_shape() {
        let heap = small_heap(1000);
        let obj = heap.allocate_empty_object(&NoRoots);
        assert_eq!(heap.shape_of(obj), Ok(ShapeId::EMPTY));
        assert_eq!(heap.lookup_slot(obj, SlotId(1)), Ok(None));
        assert_eq!(heap.live_objects(), 1);
    }

    #[test]
    fn store_and_load_after_transition() {
        let heap = small_heap(1000);
        let obj = heap.allocate_empty_object(&NoRoots);
        add_slot(&heap, obj, 7, Value::from_int48(5));

        let descriptor = heap
            .lookup_slot(obj, SlotId(7))
            .expect("lookup")
            .expect("slot");
        assert_eq!(heap.get_value(obj, descriptor), Ok(Value::from_int48(5)));
    }

    #[test]
    fn equal_histories_share_a_shape() {
        let heap = small_heap(1000);
        let a = heap.allocate_empty_object(&NoRoots);
        let b = heap.allocate_empty_object(&NoRoots);
        for obj in [a, b] {
            add_slot(&heap, obj, 1, Value::from_int48(1));
            add_slot(&heap, obj, 2, Value::from_int48(2));
        }
        assert_eq!(heap.shape_of(a), heap.shape_of(b));
    }

    #[test]
    fn descriptor_goes_stale_after_transition() {
        let heap = small_heap(1000);
        let obj = heap.allocate_empty_object(&NoRoots);
        add_slot(&heap, obj, 1, Value::from_int48(1));
        let old = heap
            .lookup_slot(obj, SlotId(1))
            .expect("lookup")
            .expect("slot");

        add_slot(&heap, obj, 2, Value::from_int48(2));

        assert!(matches!(
            heap.set_value(obj, old, Value::from_int48(9)),
            Err(HeapError::StaleDescriptor { .. })
        ));
        let fresh = heap
            .lookup_slot(obj, SlotId(1))
            .expect("lookup")
            .expect("slot");
        assert_eq!(fresh.index, old.index);
        assert_eq!(heap.get_value(obj, fresh), Ok(Value::from_int48(1)));
    }

    #[test]
    fn typed_slot_rejects_wrong_value() {
        let heap = small_heap(1000);
        let obj = heap.allocate_empty_object(&NoRoots);
        let rooted = heap.root(obj);
        let spec = SlotSpec::new(SlotId(3), SlotType::new(CoreType::Int48));
        heap.transition_layout(&NoRoots, &rooted, spec)
            .expect("transition");
        let descriptor = heap
            .lookup_slot(obj, SlotId(3))
            .expect("lookup")
            .expect("slot");
        assert!(matches!(
            heap.set_value(obj, descriptor, Value::from_ref(obj)),
            Err(HeapError::SlotTypeMismatch { .. })
        ));
    }

    #[test]
    fn collection_frees_unreachable_objects() {
        let heap = small_heap(1000);
        let kept = heap.allocate_empty_object(&NoRoots);
        let dropped = heap.allocate_empty_object(&NoRoots);

        heap.request_full_collection(&Roots(vec![Value::from_ref(kept)]));

        assert!(heap.is_live(kept));
        assert!(!heap.is_live(dropped));
        assert_eq!(
            heap.shape_of(dropped),
            Err(HeapError::DanglingReference(dropped))
        );
        let stats = heap.stats();
        assert_eq!(stats.collections, 1);
        assert_eq!(stats.objects_freed, 1);
        assert_eq!(stats.root_edges, 1);
    }

    #[test]
    fn non_reference_roots_are_ignored() {
        let heap = small_heap(1000);
        heap.allocate_empty_object(&NoRoots);
        heap.request_full_collection(&Roots(vec![
            Value::from_int48(0),
            Value::from_ptr(0),
            Value::from_uint48(0),
        ]));
        assert_eq!(heap.live_objects(), 0);
        assert_eq!(heap.stats().root_edges, 0);
    }

    #[test]
    fn fields_keep_objects_alive() {
        let heap = small_heap(1000);
        let parent = heap.allocate_empty_object(&NoRoots);
        let child = heap.allocate_empty_object(&NoRoots);
        add_slot(&heap, parent, 1, Value::from_ref(child));

        heap.request_full_collection(&Roots(vec![Value::from_ref(parent)]));

        assert!(heap.is_live(child));
        assert_eq!(heap.stats().edges, 1);
    }

    #[test]
    fn reclaimed_cell_is_reused_with_new_generation() {
        let heap = small_heap(1000);
        let first = heap.allocate_empty_object(&NoRoots);
        heap.request_full_collection(&NoRoots);
        let second = heap.allocate_empty_object(&NoRoots);

        assert_eq!(first.index(), second.index());
        assert_ne!(first.generation(), second.generation());
        assert!(!heap.is_live(first));
        assert!(heap.is_live(second));
    }

    #[test]
    fn root_handle_survives_collection_until_dropped() {
        let heap = small_heap(1000);
        let obj = heap.allocate_empty_object(&NoRoots);
        let rooted = heap.root(obj);

        heap.request_full_collection(&NoRoots);
        assert_eq!(rooted.get(), Some(obj));
        assert!(heap.is_live(obj));

        drop(rooted);
        heap.request_full_collection(&NoRoots);
        assert!(!heap.is_live(obj));
    }

    #[test]
    fn transition_may_collect_but_keeps_rooted_object() {
        // every allocation unit triggers a collection
        let heap = small_heap(1);
        let garbage = heap.allocate_empty_object(&NoRoots);
        let obj = heap.allocate_empty_object(&NoRoots);
        let rooted = heap.root(obj);

        heap.transition_layout(&NoRoots, &rooted, SlotSpec::value(SlotId(1)))
            .expect("transition");

        let obj = rooted.get().expect("rooted");
        assert!(heap.is_live(obj));
        assert!(!heap.is_live(garbage));
        assert!(heap.stats().collections >= 1);
        assert!(heap.lookup_slot(obj, SlotId(1)).expect("lookup").is_some());
    }

    #[test]
    fn exhausted_cell_is_retired() {
        let heap = small_heap(usize::MAX);
        let first = heap.allocate_empty_object(&NoRoots);
        let mut last = first;
        for _ in 0..u16::MAX {
            heap.request_full_collection(&NoRoots);
            last = heap.allocate_empty_object(&NoRoots);
            assert_eq!(last.index(), first.index());
        }
        assert_eq!(last.generation(), u16::MAX);

        heap.request_full_collection(&NoRoots);
        let next = heap.allocate_empty_object(&NoRoots);

        assert_ne!(next.index(), first.index());
        assert!(!heap.is_live(first));
        assert!(!heap.is_live(last));
        assert!(heap.is_live(next));
        assert_eq!(heap.stats().retired_cells, 1);
    }

    #[test]
    fn stopped_mutator_roots_survive_collection() {
        let heap = small_heap(1000);
        let kept = heap.allocate_empty_object(&NoRoots);
        let dropped = heap.allocate_empty_object(&NoRoots);
        let mutator = heap.register_mutator();
        mutator.publish(&Roots(vec![Value::from_ref(kept)]));

        heap.request_full_collection(&NoRoots);
        assert!(heap.is_live(kept));
        assert!(!heap.is_live(dropped));

        drop(mutator);
        assert_eq!(heap.mutator_count(), 0);
        heap.request_full_collection(&NoRoots);
        assert!(!heap.is_live(kept));
    }

    #[test]
    fn collection_waits_for_running_mutator() {
        use std::sync::atomic::Ordering;

        let heap = small_heap(1000);
        let kept = heap.allocate_empty_object(&NoRoots);
        let mutator = heap.register_mutator();
        mutator.enter();

        let collector = {
            let heap = heap.clone();
            std::thread::spawn(move || heap.request_full_collection(&NoRoots))
        };
        while !heap.stopping.load(Ordering::Acquire) {
            std::thread::yield_now();
        }
        assert_eq!(heap.stats().collections, 0);

        // parks until the collection that was waiting for it is done
        mutator.safepoint(&Roots(vec![Value::from_ref(kept)]));
        collector.join().expect("collector thread");

        assert_eq!(heap.stats().collections, 1);
        assert!(heap.is_live(kept));
        mutator.leave(&NoRoots);
    }

    #[test]
    fn threshold_triggers_collection_on_allocation() {
        let heap = small_heap(3);
        for _ in 0..3 {
            heap.allocate_empty_object(&NoRoots);
        }
        assert_eq!(heap.stats().collections, 1);
        // the third allocation happened after the collection
        assert_eq!(heap.live_objects(), 1);
    }
}
