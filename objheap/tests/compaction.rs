use std::collections::BTreeMap;

use objheap::{
    FreeListHeap, Handle, HandleHeap, HandleStore, HeapError, HeapSettings,
    HeapStats, ObjectStore, Offset, Remap, SpaceChainHeap,
};

fn payload(seed: usize) -> Vec<u8> {
    let len = 8 + seed % 53;
    (0..len).map(|i| (seed * 31 + i) as u8).collect()
}

#[test]
fn test_single_space_switch() {
    let mut heap =
        SpaceChainHeap::new(HeapSettings::in_memory(1_000_000, 2)).unwrap();
    // 4 metadata + 1 prefix + 16 payload + 2 guard = 23 bytes
    let per_space = 1_000_000 / 23;
    let mut switched_at = None;
    for i in 0..50_000u32 {
        if heap.cur_space_num() == Some(0) {
            assert!(heap.usage_percent() < 100);
        }
        let ofs = heap
            .add_object_return_ofs(&[i as u8; 16], &i.to_be_bytes())
            .unwrap();
        if switched_at.is_none() && ofs.raw() >= 1_000_000 {
            switched_at = Some(i as usize);
        }
    }
    assert_eq!(switched_at, Some(per_space));
    assert_eq!(heap.filled_spaces_count(), 1);
    assert_eq!(heap.cur_space_num(), Some(1));
    assert_eq!(heap.check_all().unwrap(), 50_000);
    heap.check_space_lists().unwrap();
}

#[test]
fn test_repeated_cycles_keep_reachable_handles() {
    let settings = HeapSettings {
        max_references: 512,
        ..HeapSettings::in_memory(4_000, 4)
    };
    let mut heap = HandleHeap::new(settings).unwrap();
    let mut live: BTreeMap<Handle, Vec<u8>> = BTreeMap::new();
    let mut seed = 0;

    for round in 0..6 {
        for _ in 0..30 {
            let data = payload(seed);
            let h = heap
                .add_and_return_handle(&data, &(seed as u16).to_be_bytes())
                .unwrap();
            assert!(live.insert(h, data).is_none(), "{h:?} aliased");
            seed += 1;
        }

        heap.begin_remap().unwrap();
        let keep: Vec<Handle> = live
            .keys()
            .enumerate()
            .filter(|(i, _)| (i + round) % 3 != 0)
            .map(|(_, &h)| h)
            .collect();
        for &h in keep.iter().rev() {
            heap.remap_by_handle(h).unwrap();
        }
        heap.end_remap().unwrap();
        live.retain(|h, _| keep.contains(h));

        for (&h, data) in &live {
            assert_eq!(&heap.retrieve_data_by_handle(h).unwrap(), data);
        }
        assert_eq!(heap.live_handles_count(), live.len());
        assert_eq!(heap.check_all().unwrap(), live.len());
        heap.chain().check_space_lists().unwrap();
    }
}

#[test]
fn test_cycle_survives_save_and_load() {
    let dir = tempfile::tempdir().unwrap();
    let settings = HeapSettings {
        max_references: 128,
        ..HeapSettings::in_memory(2_000, 3)
    }
    .with_base_path(dir.path().join("trie"));

    let mut heap = HandleHeap::new(settings.clone()).unwrap();
    let handles: Vec<Handle> = (0..40)
        .map(|i| heap.add_and_return_handle(&payload(i), &[0; 4]).unwrap())
        .collect();
    heap.begin_remap().unwrap();
    for h in handles.iter().step_by(2) {
        heap.remap_by_handle(*h).unwrap();
    }
    heap.end_remap().unwrap();
    let root = heap.offset_of(handles[0]).unwrap();
    heap.set_root_ofs(root);
    heap.save().unwrap();

    let mut loaded = HandleHeap::new(settings).unwrap();
    assert!(loaded.file_exists());
    assert_eq!(loaded.load().unwrap(), root);
    for (i, h) in handles.iter().enumerate() {
        let got = loaded.retrieve_data_by_handle(*h);
        if i % 2 == 0 {
            assert_eq!(got.unwrap(), payload(i));
        } else {
            assert!(matches!(got, Err(HeapError::InvalidHandle { .. })));
        }
    }
    let reused = loaded.add_and_return_handle(b"next", &[0; 4]).unwrap();
    assert_eq!(reused.raw() % 2, 1, "a swept handle is reused");
}

#[test]
fn test_unified_heap_sweep_then_refill() {
    let heap = FreeListHeap::new(HeapSettings {
        max_object_size: 128,
        ..HeapSettings::in_memory(1_000, 2)
    })
    .unwrap();
    let offsets: Vec<Offset> = (0..20)
        .map(|i| heap.add_object_return_ofs(&payload(i), &[1, 2]).unwrap())
        .collect();
    let used_before = heap.mem_used();

    heap.begin_remap().unwrap();
    for ofs in offsets.iter().skip(1).step_by(2) {
        heap.remap_by_ofs(*ofs).unwrap();
    }
    heap.end_remap().unwrap();
    assert!(heap.mem_used() < used_before);
    assert_eq!(heap.check_all().unwrap(), 10);

    // every freed gap can take a record no larger than its previous tenant
    for i in (0..20).step_by(2) {
        let at = heap
            .add_object_at_ofs(offsets[i], &payload(i)[..8], &[3, 4])
            .unwrap();
        assert_eq!(at, offsets[i]);
    }
    for (i, ofs) in offsets.iter().enumerate() {
        let expected = if i % 2 == 0 {
            payload(i)[..8].to_vec()
        } else {
            payload(i)
        };
        assert_eq!(heap.retrieve_data_by_ofs(*ofs).unwrap(), expected);
    }
    assert!(heap.usage_percent() < 100);
}
