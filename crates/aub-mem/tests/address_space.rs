use aub_mem::{AddressSpace, MapSpace, PAGE_SIZE};
use proptest::prelude::*;
use std::collections::BTreeMap;

const PHYS_WINDOW: u64 = 64 * PAGE_SIZE;
const MAX_WRITE: usize = 3 * PAGE_SIZE as usize;

#[derive(Debug, Clone)]
enum Op {
    Write { addr: u64, data: Vec<u8> },
    Touch { addr: u64 },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..PHYS_WINDOW, prop::collection::vec(any::<u8>(), 1..MAX_WRITE))
            .prop_map(|(addr, data)| Op::Write { addr, data }),
        (0..PHYS_WINDOW).prop_map(|addr| Op::Touch { addr }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Physical memory behaves like a flat byte array, and a page keeps its arena slot forever.
    #[test]
    fn phys_memory_matches_flat_model(ops in prop::collection::vec(op_strategy(), 1..32)) {
        let mut space = AddressSpace::new();
        let mut model = vec![0u8; (PHYS_WINDOW as usize) + MAX_WRITE];
        let mut slots = BTreeMap::new();

        for op in ops {
            match op {
                Op::Write { addr, data } => {
                    space.phys_write(addr, &data, None).unwrap();
                    let start = addr as usize;
                    model[start..start + data.len()].copy_from_slice(&data);
                }
                Op::Touch { addr } => {
                    space.ensure_phys_page(addr).unwrap();
                }
            }

            for (&page, &slot) in &slots {
                prop_assert_eq!(space.phys_slot(page), Some(slot));
            }
            let mut page = 0;
            while page < model.len() as u64 {
                if let Some(slot) = space.phys_slot(page) {
                    slots.entry(page).or_insert(slot);
                }
                page += PAGE_SIZE;
            }
        }

        let mut back = vec![0u8; model.len()];
        space.read_phys(0, &mut back);
        prop_assert_eq!(back, model);
        prop_assert_eq!(space.arena().allocated_pages(), space.resident_pages());
    }
}

#[test]
fn ggtt_buffer_round_trips_through_region() {
    let mut space = AddressSpace::new();
    // Scatter two GGTT pages across non-adjacent physical pages.
    space.set_ggtt_entry(0x1000, 0x9000 | 1);
    space.set_ggtt_entry(0x2000, 0x3000 | 1);

    let payload: Vec<u8> = (0..0x2000u32).map(|i| (i * 7) as u8).collect();
    space.ggtt_write(0x1000, &payload, None).unwrap();

    let region = space.reconstruct_region(0x1000).unwrap();
    assert_eq!(region.address, 0x1000);
    assert_eq!(region.space, MapSpace::Ggtt);
    assert_eq!(region.data, &payload[..]);
}

#[test]
fn regions_past_a_gap_are_disjoint() {
    let v = 0x40_0000u64;
    let mut space = AddressSpace::new();
    for (i, phys) in [0x10_0000u64, 0x20_0000, 0x30_0000].into_iter().enumerate() {
        space.set_ggtt_entry(v + i as u64 * PAGE_SIZE, phys | 1);
    }
    space.set_ggtt_entry(v + 4 * PAGE_SIZE, 0x50_0000 | 1);

    let first = space.reconstruct_region(v).unwrap();
    let (first_addr, first_size) = (first.address, first.size());
    assert_eq!((first_addr, first_size), (v, 3 * PAGE_SIZE));

    let second = space.reconstruct_region(v + 4 * PAGE_SIZE).unwrap();
    assert_eq!(second.address, v + 4 * PAGE_SIZE);
    assert_eq!(second.size(), PAGE_SIZE);
    assert!(second.address >= first_addr + first_size);
}
