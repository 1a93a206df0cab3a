use aub_mem::PAGE_SIZE;
use aub_trace::{AubWriter, Engine};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    MapGgtt { page: u64, pages: u64 },
    MapPpgtt { addr: u64, size: u64 },
    ContextSetup { engine: Engine },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..4096u64, 1..8u64).prop_map(|(page, pages)| Op::MapGgtt { page, pages }),
        (0..(1u64 << 40), 1..(16 * PAGE_SIZE)).prop_map(|(addr, size)| Op::MapPpgtt { addr, size }),
        prop_oneof![Just(Engine::Render), Just(Engine::Video), Just(Engine::Copy)]
            .prop_map(|engine| Op::ContextSetup { engine }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Neither allocator ever moves backwards, and every page a mapping receives is fresh.
    #[test]
    fn allocators_are_monotonic(ops in prop::collection::vec(op_strategy(), 1..24)) {
        let mut writer = AubWriter::open(Vec::new(), 0x1912, "allocators").unwrap();
        let ctx = writer.create_context().unwrap();

        for op in ops {
            let phys_before = writer.phys_allocator();
            let ggtt_before = writer.ggtt_allocator();

            match op {
                Op::MapGgtt { page, pages } => {
                    let virt = page * PAGE_SIZE;
                    writer.map_ggtt(virt, pages * PAGE_SIZE).unwrap();
                    for i in 0..pages {
                        let phys = writer.ggtt_lookup(virt + i * PAGE_SIZE).unwrap();
                        prop_assert!(phys / PAGE_SIZE >= phys_before);
                        prop_assert!(phys / PAGE_SIZE < writer.phys_allocator());
                    }
                }
                Op::MapPpgtt { addr, size } => {
                    let first = addr & !(PAGE_SIZE - 1);
                    let already: Vec<bool> = (0..size.div_ceil(PAGE_SIZE) + 1)
                        .map(|i| writer.ppgtt_lookup(first + i * PAGE_SIZE).is_some())
                        .collect();
                    writer.map_ppgtt(addr, size).unwrap();

                    for (i, was_mapped) in already.into_iter().enumerate() {
                        let va = first + i as u64 * PAGE_SIZE;
                        if va >= addr + size {
                            break;
                        }
                        let phys = writer.ppgtt_lookup(va).unwrap();
                        if !was_mapped {
                            prop_assert!(phys / PAGE_SIZE >= phys_before);
                        }
                    }
                }
                Op::ContextSetup { engine } => {
                    let hw = writer.emit_context_setup(ctx, engine).unwrap();
                    prop_assert!(hw.ring_addr >= ggtt_before);
                }
            }

            prop_assert!(writer.phys_allocator() >= phys_before);
            prop_assert!(writer.ggtt_allocator() >= ggtt_before);
        }
    }
}
