//! Model-based checks of the registry against a `BTreeMap`.

use proptest::prelude::*;
use simprobe::{Error, LandingPadEntry, RegionId, Registry};
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
enum Op {
    Register { pc: usize, pad: usize },
    Unregister { pc: usize },
    Region { entries: Vec<(usize, usize)> },
    Release { index: usize },
}

// A small key space so that conflicts and removals actually happen.
fn pc_strategy() -> impl Strategy<Value = usize> {
    (0usize..16).prop_map(|i| 0x1000 + i * 4)
}

fn pad_strategy() -> impl Strategy<Value = usize> {
    (1usize..4).prop_map(|i| 0x2000 + i * 0x100)
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (pc_strategy(), pad_strategy()).prop_map(|(pc, pad)| Op::Register { pc, pad }),
        pc_strategy().prop_map(|pc| Op::Unregister { pc }),
        prop::collection::vec((pc_strategy(), pad_strategy()), 0..6)
            .prop_map(|entries| Op::Region { entries }),
        (0usize..8).prop_map(|index| Op::Release { index }),
    ]
}

/// Model state of one key: landing pad, whether it was registered directly, and how many live
/// regions contain it.
#[derive(Debug, Clone, Copy)]
struct Held {
    pad: usize,
    direct: bool,
    regions: usize,
}

proptest! {
    #[test]
    fn registry_matches_model(ops in prop::collection::vec(op_strategy(), 1..64)) {
        let registry = Registry::new();
        let mut model: BTreeMap<usize, Held> = BTreeMap::new();
        let mut regions: Vec<(RegionId, Vec<usize>)> = Vec::new();

        for op in ops {
            match op {
                Op::Register { pc, pad } => {
                    let result = registry.register(pc, pad);
                    match model.get(&pc) {
                        Some(held) if held.pad != pad => {
                            let is_conflict = matches!(result, Err(Error::Conflict { .. }));
                            prop_assert!(is_conflict);
                        }
                        _ => {
                            prop_assert!(result.is_ok());
                            model.entry(pc).or_insert(Held { pad, direct: false, regions: 0 }).direct = true;
                        }
                    }
                }
                Op::Unregister { pc } => {
                    let direct = model.get(&pc).map_or(false, |held| held.direct);
                    prop_assert_eq!(registry.unregister(pc), direct);
                    if direct {
                        let released = {
                            let held = model.get_mut(&pc).unwrap();
                            held.direct = false;
                            held.regions == 0
                        };
                        if released {
                            model.remove(&pc);
                        }
                    }
                }
                Op::Region { entries } => {
                    let batch: Vec<_> =
                        entries.iter().map(|&(pc, pad)| LandingPadEntry::new(pc, pad)).collect();

                    let mut pads: BTreeMap<usize, usize> =
                        model.iter().map(|(&pc, held)| (pc, held.pad)).collect();
                    let mut conflict = false;
                    for &(pc, pad) in &entries {
                        if *pads.entry(pc).or_insert(pad) != pad {
                            conflict = true;
                        }
                    }

                    let result = registry.register_region(&batch);
                    if conflict {
                        prop_assert!(result.is_err());
                    } else {
                        let id = result.unwrap();
                        let mut keys: Vec<usize> = entries.iter().map(|&(pc, _)| pc).collect();
                        keys.sort_unstable();
                        keys.dedup();
                        for &key in &keys {
                            let pad = pads[&key];
                            model.entry(key).or_insert(Held { pad, direct: false, regions: 0 }).regions += 1;
                        }
                        regions.push((id, keys));
                    }
                }
                Op::Release { index } => {
                    if index < regions.len() {
                        let (id, keys) = regions.remove(index);
                        prop_assert!(registry.release_region(id));
                        prop_assert!(!registry.release_region(id));
                        for key in keys {
                            let released = {
                                let held = model.get_mut(&key).unwrap();
                                held.regions -= 1;
                                !held.direct && held.regions == 0
                            };
                            if released {
                                model.remove(&key);
                            }
                        }
                    }
                }
            }

            let expected: Vec<_> =
                model.iter().map(|(&pc, held)| LandingPadEntry::new(pc, held.pad)).collect();
            prop_assert_eq!(registry.entries(), expected);
            for i in 0..16 {
                let pc = 0x1000 + i * 4;
                prop_assert_eq!(registry.lookup(pc), model.get(&pc).map(|held| held.pad));
            }
        }
    }
}

#[test]
fn identical_regions_and_direct_registration_share_an_entry() {
    let registry = Registry::new();
    let entry = LandingPadEntry::new(0x5000, 0x6000);
    let first = registry.register_region(&[entry]).unwrap();
    let second = registry.register_region(&[entry]).unwrap();
    registry.register(0x5000, 0x6000).unwrap();

    // Every holder but the last can let go without the landing pad disappearing.
    assert!(registry.release_region(first));
    assert_eq!(registry.lookup(0x5000), Some(0x6000));
    assert!(registry.release_region(second));
    assert_eq!(registry.lookup(0x5000), Some(0x6000));
    assert!(registry.unregister(0x5000));
    assert_eq!(registry.lookup(0x5000), None);
}
