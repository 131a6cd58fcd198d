// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for the page table
//! OWNERS: @kernel-mm-team
//! NOTE: Tests only; random map/unmap sequences checked against a flat model.
//!
//! TEST_SCOPE:
//!   - translate agrees with the model after every step
//!   - every mapped frame carries exactly one pin; displaced frames are released
//!   - directory pin counts stay consistent and unmapping everything returns every frame

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use proptest::prelude::*;

use super::{FramePool, PageTable};
use crate::testing::{HostFramePool, RW_USER};
use crate::types::{PageIndex, VirtAddr};

/// Window straddling a top-level directory boundary.
const BASE_VPN: u64 = (1 << 27) - 128;
const WINDOW: u64 = 256;

#[derive(Clone, Debug)]
enum Op {
    Map { page: u64, count: u64 },
    Unmap { page: u64, count: u64 },
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..WINDOW, 1u64..8).prop_map(|(page, count)| Op::Map { page, count }),
        (0..WINDOW, 1u64..8).prop_map(|(page, count)| Op::Unmap { page, count }),
    ]
}

fn page_va(page: u64) -> VirtAddr {
    VirtAddr::from_vpn(BASE_VPN + page)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn random_map_unmap_matches_model(ops in proptest::collection::vec(arb_op(), 1..40)) {
        let pool = HostFramePool::shared(512);
        let baseline = pool.free_count();
        let mut table = PageTable::new(pool.clone()).unwrap();
        let mut model: BTreeMap<u64, PageIndex> = BTreeMap::new();

        for op in ops {
            match op {
                Op::Map { page, count } => {
                    let count = count.min(WINDOW - page);
                    let frames: Vec<PageIndex> =
                        (0..count).filter_map(|_| pool.alloc_frame()).collect();
                    prop_assert_eq!(frames.len() as u64, count);
                    table.map(page_va(page), count, &mut frames.iter().copied(), RW_USER).unwrap();
                    for (i, frame) in frames.into_iter().enumerate() {
                        model.insert(page + i as u64, frame);
                    }
                }
                Op::Unmap { page, count } => {
                    let count = count.min(WINDOW - page);
                    if (page..page + count).any(|p| !model.contains_key(&p)) {
                        continue;
                    }
                    table.unmap(page_va(page), count, true).unwrap();
                    for p in page..page + count {
                        let frame = model.remove(&p).unwrap();
                        prop_assert!(!pool.is_allocated(frame));
                    }
                }
            }

            prop_assert!(table.verify().is_ok());
            for page in 0..WINDOW {
                prop_assert_eq!(table.translate(page_va(page)), model.get(&page).copied());
            }
            for frame in model.values() {
                prop_assert_eq!(pool.frame(*frame).refcount(), 1);
            }
        }

        for (page, _) in core::mem::take(&mut model) {
            table.unmap(page_va(page), 1, true).unwrap();
        }
        prop_assert!(table.verify().is_ok());
        drop(table);
        prop_assert_eq!(pool.free_count(), baseline);
    }
}
