// IRQSMP MASK CODEC PROPERTIES
// RANDOMIZED OVER MASK WIDTHS OF 64..512 CPUS AND ARBITRARY CPU SETS.

use irqsmp::cpuset::CpuSet;
use irqsmp::mask::{self, AffinityMask};
use proptest::prelude::*;

// LOWERCASE HEX, COMMA EVERY 8 DIGITS, WHOLE 64-BIT WORDS
fn mask_text() -> impl Strategy<Value = String> {
    (1usize..=8)
        .prop_flat_map(|words| prop::collection::vec(any::<u32>(), words * 2))
        .prop_map(|groups| {
            groups
                .iter()
                .map(|g| format!("{:08x}", g))
                .collect::<Vec<_>>()
                .join(",")
        })
}

// A MASK AND A NON-EMPTY CPU SET THAT FITS IN IT
fn mask_and_cpus() -> impl Strategy<Value = (String, String)> {
    mask_text().prop_flat_map(|text| {
        let width = AffinityMask::decode(&text).unwrap().width();
        let cpus = prop::collection::btree_set(0..width, 1..16)
            .prop_map(|set| set.into_iter().collect::<CpuSet>().to_string());
        (Just(text), cpus)
    })
}

proptest! {
    #[test]
    fn decode_encode_round_trip(text in mask_text()) {
        prop_assert_eq!(AffinityMask::decode(&text).unwrap().encode(), text);
    }

    #[test]
    fn double_inversion(bytes in prop::collection::vec(any::<u8>(), 0..64)) {
        let m = AffinityMask::from_bytes(bytes.clone());
        let inv2 = m.invert().invert();
        prop_assert_eq!(inv2.as_bytes(), bytes.as_slice());
    }

    #[test]
    fn disable_then_enable_restores((text, cpus) in mask_and_cpus()) {
        let reserved = mask::update_affinity_mask(&cpus, &text, false).unwrap();
        let released = mask::update_affinity_mask(&cpus, &reserved.mask, true).unwrap();

        // EVERY RESERVED CPU IS OUT OF THE MASK AND IN THE BANNED SET
        let set = CpuSet::parse(&cpus).unwrap();
        let affinity = mask::mask_to_cpuset(&reserved.mask).unwrap();
        let banned = mask::mask_to_cpuset(&reserved.banned).unwrap();
        for cpu in set.iter() {
            prop_assert!(!affinity.contains(cpu));
            prop_assert!(banned.contains(cpu));
        }

        // RELEASE SETS THE CPUS, SO THE INPUT COMES BACK ONLY WHERE
        // THEY WERE SET BEFORE
        let before = mask::mask_to_cpuset(&text).unwrap();
        if set.iter().all(|cpu| before.contains(cpu)) {
            prop_assert_eq!(released.mask, text);
        } else {
            let after = mask::mask_to_cpuset(&released.mask).unwrap();
            for cpu in set.iter() {
                prop_assert!(after.contains(cpu));
            }
        }
    }

    #[test]
    fn banned_is_inverse_of_mask((text, cpus) in mask_and_cpus(), enable in any::<bool>()) {
        let update = mask::update_affinity_mask(&cpus, &text, enable).unwrap();
        prop_assert_eq!(mask::invert_mask_text(&update.mask).unwrap(), update.banned);
    }

    #[test]
    fn cpuset_display_parses_back(set in prop::collection::btree_set(0usize..512, 1..64)) {
        let cpus: CpuSet = set.iter().copied().collect();
        let parsed = CpuSet::parse(&cpus.to_string()).unwrap();
        prop_assert_eq!(parsed, cpus);
    }
}
