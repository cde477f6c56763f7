use proptest::prelude::*;

use crate::{AccessSize, MapRegisterSpace, RegisterDef, RegisterSpace};

const OFFSETS: [u64; 4] = [0x00, 0x08, 0x10, 0x18];

fn test_map() -> Vec<RegisterDef> {
    OFFSETS
        .iter()
        .map(|&offset| RegisterDef {
            offset,
            name: "REG",
            size: 8,
            init: 0,
        })
        .collect()
}

fn size_strategy() -> impl Strategy<Value = AccessSize> {
    prop_oneof![
        Just(AccessSize::Byte),
        Just(AccessSize::Word16),
        Just(AccessSize::Word32),
        Just(AccessSize::Word64),
    ]
}

proptest! {
    /// Absent hooks, a write followed by a read at the same offset returns
    /// the written value truncated to the read size, for every width pair.
    #[test]
    fn round_trip_law(
        offset_index in 0usize..OFFSETS.len(),
        write_size in size_strategy(),
        read_size in size_strategy(),
        value: u64,
    ) {
        let map = test_map();
        let mut space = MapRegisterSpace::new("prop", &map).unwrap();
        let offset = OFFSETS[offset_index];

        space.write(offset, write_size, value).unwrap();
        let got = space.read(offset, read_size).unwrap();
        prop_assert_eq!(got, read_size.mask(write_size.mask(value)));
    }

    /// Writes to one offset never disturb sibling cells.
    #[test]
    fn writes_are_isolated_per_offset(
        target in 0usize..OFFSETS.len(),
        value: u64,
    ) {
        let map = test_map();
        let mut space = MapRegisterSpace::new("prop", &map).unwrap();
        for (i, &offset) in OFFSETS.iter().enumerate() {
            space.write(offset, AccessSize::Word64, i as u64 + 1).unwrap();
        }

        space.write(OFFSETS[target], AccessSize::Word64, value).unwrap();

        for (i, &offset) in OFFSETS.iter().enumerate() {
            let expect = if i == target { value } else { i as u64 + 1 };
            prop_assert_eq!(space.read(offset, AccessSize::Word64).unwrap(), expect);
        }
    }
}
