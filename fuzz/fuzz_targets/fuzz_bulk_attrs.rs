//! Fuzz target: bulk attribute stream parser.
//!
//! The read-all response is a length-prefixed record stream; a
//! truncated or malformed stream must fail with a protocol error, not
//! a panic or an out-of-bounds read.
//!
//! cargo fuzz run fuzz_bulk_attrs

#![no_main]

use iiod_client::attr::parse_bulk;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    for count in [0usize, 1, 3, 8] {
        if let Ok(entries) = parse_bulk(data, count) {
            assert_eq!(entries.len(), count);
            for entry in entries.into_iter().flatten() {
                // Record bodies always lie within the input.
                assert!(entry.len() <= data.len());
            }
        }
    }
});
