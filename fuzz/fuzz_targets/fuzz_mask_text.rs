//! Fuzz target: channels-mask text parser.
//!
//! The mask line arrives from the server on every legacy buffer read.
//! Asserts the parser never panics and that every accepted input
//! re-serialises to its canonical lowercase form.
//!
//! cargo fuzz run fuzz_mask_text

#![no_main]

use iiod_client::ChannelsMask;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = core::str::from_utf8(data) else {
        return;
    };

    for nb_words in 1..4usize {
        if let Ok(mask) = ChannelsMask::from_text(text, nb_words) {
            let canonical = mask.to_text();
            assert_eq!(canonical.len(), nb_words * 8);
            // Round trip must be stable.
            let again = ChannelsMask::from_text(&canonical, nb_words).unwrap();
            assert_eq!(again, mask);
        }
    }
});
