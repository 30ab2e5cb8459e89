//! Fuzz target: legacy integer-line parser.
//!
//! Response framing starts with a signed decimal integer line coming
//! straight off the wire. Drives arbitrary bytes through the parser
//! and asserts it never panics and agrees with the std parser on
//! canonical inputs.
//!
//! cargo fuzz run fuzz_integer_line

#![no_main]

use iiod_client::proto::legacy::parse_integer;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let result = parse_integer(data);

    // Cross-check canonical decimal lines against the std parser.
    if let Ok(text) = core::str::from_utf8(data) {
        let trimmed = text.trim_start_matches('\n');
        if let Ok(reference) = trimmed.parse::<i64>() {
            assert_eq!(result, Ok(reference));
        }
    }
});
