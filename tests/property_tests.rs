//! Property tests for the pure wire-level transforms.
//!
//! The sample codec, the mask codec and the text-protocol parsers all
//! run on attacker-controlled bytes, so the invariants are checked
//! over generated inputs rather than hand-picked vectors.

use iiod_client::proto::legacy::parse_integer;
use iiod_client::{ChannelsMask, DataFormat, Error, attr};
use proptest::prelude::*;

// ── Generators ───────────────────────────────────────────────

fn arb_format() -> impl Strategy<Value = DataFormat> {
    (1u32..=64u32)
        .prop_flat_map(|bits| {
            let min_len = bits.div_ceil(8) * 8;
            let lengths: Vec<u32> = (min_len..=64).step_by(8).collect();
            (Just(bits), proptest::sample::select(lengths))
        })
        .prop_flat_map(|(bits, length)| {
            (
                Just(bits),
                Just(length),
                0..=(length - bits),
                any::<bool>(),
                any::<bool>(),
                any::<bool>(),
                1u32..=3u32,
            )
        })
        .prop_map(
            |(bits, length, shift, is_signed, is_be, is_fully_defined, repeat)| DataFormat {
                length,
                bits,
                shift,
                is_signed,
                is_fully_defined,
                is_be,
                repeat,
                scale: None,
                offset: None,
            },
        )
}

fn arb_format_and_sample() -> impl Strategy<Value = (DataFormat, Vec<u8>)> {
    arb_format().prop_flat_map(|fmt| {
        let len = fmt.sample_size();
        (Just(fmt), proptest::collection::vec(any::<u8>(), len))
    })
}

/// Wire-order integer value of one storage group.
fn wire_value(bytes: &[u8], is_be: bool) -> u64 {
    let mut b = [0u8; 8];
    if is_be {
        b[8 - bytes.len()..].copy_from_slice(bytes);
        u64::from_be_bytes(b)
    } else {
        b[..bytes.len()].copy_from_slice(bytes);
        u64::from_le_bytes(b)
    }
}

fn low_mask(bits: u32) -> u64 {
    if bits >= 64 { u64::MAX } else { (1u64 << bits) - 1 }
}

// ── Codec invariants ─────────────────────────────────────────

proptest! {
    /// Decode-then-encode preserves every bit inside
    /// `[shift, shift + bits)` and zeroes every bit outside it.
    #[test]
    fn decode_encode_window_is_lossless((fmt, sample) in arb_format_and_sample()) {
        prop_assert!(fmt.validate().is_ok());

        let mut decoded = vec![0u8; sample.len()];
        fmt.convert(&mut decoded, &sample);

        let mut encoded = vec![0u8; sample.len()];
        fmt.convert_inverse(&mut encoded, &decoded).unwrap();

        let w = fmt.storage_bytes();
        let window = low_mask(fmt.bits) << fmt.shift;
        for (orig, enc) in sample.chunks_exact(w).zip(encoded.chunks_exact(w)) {
            let orig = wire_value(orig, fmt.is_be);
            let enc = wire_value(enc, fmt.is_be);
            prop_assert_eq!(orig & window, enc & window, "window bits changed");
            prop_assert_eq!(enc & !window, 0, "bits outside the window not zeroed");
        }
    }

    /// Signed, not-fully-defined decodes sign-extend: every bit above
    /// `bits - 1` equals bit `bits - 1`.
    #[test]
    fn signed_decode_sign_extends((mut fmt, sample) in arb_format_and_sample()) {
        fmt.is_signed = true;
        fmt.is_fully_defined = false;

        let mut decoded = vec![0u8; sample.len()];
        fmt.convert(&mut decoded, &sample);

        let w = fmt.storage_bytes();
        for group in decoded.chunks_exact(w) {
            let host_le = cfg!(target_endian = "little");
            let value = wire_value(group, !host_le);
            let sign = (value >> (fmt.bits - 1)) & 1;
            let upper_width = fmt.length - fmt.bits;
            if upper_width > 0 {
                let upper = (value >> fmt.bits) & low_mask(upper_width);
                let expected = if sign == 1 { low_mask(upper_width) } else { 0 };
                prop_assert_eq!(upper, expected, "upper bits disagree with sign bit");
            }
        }
    }

    /// A decoded value re-encodes and decodes back to itself: the
    /// host representation is a fixed point of the codec pair.
    #[test]
    fn decode_is_stable_under_round_trip((fmt, sample) in arb_format_and_sample()) {
        let mut host = vec![0u8; sample.len()];
        fmt.convert(&mut host, &sample);

        let mut wire = vec![0u8; sample.len()];
        fmt.convert_inverse(&mut wire, &host).unwrap();

        let mut host2 = vec![0u8; sample.len()];
        fmt.convert(&mut host2, &wire);

        if !fmt.is_fully_defined {
            prop_assert_eq!(host, host2, "decode∘encode∘decode must stabilise");
        }
    }
}

// ── Mask invariants ──────────────────────────────────────────

proptest! {
    /// Text serialisation round-trips byte-identically.
    #[test]
    fn mask_text_round_trip(words in proptest::collection::vec(any::<u32>(), 1..5)) {
        let mask = ChannelsMask::from_words(words);
        let text = mask.to_text();
        prop_assert_eq!(text.len(), mask.nb_words() * 8);

        let parsed = ChannelsMask::from_text(&text, mask.nb_words()).unwrap();
        prop_assert_eq!(&parsed, &mask);
        prop_assert_eq!(parsed.to_text(), text);
    }

    /// Binary serialisation round-trips exactly.
    #[test]
    fn mask_binary_round_trip(words in proptest::collection::vec(any::<u32>(), 1..5)) {
        let mask = ChannelsMask::from_words(words);
        let parsed = ChannelsMask::from_bytes(&mask.to_bytes()).unwrap();
        prop_assert_eq!(parsed, mask);
    }
}

// ── Text parser totality ─────────────────────────────────────

proptest! {
    /// The integer-line parser never panics and only fails with
    /// InvalidArg, whatever the bytes.
    #[test]
    fn integer_parser_total(bytes in proptest::collection::vec(any::<u8>(), 0..40)) {
        match parse_integer(&bytes) {
            Ok(_) => {}
            Err(err) => prop_assert_eq!(err, Error::InvalidArg),
        }
    }

    /// Canonical decimal renderings parse back to the same value,
    /// with or without stray leading newlines.
    #[test]
    fn integer_parser_round_trip(value in any::<i64>(), newlines in 0usize..3) {
        let mut line = "\n".repeat(newlines);
        line.push_str(&value.to_string());
        prop_assert_eq!(parse_integer(line.as_bytes()), Ok(value));
    }

    /// Base-0 integer attribute parsing accepts every decimal i64.
    #[test]
    fn longlong_parser_round_trip(value in any::<i64>()) {
        prop_assert_eq!(attr::parse_longlong(&value.to_string()), Ok(value));
    }

    /// Bulk attribute parsing never panics on arbitrary buffers.
    #[test]
    fn bulk_parser_total(
        bytes in proptest::collection::vec(any::<u8>(), 0..64),
        count in 0usize..6,
    ) {
        let _ = attr::parse_bulk(&bytes, count);
    }
}
