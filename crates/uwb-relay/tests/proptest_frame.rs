//! Property-based tests for the inbound frame scanner.

use proptest::prelude::*;
use uwb_relay::frame::{decode_all, encode_frame, END_BYTE, START_BYTE};
use uwb_relay::FrameError;

// ─── Valid Frames ───────────────────────────────────────────────────────────

proptest! {
    /// Any distance survives the wire frame unchanged.
    #[test]
    fn valid_frame_decodes_to_distance(distance in any::<u16>()) {
        let frame = encode_frame(distance);
        prop_assert_eq!(frame[0], START_BYTE);
        prop_assert_eq!(frame[3], END_BYTE);
        prop_assert_eq!(decode_all(&frame), vec![Ok(distance)]);
    }

    /// Back-to-back frames decode in arrival order.
    #[test]
    fn frames_decode_in_order(distances in prop::collection::vec(any::<u16>(), 0..32)) {
        let bytes: Vec<u8> = distances.iter().flat_map(|&d| encode_frame(d)).collect();
        let expected: Vec<Result<u16, FrameError>> = distances.iter().map(|&d| Ok(d)).collect();
        prop_assert_eq!(decode_all(&bytes), expected);
    }
}

// ─── Resynchronisation ──────────────────────────────────────────────────────

proptest! {
    /// A bad end byte costs only the three bytes read after the start byte;
    /// the frame right behind it is still found.
    #[test]
    fn bad_end_byte_then_valid_frame(
        hi in any::<u8>(),
        lo in any::<u8>(),
        end in any::<u8>().prop_filter("not an end byte", |b| *b != END_BYTE),
        next in any::<u16>(),
    ) {
        let mut bytes = vec![START_BYTE, hi, lo, end];
        bytes.extend_from_slice(&encode_frame(next));
        prop_assert_eq!(
            decode_all(&bytes),
            vec![Err(FrameError::BadEndByte { found: end }), Ok(next)]
        );
    }

    /// Without a start byte nothing is ever emitted.
    #[test]
    fn noise_without_start_byte_yields_nothing(
        noise in prop::collection::vec(any::<u8>().prop_filter("no start byte", |b| *b != START_BYTE), 0..256),
    ) {
        prop_assert!(decode_all(&noise).is_empty());
    }

    /// Leading noise without a start byte does not hide the frame behind it.
    #[test]
    fn frame_after_noise_is_found(
        noise in prop::collection::vec(any::<u8>().prop_filter("no start byte", |b| *b != START_BYTE), 0..64),
        distance in any::<u16>(),
    ) {
        let mut bytes = noise;
        bytes.extend_from_slice(&encode_frame(distance));
        prop_assert_eq!(decode_all(&bytes), vec![Ok(distance)]);
    }

    /// Every emitted distance comes from a real start..end window in the input.
    #[test]
    fn emitted_values_have_matching_window(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
        for value in decode_all(&bytes).into_iter().flatten() {
            let [hi, lo] = value.to_be_bytes();
            let found = bytes
                .windows(4)
                .any(|w| w == [START_BYTE, hi, lo, END_BYTE]);
            prop_assert!(found, "no window for {}", value);
        }
    }
}

// ─── Truncation ─────────────────────────────────────────────────────────────

#[test]
fn truncated_frame_reports_short_read() {
    assert_eq!(
        decode_all(&[START_BYTE, 0x01]),
        vec![Err(FrameError::ShortRead { got: 1 })]
    );
    assert_eq!(
        decode_all(&[START_BYTE]),
        vec![Err(FrameError::ShortRead { got: 0 })]
    );
}
