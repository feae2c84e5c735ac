//! Wrap-aware 16-bit sequence numbers, reconstructed to an internal
//! monotonically increasing 64-bit form.
//!
//! Only wire I/O ever sees the 16-bit form; everything else in the
//! engine (sender/receiver buffers, ACK bookkeeping, `sequenceMemo`)
//! works in the non-wrapping 64-bit space so comparisons and
//!`BTreeMap` ordering behave correctly across wraps.

/// Mask of the 16-bit wire sequence number space.
pub const SN_MASK: u16 = 0xFFFF;

/// Size of the 16-bit wire sequence number space.
pub const SN_SPACE: u64 = 0x1_0000;

/// Truncate a non-wrapping sequence number to its wire form.
pub fn to_wire(non_wrapping: u64) -> u16 {
    (non_wrapping & SN_MASK as u64) as u16
}

/// Reconstruct a non-wrapping sequence number from an observed 16-bit
/// value, given a nearby non-wrapping reference (typically the next SN
/// to be assigned/expected on the same channel).
///
/// If the observed low bits are greater than the reference's low bits,
/// the observed value is assumed to predate a wrap the reference has
/// already crossed, and one mask-width is subtracted.
pub fn reconstruct(reference: u64, observed: u16) -> u64 {
    let reference_low = to_wire(reference);
    let reference_high = reference - reference_low as u64;
    let candidate = reference_high + observed as u64;

    if observed > reference_low {
        candidate.checked_sub(SN_SPACE).unwrap_or(observed as u64)
    } else {
        candidate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_low_bits_returns_reference_unchanged() {
        let reference = 70_000u64;
        let observed = to_wire(reference);
        assert_eq!(reconstruct(reference, observed), reference);
    }

    #[test]
    fn observed_greater_than_reference_low_bits_predates_a_wrap() {
        // reference just wrapped from 0xFFFF to 0x1_0000 + 5
        let reference = SN_SPACE + 5;
        let observed: u16 = 0xFFF0; // sent right before the wrap
        let reconstructed = reconstruct(reference, observed);
        assert_eq!(reconstructed, observed as u64);
    }

    #[test]
    fn reconstructs_recently_sent_sequence_numbers() {
        let reference = 1_000_000u64;
        for delta in 0u64..2000 {
            let value = reference - delta;
            let wire = to_wire(value);
            assert_eq!(reconstruct(reference, wire), value);
        }
    }
}
