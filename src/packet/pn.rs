//! Packet-number truncation and reconstruction (§3 data model, §8 testable property).
//!
//! Packet numbers are monotonically increasing 62-bit values within a packet-number space but
//! are only ever sent truncated to 1, 2, or 4 bytes. The receiver reconstructs the full value
//! using the largest packet number it has seen so far in that space and the candidate nearest
//! `largest_seen + 1` that is representable in the truncated width.

pub const MAX_PACKET_NUMBER: u64 = (1u64 << 62) - 1;

/// Picks the narrowest of {1, 2, 4} bytes that unambiguously represents `pn` given the largest
/// packet number the peer is known to have acknowledged so far in this space.
pub fn encode_len(pn: u64, largest_acked: Option<u64>) -> usize {
    let num_unacked = match largest_acked {
        Some(largest_acked) => pn.saturating_sub(largest_acked),
        None => pn + 1,
    };
    if num_unacked < (1 << 7) {
        1
    } else if num_unacked < (1 << 15) {
        2
    } else {
        4
    }
}

/// Truncates `pn` to its low `len` bytes, big-endian (§3).
pub fn truncate(pn: u64, len: usize) -> Vec<u8> {
    debug_assert!(matches!(len, 1 | 2 | 4));
    pn.to_be_bytes()[8 - len..].to_vec()
}

/// Reconstructs a full packet number from its truncated wire representation and the largest
/// packet number previously seen in the same space, per the window rule in §3: the candidate
/// nearest `largest_seen + 1` representable in the truncated width wins.
pub fn reconstruct(largest_seen: Option<u64>, truncated: u64, len: usize) -> u64 {
    debug_assert!(matches!(len, 1 | 2 | 4));
    let pn_nbits = (len as u32) * 8;
    let expected = largest_seen.map(|l| l + 1).unwrap_or(0);
    let pn_win: u64 = 1u64 << pn_nbits;
    let pn_hwin = pn_win / 2;
    let pn_mask = pn_win - 1;

    let candidate = (expected & !pn_mask) | truncated;

    if candidate + pn_hwin <= expected && candidate < MAX_PACKET_NUMBER.saturating_sub(pn_win) + 1
    {
        candidate + pn_win
    } else if candidate > expected + pn_hwin && candidate >= pn_win {
        candidate - pn_win
    } else {
        candidate
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trips_near_largest_seen() {
        for largest_seen in [0u64, 1, 127, 128, 300, 70000, 1 << 40] {
            for pn in largest_seen..largest_seen + 50 {
                let len = encode_len(pn, Some(largest_seen));
                let truncated_bytes = truncate(pn, len);
                let mut truncated = 0u64;
                for b in &truncated_bytes {
                    truncated = (truncated << 8) | *b as u64;
                }
                let reconstructed = reconstruct(Some(largest_seen), truncated, len);
                assert_eq!(reconstructed, pn, "len={len} largest_seen={largest_seen}");
            }
        }
    }

    #[test]
    fn reconstructed_within_half_window() {
        // §8: for all (largest_seen, truncated, len) with truncated < 2^(8*len), the
        // reconstructed PN is within 2^(8*len-1) of largest_seen+1.
        for len in [1usize, 2, 4] {
            for largest_seen in [0u64, 10, 1000, 1 << 20] {
                for truncated in [0u64, 1, 63, 200, 40000, u32::MAX as u64] {
                    let bits = (len as u32) * 8;
                    if truncated >= (1u64 << bits) {
                        continue;
                    }
                    let reconstructed = reconstruct(Some(largest_seen), truncated, len);
                    let expected = largest_seen + 1;
                    let half_window = 1i128 << (bits - 1);
                    let diff = (reconstructed as i128) - (expected as i128);
                    assert!(diff.abs() <= half_window, "len={len} truncated={truncated} largest_seen={largest_seen} reconstructed={reconstructed}");
                }
            }
        }
    }
}
