//! Bit-level access to instruction words.
//!
//! An instruction word is a little byte buffer, and the ISA metadata
//! describes operands as collections of inclusive `[lo, hi]` bit ranges
//! inside that word. Encoders and decoders in this crate go through the
//! two primitives below, plus the multi-range variants which concatenate
//! several ranges into one packed value.
//!
//! Bit addressing depends on the endian of the instruction word: in a
//! little-endian word, bit `i` is bit `i % 8` of byte `i / 8`; in a
//! big-endian word it is bit `(word_bits - 1 - i) % 8` of byte
//! `(word_bits - 1 - i) / 8`. Extracted values are always packed
//! LSB-first: output bit `j` is bit `j % 8` of `out[j / 8]`.

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Byte order of an instruction word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endian {
    Little,
    Big,
}

/// Order in which multi-range variants visit their ranges, keyed on the
/// low end of each range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

fn bit_position(i: u64, word_bits: u64, endian: Endian) -> (usize, u32) {
    let flat = match endian {
        Endian::Little => i,
        Endian::Big => word_bits - 1 - i,
    };
    ((flat / 8) as usize, (flat % 8) as u32)
}

fn check_range(lo: u64, hi: u64, word_bits: u64) -> Result<(), Error> {
    if lo > hi || hi >= word_bits {
        return Err(Error::InvalidBitRange { lo, hi, word_bits });
    }
    Ok(())
}

/// Extract the inclusive bit range `[lo, hi]` from `bytes`.
///
/// The returned buffer has `(hi - lo + 1 + 7) / 8` bytes; its bit `j`
/// corresponds to word bit `lo + j`.
pub fn extract_bits(
    bytes: &[u8],
    lo: u64,
    hi: u64,
    word_bits: u64,
    endian: Endian,
) -> Result<Vec<u8>, Error> {
    check_range(lo, hi, word_bits)?;

    let bit_count = hi - lo + 1;
    let mut result = vec![0u8; bit_count.div_ceil(8) as usize];
    for src_i in lo..=hi {
        let (byte_idx, bit_off) = bit_position(src_i, word_bits, endian);
        let bit = (bytes[byte_idx] >> bit_off) & 1;
        let dst_i = src_i - lo;
        result[(dst_i / 8) as usize] |= bit << (dst_i % 8);
    }
    Ok(result)
}

/// Write `value` into the inclusive bit range `[lo, hi]` of `bytes`.
/// Bit `j` of `value` goes to word bit `lo + j`. Bits of `bytes` outside
/// the range are left untouched.
pub fn set_bits(
    bytes: &mut [u8],
    lo: u64,
    hi: u64,
    word_bits: u64,
    value: &[u8],
    endian: Endian,
) -> Result<(), Error> {
    check_range(lo, hi, word_bits)?;

    let bit_count = hi - lo + 1;
    if (value.len() as u64) < bit_count.div_ceil(8) {
        return Err(Error::ValueTooShort {
            value_bits: value.len() as u64 * 8,
            range_bits: bit_count,
        });
    }

    for dst_i in lo..=hi {
        let src_i = dst_i - lo;
        let bit = (value[(src_i / 8) as usize] >> (src_i % 8)) & 1;
        let (byte_idx, bit_off) = bit_position(dst_i, word_bits, endian);
        bytes[byte_idx] &= !(1 << bit_off);
        bytes[byte_idx] |= bit << bit_off;
    }
    Ok(())
}

fn normalized_ranges(
    ranges: &[(u64, u64)],
    word_bits: u64,
    order: SortOrder,
) -> Result<Vec<(u64, u64)>, Error> {
    if ranges.is_empty() {
        return Err(Error::EmptyBitRanges);
    }
    let mut normalized: Vec<(u64, u64)> = Vec::with_capacity(ranges.len());
    for &(a, b) in ranges {
        let (lo, hi) = (a.min(b), a.max(b));
        check_range(lo, hi, word_bits)?;
        normalized.push((lo, hi));
    }
    match order {
        SortOrder::Ascending => normalized.sort_unstable(),
        SortOrder::Descending => normalized.sort_unstable_by(|x, y| y.cmp(x)),
    }
    Ok(normalized)
}

/// Number of bits covered by a list of ranges.
pub fn ranges_bit_count(ranges: &[(u64, u64)]) -> u64 {
    ranges
        .iter()
        .map(|&(a, b)| a.max(b) - a.min(b) + 1)
        .sum()
}

/// Extract several ranges and concatenate them, visiting ranges in the
/// requested order of their low bit.
pub fn extract_ranges(
    bytes: &[u8],
    ranges: &[(u64, u64)],
    word_bits: u64,
    endian: Endian,
    order: SortOrder,
) -> Result<Vec<u8>, Error> {
    let normalized = normalized_ranges(ranges, word_bits, order)?;
    let total_bits = ranges_bit_count(&normalized);
    let mut result = vec![0u8; total_bits.div_ceil(8) as usize];

    let mut out_pos = 0u64;
    for (lo, hi) in normalized {
        let piece = extract_bits(bytes, lo, hi, word_bits, endian)?;
        for j in 0..(hi - lo + 1) {
            let bit = (piece[(j / 8) as usize] >> (j % 8)) & 1;
            result[(out_pos / 8) as usize] |= bit << (out_pos % 8);
            out_pos += 1;
        }
    }
    Ok(result)
}

/// Inverse of [`extract_ranges`]: slice the packed `value` into the given
/// ranges in order and write each slice.
pub fn set_ranges(
    bytes: &mut [u8],
    ranges: &[(u64, u64)],
    word_bits: u64,
    value: &[u8],
    endian: Endian,
    order: SortOrder,
) -> Result<(), Error> {
    let normalized = normalized_ranges(ranges, word_bits, order)?;
    let total_bits = ranges_bit_count(&normalized);
    if (value.len() as u64) < total_bits.div_ceil(8) {
        return Err(Error::ValueTooShort {
            value_bits: value.len() as u64 * 8,
            range_bits: total_bits,
        });
    }

    let mut in_pos = 0u64;
    for (lo, hi) in normalized {
        let range_bits = hi - lo + 1;
        let mut piece = vec![0u8; range_bits.div_ceil(8) as usize];
        for j in 0..range_bits {
            let bit = (value[(in_pos / 8) as usize] >> (in_pos % 8)) & 1;
            piece[(j / 8) as usize] |= bit << (j % 8);
            in_pos += 1;
        }
        set_bits(bytes, lo, hi, word_bits, &piece, endian)?;
    }
    Ok(())
}

/// Merge an LSB-first packed bit buffer into an integer.
pub fn bits_to_u64(bits: &[u8]) -> u64 {
    let mut result = 0u64;
    for (i, &byte) in bits.iter().take(8).enumerate() {
        result |= (byte as u64) << (8 * i);
    }
    result
}

/// Split the low `bit_count` bits of `value` into an LSB-first packed buffer.
pub fn u64_to_bits(value: u64, bit_count: u64) -> Vec<u8> {
    let byte_count = bit_count.div_ceil(8) as usize;
    let mut bytes = vec![0u8; byte_count];
    for (i, byte) in bytes.iter_mut().enumerate() {
        *byte = (value >> (8 * i)) as u8;
    }
    if bit_count % 8 != 0 {
        let mask = (1u16 << (bit_count % 8)) as u8;
        bytes[byte_count - 1] &= mask.wrapping_sub(1);
    }
    bytes
}

/// Sign-extend the low `bits` bits of `value`.
pub fn sign_extend(value: u64, bits: u64) -> i64 {
    debug_assert!(bits > 0 && bits <= 64);
    if bits == 64 {
        return value as i64;
    }
    let sign = 1u64 << (bits - 1);
    if value & sign != 0 {
        (value | !(sign | (sign - 1))) as i64
    } else {
        value as i64
    }
}

/// True if `value` fits the `bits`-wide field, interpreted per `signed`.
pub fn fits_in(value: i64, bits: u64, signed: bool) -> bool {
    if bits >= 64 {
        return true;
    }
    if signed {
        let max = (1i64 << (bits - 1)) - 1;
        let min = -(1i64 << (bits - 1));
        value >= min && value <= max
    } else {
        value >= 0 && (value as u64) < (1u64 << bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_little_endian() {
        // Word 0x0000_b3a2 as little-endian bytes.
        let bytes = [0xa2, 0xb3, 0x00, 0x00];
        assert_eq!(
            extract_bits(&bytes, 0, 7, 32, Endian::Little).unwrap(),
            vec![0xa2]
        );
        assert_eq!(
            extract_bits(&bytes, 4, 11, 32, Endian::Little).unwrap(),
            vec![0x3a]
        );
    }

    #[test]
    fn extract_big_endian() {
        // Word bit i lives at bytes[(word_bits-1-i)/8], bit (word_bits-1-i)%8.
        let mut bytes = [0u8; 4];
        bytes[3] = 0x80; // flat bit 31 -> word bit 0
        assert_eq!(extract_bits(&bytes, 0, 0, 32, Endian::Big).unwrap(), vec![1]);

        let mut bytes = [0u8; 4];
        bytes[0] = 0x01; // flat bit 0 -> word bit 31
        assert_eq!(extract_bits(&bytes, 31, 31, 32, Endian::Big).unwrap(), vec![1]);

        let mut bytes = [0u8; 4];
        set_bits(&mut bytes, 4, 11, 32, &[0xd4], Endian::Big).unwrap();
        assert_eq!(extract_bits(&bytes, 4, 11, 32, Endian::Big).unwrap(), vec![0xd4]);
    }

    #[test]
    fn set_then_extract_round_trips() {
        let mut bytes = [0xffu8; 16];
        set_bits(&mut bytes, 10, 29, 128, &[0x34, 0x12, 0x0], Endian::Little).unwrap();
        let got = extract_bits(&bytes, 10, 29, 128, Endian::Little).unwrap();
        assert_eq!(got, vec![0x34, 0x12, 0x0]);
        // Bits outside the range keep their previous value.
        assert_eq!(extract_bits(&bytes, 0, 9, 128, Endian::Little).unwrap(), vec![0xff, 0x03]);
        assert_eq!(extract_bits(&bytes, 30, 31, 128, Endian::Little).unwrap(), vec![0x03]);
    }

    #[test]
    fn multi_range_concatenation_ascending() {
        let mut bytes = [0u8; 4];
        // Two disjoint ranges, 4 bits each; packed value 0xa5 -> 0x5 into
        // [0,3] and 0xa into [16,19].
        set_ranges(
            &mut bytes,
            &[(16, 19), (0, 3)],
            32,
            &[0xa5],
            Endian::Little,
            SortOrder::Ascending,
        )
        .unwrap();
        assert_eq!(bytes, [0x05, 0x00, 0x0a, 0x00]);
        let packed = extract_ranges(
            &bytes,
            &[(0, 3), (16, 19)],
            32,
            Endian::Little,
            SortOrder::Ascending,
        )
        .unwrap();
        assert_eq!(packed, vec![0xa5]);
    }

    #[test]
    fn multi_range_descending_reverses_order() {
        let mut bytes = [0u8; 4];
        set_ranges(
            &mut bytes,
            &[(0, 3), (16, 19)],
            32,
            &[0xa5],
            Endian::Little,
            SortOrder::Descending,
        )
        .unwrap();
        // High range consumes the low nibble of the packed value.
        assert_eq!(bytes, [0x0a, 0x00, 0x05, 0x00]);
    }

    #[test]
    fn round_trip_with_uncovered_bit_noise() {
        // extract ∘ set is the identity on covered bits for any noise in
        // the uncovered ones.
        let ranges = [(3, 9), (40, 51), (120, 127)];
        for seed in [0x00u8, 0x5a, 0xff] {
            let mut bytes = [seed; 16];
            let value = [0xde, 0xad, 0xbe, 0x0f];
            set_ranges(&mut bytes, &ranges, 128, &value, Endian::Little, SortOrder::Ascending)
                .unwrap();
            let got = extract_ranges(&bytes, &ranges, 128, Endian::Little, SortOrder::Ascending)
                .unwrap();
            let total_bits = ranges_bit_count(&ranges);
            let mut expected = value.to_vec();
            // Mask the tail beyond the covered bit count.
            let last = ((total_bits + 7) / 8 - 1) as usize;
            if total_bits % 8 != 0 {
                expected[last] &= (1u8 << (total_bits % 8)) - 1;
            }
            assert_eq!(got, expected[..=last].to_vec());
        }
    }

    #[test]
    fn rejects_bad_ranges() {
        let mut bytes = [0u8; 4];
        assert!(matches!(
            extract_bits(&bytes, 9, 3, 32, Endian::Little),
            Err(Error::InvalidBitRange { .. })
        ));
        assert!(matches!(
            extract_bits(&bytes, 0, 32, 32, Endian::Little),
            Err(Error::InvalidBitRange { .. })
        ));
        assert!(matches!(
            set_bits(&mut bytes, 0, 15, 32, &[0xff], Endian::Little),
            Err(Error::ValueTooShort { .. })
        ));
        assert!(matches!(
            extract_ranges(&bytes, &[], 32, Endian::Little, SortOrder::Ascending),
            Err(Error::EmptyBitRanges)
        ));
    }

    #[test]
    fn sign_extension() {
        assert_eq!(sign_extend(0x7f, 8), 127);
        assert_eq!(sign_extend(0x80, 8), -128);
        assert_eq!(sign_extend(0xfff, 12), -1);
        assert_eq!(sign_extend(0x800, 12), -2048);
    }

    #[test]
    fn fits() {
        assert!(fits_in(-2048, 12, true));
        assert!(!fits_in(-2049, 12, true));
        assert!(fits_in(4095, 12, false));
        assert!(!fits_in(4096, 12, false));
        assert!(!fits_in(-1, 12, false));
    }
}
