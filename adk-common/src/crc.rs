// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Table-driven CRC checksums in the variants the runtime and its tests
//! rely on, plus the NMEA sentence checksum. Tables are generated at
//! compile time from the polynomial constants.
//!
//! Each algorithm has a one-pass batch form and a streaming update form.
//! Note that [update_crc_32] applies the final XOR on *every* call, so
//! composing it over split inputs does not reproduce [crc_32] of the
//! concatenation; callers chain the returned value as-is and rely on the
//! observed behavior.

const CRC_POLY_8_SHT75: u8 = 0x31;
const CRC_POLY_16: u16 = 0xA001;
const CRC_POLY_32: u32 = 0xEDB8_8320;
const CRC_POLY_64: u64 = 0x42F0_E1EB_A9EA_3693;

pub const CRC_START_8: u8 = 0x00;
pub const CRC_START_16: u16 = 0x0000;
pub const CRC_START_MODBUS: u16 = 0xFFFF;
pub const CRC_START_32: u32 = 0xFFFF_FFFF;
pub const CRC_START_64_ECMA: u64 = 0;
pub const CRC_START_64_WE: u64 = 0xFFFF_FFFF_FFFF_FFFF;

const fn gen_table_8() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ CRC_POLY_8_SHT75
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

const fn gen_table_16() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u16;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ CRC_POLY_16 } else { crc >> 1 };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

const fn gen_table_32() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ CRC_POLY_32 } else { crc >> 1 };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

const fn gen_table_64() -> [u64; 256] {
    let mut table = [0u64; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u64) << 56;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000_0000_0000_0000 != 0 {
                (crc << 1) ^ CRC_POLY_64
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC_TAB_8: [u8; 256] = gen_table_8();
static CRC_TAB_16: [u16; 256] = gen_table_16();
static CRC_TAB_32: [u32; 256] = gen_table_32();
static CRC_TAB_64: [u64; 256] = gen_table_64();

/// CRC-8 with the sht75 polynomial (0x31).
pub fn crc_8(input: &[u8]) -> u8 {
    input
        .iter()
        .fold(CRC_START_8, |crc, &byte| CRC_TAB_8[(byte ^ crc) as usize])
}

pub fn update_crc_8(crc: u8, byte: u8) -> u8 {
    CRC_TAB_8[(byte ^ crc) as usize]
}

/// CRC-16/ARC (polynomial 0xA001, zero init).
pub fn crc_16(input: &[u8]) -> u16 {
    input.iter().fold(CRC_START_16, |crc, &byte| update_crc_16(crc, byte))
}

/// CRC-16/MODBUS: same polynomial, all-ones init.
pub fn crc_16_modbus(input: &[u8]) -> u16 {
    input
        .iter()
        .fold(CRC_START_MODBUS, |crc, &byte| update_crc_16(crc, byte))
}

pub fn update_crc_16(crc: u16, byte: u8) -> u16 {
    (crc >> 8) ^ CRC_TAB_16[((crc ^ byte as u16) & 0x00FF) as usize]
}

/// Standard CRC-32 (polynomial 0xEDB88320, all-ones init and final XOR).
pub fn crc_32(input: &[u8]) -> u32 {
    let crc = input
        .iter()
        .fold(CRC_START_32, |crc, &byte| raw_update_32(crc, byte));
    crc ^ 0xFFFF_FFFF
}

/// CRC-32 over a string's bytes.
pub fn crc_str_32(input: &str) -> u32 {
    crc_32(input.as_bytes())
}

/// Streaming CRC-32 update. The final XOR is applied on every call, so
/// feed the returned value straight back in; the result over split inputs
/// intentionally differs from [crc_32] of the concatenation.
pub fn update_crc_32(crc: u32, input: &[u8]) -> u32 {
    let crc = input.iter().fold(crc, |crc, &byte| raw_update_32(crc, byte));
    crc ^ 0xFFFF_FFFF
}

/// As [update_crc_32] over a string's bytes.
pub fn update_crc_str_32(crc: u32, input: &str) -> u32 {
    update_crc_32(crc, input.as_bytes())
}

#[inline]
fn raw_update_32(crc: u32, byte: u8) -> u32 {
    (crc >> 8) ^ CRC_TAB_32[((crc ^ byte as u32) & 0xFF) as usize]
}

/// CRC-64/ECMA-182 (polynomial 0x42F0E1EBA9EA3693, zero init, no XOR).
pub fn crc_64_ecma(input: &[u8]) -> u64 {
    input
        .iter()
        .fold(CRC_START_64_ECMA, |crc, &byte| update_crc_64_ecma(crc, byte))
}

/// CRC-64/WE: same polynomial, all-ones init and final XOR.
pub fn crc_64_we(input: &[u8]) -> u64 {
    let crc = input
        .iter()
        .fold(CRC_START_64_WE, |crc, &byte| update_crc_64_ecma(crc, byte));
    crc ^ 0xFFFF_FFFF_FFFF_FFFF
}

pub fn update_crc_64_ecma(crc: u64, byte: u8) -> u64 {
    (crc << 8) ^ CRC_TAB_64[(((crc >> 56) ^ byte as u64) & 0xFF) as usize]
}

/// XOR checksum of an NMEA sentence. A leading `$` is skipped; the scan
/// stops at `*`, CR, LF or end of input. Returns the checksum as two
/// uppercase hex characters.
pub fn checksum_nmea(input: &[u8]) -> [u8; 2] {
    let body = input.strip_prefix(b"$").unwrap_or(input);
    let mut checksum = 0u8;
    for &byte in body {
        if byte == b'\r' || byte == b'\n' || byte == b'*' || byte == 0 {
            break;
        }
        checksum ^= byte;
    }
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    [HEX[(checksum >> 4) as usize], HEX[(checksum & 0x0F) as usize]]
}

#[cfg(test)]
mod tests {
    use super::*;

    // Known-answer input shared by every CRC variant.
    const INPUT: &[u8] = b"The only thing predictable about life is its unpredictability";

    #[test]
    fn crc_8_known_answer() {
        assert_eq!(crc_8(INPUT), 0xC2);
    }

    #[test]
    fn crc_16_known_answer() {
        assert_eq!(crc_16(INPUT), 0xF9F4);
    }

    #[test]
    fn crc_16_modbus_known_answer() {
        assert_eq!(crc_16_modbus(INPUT), 0xB96F);
    }

    #[test]
    fn crc_32_known_answer() {
        assert_eq!(crc_32(INPUT), 0x5F51_349F);
        assert_eq!(crc_str_32("The only thing predictable about life is its unpredictability"), 0x5F51_349F);
    }

    #[test]
    fn crc_64_known_answers() {
        assert_eq!(crc_64_ecma(INPUT), 0x6FEA_9F81_F907_CC6D);
        assert_eq!(crc_64_we(INPUT), 0xF508_EFD8_CFCC_9F73);
    }

    #[test]
    fn streaming_8_16_64_match_batch() {
        let streamed8 = INPUT.iter().fold(CRC_START_8, |c, &b| update_crc_8(c, b));
        assert_eq!(streamed8, crc_8(INPUT));

        let streamed16 = INPUT.iter().fold(CRC_START_16, |c, &b| update_crc_16(c, b));
        assert_eq!(streamed16, crc_16(INPUT));

        let streamed64 = INPUT
            .iter()
            .fold(CRC_START_64_ECMA, |c, &b| update_crc_64_ecma(c, b));
        assert_eq!(streamed64, crc_64_ecma(INPUT));
    }

    #[test]
    fn update_crc_32_single_shot_matches_batch() {
        assert_eq!(update_crc_32(CRC_START_32, INPUT), crc_32(INPUT));
    }

    #[test]
    fn update_crc_32_applies_final_xor_every_call() {
        // The streaming form folds the final XOR into each call, so a
        // split computation does not equal the one-pass result. This
        // mirrors long-standing caller-visible behavior.
        let (a, b) = INPUT.split_at(10);
        let split = update_crc_32(update_crc_32(CRC_START_32, a), b);
        assert_ne!(split, crc_32(INPUT));
    }

    #[test]
    fn nmea_checksum_known_answer() {
        let sentence = b"$GPGLL,5300.97914,N,00259.98174,E,125926,A";
        assert_eq!(&checksum_nmea(sentence), b"28");
    }

    #[test]
    fn nmea_checksum_stops_at_star() {
        let with_trailer = b"$GPGLL,5300.97914,N,00259.98174,E,125926,A*FF\r\n";
        assert_eq!(&checksum_nmea(with_trailer), b"28");
    }
}
