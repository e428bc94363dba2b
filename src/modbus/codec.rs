//! Value decode/encode and calibration for Modbus registers (spec
//! section 4.6, section 1 "the Modbus wire codecs ... are a library the
//! polling component uses" — frame parsing/CRC live in `tokio-modbus`;
//! this module is the calibration/type layer this port owns).

use crate::config::{DataType, Endianness};

/// Reassemble a multi-register raw payload into a u64 according to the
/// configured endianness variant (spec section 3: BE, LE, BE byte-swap,
/// LE word-swap).
fn words_to_u64(words: &[u16], endian: Endianness) -> u64 {
    match (words.len(), endian) {
        (1, _) => words[0] as u64,
        (2, Endianness::Be) => ((words[0] as u64) << 16) | (words[1] as u64),
        (2, Endianness::Le) => ((words[1] as u64) << 16) | (words[0] as u64),
        (2, Endianness::BeByteSwap) => (((words[0].swap_bytes()) as u64) << 16) | (words[1].swap_bytes() as u64),
        (2, Endianness::LeWordSwap) => ((words[1] as u64) << 16) | (words[0] as u64),
        (4, Endianness::Be) => words.iter().fold(0u64, |acc, &w| (acc << 16) | w as u64),
        (4, Endianness::Le) => words.iter().rev().fold(0u64, |acc, &w| (acc << 16) | w as u64),
        (4, Endianness::BeByteSwap) => words.iter().fold(0u64, |acc, &w| (acc << 16) | w.swap_bytes() as u64),
        (4, Endianness::LeWordSwap) => {
            // word-swapped pairs: swap each adjacent pair of 16-bit words, then big-endian assemble
            let mut swapped = words.to_vec();
            swapped.swap(0, 1);
            if swapped.len() == 4 {
                swapped.swap(2, 3);
            }
            swapped.iter().fold(0u64, |acc, &w| (acc << 16) | w as u64)
        }
        _ => 0,
    }
}

/// Decode a raw register payload into its calibrated-ready f64, per the
/// data-type discriminator (spec section 3).
pub fn decode_raw(raw: &[u16], data_type: &DataType) -> f64 {
    match data_type {
        DataType::U16 => raw.first().copied().unwrap_or(0) as f64,
        DataType::I16 => raw.first().copied().unwrap_or(0) as i16 as f64,
        DataType::Bool => {
            if raw.first().copied().unwrap_or(0) != 0 {
                1.0
            } else {
                0.0
            }
        }
        DataType::U32 { endian } => words_to_u64(&raw[..raw.len().min(2)], *endian) as u32 as f64,
        DataType::I32 { endian } => words_to_u64(&raw[..raw.len().min(2)], *endian) as u32 as i32 as f64,
        DataType::U64 { endian } => words_to_u64(&raw[..raw.len().min(4)], *endian) as f64,
        DataType::I64 { endian } => words_to_u64(&raw[..raw.len().min(4)], *endian) as i64 as f64,
        DataType::F32 { endian } => f32::from_bits(words_to_u64(&raw[..raw.len().min(2)], *endian) as u32) as f64,
        DataType::F64 { endian } => f64::from_bits(words_to_u64(&raw[..raw.len().min(4)], *endian)),
    }
}

/// `value = (raw * scale) + offset`, optionally rounded to `decimals`
/// (spec section 4.6). `decimals == -1` means "auto" — no rounding.
pub fn apply_calibration(raw_value: f64, scale: f64, offset: f64, decimals: i8) -> f64 {
    let value = raw_value * scale + offset;
    if decimals < 0 {
        value
    } else {
        let factor = 10f64.powi(decimals as i32);
        (value * factor).round() / factor
    }
}

/// Inverse of calibration for the BLE write path (spec section 4.6):
/// `raw = (value - offset) / scale`, then split into 16-bit words per
/// data type and endianness.
pub fn encode_write(value: f64, scale: f64, offset: f64, data_type: &DataType) -> Vec<u16> {
    let raw = (value - offset) / scale;
    match data_type {
        DataType::U16 | DataType::Bool => vec![raw.round() as i64 as u16],
        DataType::I16 => vec![(raw.round() as i64 as i16) as u16],
        DataType::U32 { endian } => split_words(raw.round() as i64 as u32 as u64, 2, *endian),
        DataType::I32 { endian } => split_words((raw.round() as i64 as i32) as u32 as u64, 2, *endian),
        DataType::U64 { endian } => split_words(raw.round() as i64 as u64, 4, *endian),
        DataType::I64 { endian } => split_words((raw.round() as i64) as u64, 4, *endian),
        DataType::F32 { endian } => split_words((raw as f32).to_bits() as u64, 2, *endian),
        DataType::F64 { endian } => split_words(raw.to_bits(), 4, *endian),
    }
}

fn split_words(value: u64, word_count: usize, endian: Endianness) -> Vec<u16> {
    let mut be_words: Vec<u16> = (0..word_count).rev().map(|i| ((value >> (i * 16)) & 0xffff) as u16).collect();

    match endian {
        Endianness::Be => be_words,
        Endianness::Le => {
            be_words.reverse();
            be_words
        }
        Endianness::BeByteSwap => {
            for w in be_words.iter_mut() {
                *w = w.swap_bytes();
            }
            be_words
        }
        Endianness::LeWordSwap => {
            if be_words.len() == 2 {
                be_words.swap(0, 1);
            } else if be_words.len() == 4 {
                be_words.swap(0, 1);
                be_words.swap(2, 3);
            }
            be_words
        }
    }
}
