// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Exception table encoding.
//!
//! Each entry is four varints: start, length, target and
//! `depth << 1 | lasti`, all offsets in code units. Varints are written most
//! significant group first, six bits per byte, with `0x40` marking that
//! another byte follows. The first byte of an entry also carries `0x80`.

use crate::error::{CompileError, Result};

const START_MARKER: u8 = 0x80;
const CONTINUATION: u8 = 0x40;
const MAX_VALUE: u32 = 1 << 30;

/// One decoded handler range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionTableEntry {
    /// First covered code unit
    pub start: u32,
    /// One past the last covered code unit
    pub end: u32,
    /// Handler offset
    pub target: u32,
    /// Stack depth the unwinder trims to before pushing
    pub depth: u32,
    /// Whether the offset of the raising instruction is pushed too
    pub lasti: bool,
}

fn write_item(out: &mut Vec<u8>, value: u32, mut msb: u8) -> Result<()> {
    if value >= MAX_VALUE {
        return Err(CompileError::overflow(format!(
            "exception table value {value} does not fit in 30 bits"
        )));
    }
    for shift in [24, 18, 12, 6] {
        if value >= 1 << shift {
            out.push(((value >> shift) & 0x3f) as u8 | CONTINUATION | msb);
            msb = 0;
        }
    }
    out.push((value & 0x3f) as u8 | msb);
    Ok(())
}

/// Appends one entry covering `start..end` to `out`.
pub fn write_entry(out: &mut Vec<u8>, entry: &ExceptionTableEntry) -> Result<()> {
    if entry.end <= entry.start {
        return Err(CompileError::internal(format!(
            "empty exception range {}..{}",
            entry.start, entry.end
        )));
    }
    let depth_lasti = entry
        .depth
        .checked_mul(2)
        .map(|d| d | u32::from(entry.lasti))
        .ok_or_else(|| CompileError::overflow("handler depth out of range"))?;
    write_item(out, entry.start, START_MARKER)?;
    write_item(out, entry.end - entry.start, 0)?;
    write_item(out, entry.target, 0)?;
    write_item(out, depth_lasti, 0)
}

fn read_item(table: &[u8], pos: &mut usize) -> Result<u32> {
    let mut next = || {
        let byte = table
            .get(*pos)
            .copied()
            .ok_or_else(|| CompileError::internal("truncated exception table"));
        *pos += 1;
        byte
    };
    let mut byte = next()?;
    let mut value = u32::from(byte & 0x3f);
    while byte & CONTINUATION != 0 {
        byte = next()?;
        value = (value << 6) | u32::from(byte & 0x3f);
    }
    Ok(value)
}

/// Decodes an exception table back into its entries.
pub fn decode_exception_table(table: &[u8]) -> Result<Vec<ExceptionTableEntry>> {
    let mut entries = Vec::new();
    let mut pos = 0;
    while pos < table.len() {
        if table[pos] & START_MARKER == 0 {
            return Err(CompileError::internal(format!(
                "exception entry at byte {pos} lacks its start marker"
            )));
        }
        let start = read_item(table, &mut pos)?;
        let length = read_item(table, &mut pos)?;
        let target = read_item(table, &mut pos)?;
        let depth_lasti = read_item(table, &mut pos)?;
        entries.push(ExceptionTableEntry {
            start,
            end: start + length,
            target,
            depth: depth_lasti >> 1,
            lasti: depth_lasti & 1 != 0,
        });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_entry_bytes() {
        let mut out = Vec::new();
        let entry = ExceptionTableEntry {
            start: 2,
            end: 6,
            target: 10,
            depth: 1,
            lasti: true,
        };
        write_entry(&mut out, &entry).unwrap();
        assert_eq!(out, vec![0x82, 4, 10, 3]);
        assert_eq!(decode_exception_table(&out).unwrap(), vec![entry]);
    }

    #[test]
    fn test_multi_byte_values() {
        let entries = vec![
            ExceptionTableEntry {
                start: 70,
                end: 5000,
                target: 300_000,
                depth: 0,
                lasti: false,
            },
            ExceptionTableEntry {
                start: 5000,
                end: 5001,
                target: 1 << 25,
                depth: 40,
                lasti: true,
            },
        ];
        let mut out = Vec::new();
        for entry in &entries {
            write_entry(&mut out, entry).unwrap();
        }
        // 70 needs two bytes: 0x80 | 0x40 | 1, then 6.
        assert_eq!(&out[..2], &[0xc1, 0x06]);
        assert_eq!(decode_exception_table(&out).unwrap(), entries);
    }

    #[test]
    fn test_out_of_range_value_overflows() {
        let mut out = Vec::new();
        let entry = ExceptionTableEntry {
            start: 0,
            end: 1,
            target: 1 << 30,
            depth: 0,
            lasti: false,
        };
        assert!(matches!(
            write_entry(&mut out, &entry),
            Err(CompileError::Overflow(_))
        ));
    }
}
