// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Location table encoding.
//!
//! The table is a sequence of entries, each covering one to eight code
//! units. The first byte of an entry is `1 cccc lll`: bit 7 marks the start
//! of an entry, `cccc` selects the form and `lll` is the length minus one.
//!
//! | code  | form       | payload                                          |
//! |-------|------------|--------------------------------------------------|
//! | 0-9   | short      | one byte: low column bits, width; line unchanged |
//! | 10-12 | one line   | column, end column; line delta is `code - 10`    |
//! | 13    | no columns | signed varint line delta                         |
//! | 14    | long       | line delta, end-line delta, column + 1, end + 1  |
//! | 15    | none       | no location                                      |

use crate::ast::Location;
use crate::error::{CompileError, Result};

const SHORT0: u8 = 0;
const ONE_LINE0: u8 = 10;
const NO_COLUMNS: u8 = 13;
const LONG: u8 = 14;
const NONE: u8 = 15;

const MAX_ENTRY_UNITS: u32 = 8;

fn write_varint(out: &mut Vec<u8>, mut value: u32) {
    while value >= 64 {
        out.push(0x40 | (value & 0x3f) as u8);
        value >>= 6;
    }
    out.push(value as u8);
}

fn write_signed_varint(out: &mut Vec<u8>, value: i32) {
    let encoded = if value < 0 {
        (value.unsigned_abs() << 1) | 1
    } else {
        (value as u32) << 1
    };
    write_varint(out, encoded);
}

/// Incremental encoder; feed it runs of code units sharing a location.
#[derive(Debug)]
pub struct LineTableWriter {
    out: Vec<u8>,
    lineno: i32,
}

impl LineTableWriter {
    /// Starts a table whose line deltas are relative to `firstlineno`.
    pub fn new(firstlineno: i32) -> Self {
        Self {
            out: Vec::new(),
            lineno: firstlineno,
        }
    }

    fn first_byte(&mut self, code: u8, length: u32) {
        debug_assert!((1..=MAX_ENTRY_UNITS).contains(&length));
        self.out.push(0x80 | (code << 3) | (length - 1) as u8);
    }

    fn entry(&mut self, loc: Location, length: u32) -> Result<()> {
        if loc.line < 0 {
            self.first_byte(NONE, length);
            return Ok(());
        }
        let line_delta = loc.line - self.lineno;
        if loc.col < 0 && loc.end_col < 0 && loc.end_line == loc.line {
            self.first_byte(NO_COLUMNS, length);
            write_signed_varint(&mut self.out, line_delta);
            self.lineno = loc.line;
            return Ok(());
        }
        if loc.end_line == loc.line && loc.col >= 0 && loc.end_col >= loc.col {
            if line_delta == 0 && loc.col < 80 && loc.end_col - loc.col < 16 {
                let group = (loc.col >> 3) as u8;
                self.first_byte(SHORT0 + group, length);
                self.out
                    .push((((loc.col & 7) << 4) | (loc.end_col - loc.col)) as u8);
                return Ok(());
            }
            if (0..3).contains(&line_delta) && loc.col < 128 && loc.end_col < 128 {
                self.first_byte(ONE_LINE0 + line_delta as u8, length);
                self.out.push(loc.col as u8);
                self.out.push(loc.end_col as u8);
                self.lineno = loc.line;
                return Ok(());
            }
        }
        let end_delta = u32::try_from(loc.end_line - loc.line).map_err(|_| {
            CompileError::internal(format!(
                "location ends on line {} before it starts on line {}",
                loc.end_line, loc.line
            ))
        })?;
        self.first_byte(LONG, length);
        write_signed_varint(&mut self.out, line_delta);
        write_varint(&mut self.out, end_delta);
        write_varint(&mut self.out, (loc.col.max(-1) + 1) as u32);
        write_varint(&mut self.out, (loc.end_col.max(-1) + 1) as u32);
        self.lineno = loc.line;
        Ok(())
    }

    /// Records that the next `units` code units have location `loc`.
    ///
    /// A location whose end line precedes its start line cannot be encoded
    /// and is an internal error.
    pub fn push(&mut self, loc: Location, mut units: u32) -> Result<()> {
        while units > MAX_ENTRY_UNITS {
            self.entry(loc, MAX_ENTRY_UNITS)?;
            units -= MAX_ENTRY_UNITS;
        }
        if units > 0 {
            self.entry(loc, units)?;
        }
        Ok(())
    }

    /// The encoded table.
    pub fn finish(self) -> Vec<u8> {
        self.out
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn byte(&mut self) -> Result<u8> {
        let byte = self
            .bytes
            .get(self.pos)
            .copied()
            .ok_or_else(|| CompileError::internal("truncated location table"))?;
        self.pos += 1;
        Ok(byte)
    }

    fn varint(&mut self) -> Result<u32> {
        let mut byte = self.byte()?;
        let mut value = u32::from(byte & 0x3f);
        let mut shift = 0;
        while byte & 0x40 != 0 {
            byte = self.byte()?;
            shift += 6;
            value |= u32::from(byte & 0x3f) << shift;
        }
        Ok(value)
    }

    fn signed_varint(&mut self) -> Result<i32> {
        let value = self.varint()?;
        let magnitude = (value >> 1) as i32;
        Ok(if value & 1 != 0 { -magnitude } else { magnitude })
    }
}

/// Decodes a location table into one location per code unit.
pub fn decode_linetable(table: &[u8], firstlineno: i32) -> Result<Vec<Location>> {
    let mut reader = Reader {
        bytes: table,
        pos: 0,
    };
    let mut line = firstlineno;
    let mut out = Vec::new();
    while reader.pos < table.len() {
        let first = reader.byte()?;
        if first & 0x80 == 0 {
            return Err(CompileError::internal(format!(
                "location entry at byte {} lacks its start marker",
                reader.pos - 1
            )));
        }
        let code = (first >> 3) & 0x0f;
        let length = usize::from(first & 7) + 1;
        let loc = match code {
            NONE => Location::NONE,
            LONG => {
                line += reader.signed_varint()?;
                let end_line = line + reader.varint()? as i32;
                let col = reader.varint()? as i32 - 1;
                let end_col = reader.varint()? as i32 - 1;
                Location::new(line, col, end_line, end_col)
            }
            NO_COLUMNS => {
                line += reader.signed_varint()?;
                Location::line_only(line)
            }
            ONE_LINE0..=12 => {
                line += i32::from(code - ONE_LINE0);
                let col = i32::from(reader.byte()?);
                let end_col = i32::from(reader.byte()?);
                Location::new(line, col, line, end_col)
            }
            _ => {
                let second = i32::from(reader.byte()?);
                let col = i32::from(code) * 8 + (second >> 4);
                Location::new(line, col, line, col + (second & 0x0f))
            }
        };
        out.extend(std::iter::repeat_n(loc, length));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(firstlineno: i32, runs: &[(Location, u32)]) -> Vec<Location> {
        let mut writer = LineTableWriter::new(firstlineno);
        for (loc, units) in runs {
            writer.push(*loc, *units).unwrap();
        }
        decode_linetable(&writer.finish(), firstlineno).unwrap()
    }

    fn expand(runs: &[(Location, u32)]) -> Vec<Location> {
        runs.iter()
            .flat_map(|(loc, units)| std::iter::repeat_n(*loc, *units as usize))
            .collect()
    }

    #[test]
    fn test_short_form_is_two_bytes() {
        let mut writer = LineTableWriter::new(3);
        writer.push(Location::new(3, 4, 3, 9), 1).unwrap();
        let table = writer.finish();
        assert_eq!(table, vec![0x80, (4 << 4) | 5]);
    }

    #[test]
    fn test_none_entry() {
        let mut writer = LineTableWriter::new(1);
        writer.push(Location::NONE, 2).unwrap();
        assert_eq!(writer.finish(), vec![0x80 | (15 << 3) | 1]);
    }

    #[test]
    fn test_every_form_round_trips() {
        let runs = vec![
            (Location::new(1, 0, 1, 5), 1),
            (Location::new(2, 4, 2, 100), 2),
            (Location::line_only(9), 1),
            (Location::NONE, 1),
            (Location::new(4, 200, 6, 3), 3),
            (Location::line_only(1), 1),
            (Location::new(1, -1, 3, -1), 1),
        ];
        assert_eq!(round_trip(1, &runs), expand(&runs));
    }

    #[test]
    fn test_long_runs_split_into_entries_of_eight() {
        let runs = vec![(Location::new(5, 0, 5, 1), 19)];
        let mut writer = LineTableWriter::new(5);
        writer.push(runs[0].0, runs[0].1).unwrap();
        let table = writer.finish();
        assert_eq!(table.len(), 6);
        assert_eq!(round_trip(5, &runs), expand(&runs));
    }

    #[test]
    fn test_negative_line_delta() {
        let runs = vec![(Location::line_only(40), 1), (Location::line_only(2), 1)];
        assert_eq!(round_trip(10, &runs), expand(&runs));
    }

    #[test]
    fn test_end_line_before_line_is_rejected() {
        let mut writer = LineTableWriter::new(1);
        let err = writer.push(Location::new(5, 0, 3, 4), 1).unwrap_err();
        assert!(matches!(err, CompileError::Internal(_)));
    }

    #[test]
    fn test_multi_line_span_keeps_its_end_line() {
        let runs = vec![
            (Location::new(2, 4, 5, 1), 2),
            (Location::new(7, 0, 7, 3), 1),
        ];
        let decoded = round_trip(2, &runs);
        assert_eq!(decoded[0].end_line, 5);
        assert_eq!(decoded, expand(&runs));
    }
}
