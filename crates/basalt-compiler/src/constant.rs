// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Compile-time constant values.
//!
//! Equality here is *key* equality: `1`, `1.0` and `True` are distinct, as are
//! `0.0` and `-0.0`, so that a constant table never conflates values the
//! runtime can tell apart.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use num_bigint::BigInt;
use num_traits::Zero;
use rustc_hash::FxHashMap;

use crate::compiler::code::CodeObject;

/// A constant that can live in a code object's constant table.
#[derive(Debug, Clone)]
pub enum Constant {
    /// `None`
    None,
    /// `...`
    Ellipsis,
    /// `True` / `False`
    Bool(bool),
    /// Arbitrary-precision integer
    Int(BigInt),
    /// Float
    Float(f64),
    /// Complex number
    Complex {
        /// Real part
        real: f64,
        /// Imaginary part
        imag: f64,
    },
    /// String
    Str(Arc<str>),
    /// Bytes
    Bytes(Arc<[u8]>),
    /// Tuple of constants
    Tuple(Arc<[Constant]>),
    /// A nested code object
    Code(Arc<CodeObject>),
}

impl Constant {
    /// Python truthiness of the value.
    pub fn is_truthy(&self) -> bool {
        match self {
            Constant::None => false,
            Constant::Ellipsis | Constant::Code(_) => true,
            Constant::Bool(b) => *b,
            Constant::Int(i) => !i.is_zero(),
            Constant::Float(f) => *f != 0.0,
            Constant::Complex { real, imag } => *real != 0.0 || *imag != 0.0,
            Constant::Str(s) => !s.is_empty(),
            Constant::Bytes(b) => !b.is_empty(),
            Constant::Tuple(items) => !items.is_empty(),
        }
    }

    /// Whether this is `None`.
    pub fn is_none(&self) -> bool {
        matches!(self, Constant::None)
    }

    /// A string constant.
    pub fn str(value: &str) -> Self {
        Constant::Str(Arc::from(value))
    }

    /// A tuple constant.
    pub fn tuple(items: Vec<Constant>) -> Self {
        Constant::Tuple(Arc::from(items))
    }

    /// The type name used in diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Constant::None => "NoneType",
            Constant::Ellipsis => "ellipsis",
            Constant::Bool(_) => "bool",
            Constant::Int(_) => "int",
            Constant::Float(_) => "float",
            Constant::Complex { .. } => "complex",
            Constant::Str(_) => "str",
            Constant::Bytes(_) => "bytes",
            Constant::Tuple(_) => "tuple",
            Constant::Code(_) => "code",
        }
    }

    fn discriminant(&self) -> u8 {
        match self {
            Constant::None => 0,
            Constant::Ellipsis => 1,
            Constant::Bool(_) => 2,
            Constant::Int(_) => 3,
            Constant::Float(_) => 4,
            Constant::Complex { .. } => 5,
            Constant::Str(_) => 6,
            Constant::Bytes(_) => 7,
            Constant::Tuple(_) => 8,
            Constant::Code(_) => 9,
        }
    }
}

impl PartialEq for Constant {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Constant::None, Constant::None) | (Constant::Ellipsis, Constant::Ellipsis) => true,
            (Constant::Bool(a), Constant::Bool(b)) => a == b,
            (Constant::Int(a), Constant::Int(b)) => a == b,
            (Constant::Float(a), Constant::Float(b)) => a.to_bits() == b.to_bits(),
            (
                Constant::Complex { real: r1, imag: i1 },
                Constant::Complex { real: r2, imag: i2 },
            ) => r1.to_bits() == r2.to_bits() && i1.to_bits() == i2.to_bits(),
            (Constant::Str(a), Constant::Str(b)) => a == b,
            (Constant::Bytes(a), Constant::Bytes(b)) => a == b,
            (Constant::Tuple(a), Constant::Tuple(b)) => a == b,
            (Constant::Code(a), Constant::Code(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Eq for Constant {}

impl Hash for Constant {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.discriminant().hash(state);
        match self {
            Constant::None | Constant::Ellipsis => {}
            Constant::Bool(b) => b.hash(state),
            Constant::Int(i) => i.hash(state),
            Constant::Float(f) => f.to_bits().hash(state),
            Constant::Complex { real, imag } => {
                real.to_bits().hash(state);
                imag.to_bits().hash(state);
            }
            Constant::Str(s) => s.hash(state),
            Constant::Bytes(b) => b.hash(state),
            Constant::Tuple(items) => items.hash(state),
            Constant::Code(code) => (Arc::as_ptr(code) as usize).hash(state),
        }
    }
}

impl From<bool> for Constant {
    fn from(value: bool) -> Self {
        Constant::Bool(value)
    }
}

impl From<i64> for Constant {
    fn from(value: i64) -> Self {
        Constant::Int(BigInt::from(value))
    }
}

impl From<f64> for Constant {
    fn from(value: f64) -> Self {
        Constant::Float(value)
    }
}

impl From<&str> for Constant {
    fn from(value: &str) -> Self {
        Constant::str(value)
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::None => f.write_str("None"),
            Constant::Ellipsis => f.write_str("Ellipsis"),
            Constant::Bool(true) => f.write_str("True"),
            Constant::Bool(false) => f.write_str("False"),
            Constant::Int(i) => write!(f, "{i}"),
            Constant::Float(x) => write!(f, "{x:?}"),
            Constant::Complex { real, imag } => {
                if *real == 0.0 && real.is_sign_positive() {
                    write!(f, "{imag:?}j")
                } else {
                    let sign = if imag.is_sign_negative() { "" } else { "+" };
                    write!(f, "({real:?}{sign}{imag:?}j)")
                }
            }
            Constant::Str(s) => write!(f, "{:?}", s.as_ref()),
            Constant::Bytes(b) => {
                f.write_str("b'")?;
                for byte in b.iter() {
                    match byte {
                        b'\'' => f.write_str("\\'")?,
                        b'\\' => f.write_str("\\\\")?,
                        0x20..=0x7e => write!(f, "{}", *byte as char)?,
                        _ => write!(f, "\\x{byte:02x}")?,
                    }
                }
                f.write_str("'")
            }
            Constant::Tuple(items) => {
                f.write_str("(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                if items.len() == 1 {
                    f.write_str(",")?;
                }
                f.write_str(")")
            }
            Constant::Code(code) => write!(f, "<code object {}>", code.name),
        }
    }
}

/// Canonicalizing store shared by every unit of one compilation.
///
/// Equal constants (by key) resolve to one shared value; tuples are merged
/// element-wise first so nested aggregates share their parts too.
#[derive(Debug, Default)]
pub struct ConstCache {
    map: FxHashMap<Constant, Constant>,
}

impl ConstCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the canonical instance of `value`.
    pub fn merge(&mut self, value: Constant) -> Constant {
        let value = match value {
            Constant::Tuple(items) => {
                let merged: Vec<Constant> = items.iter().map(|c| self.merge(c.clone())).collect();
                Constant::Tuple(Arc::from(merged))
            }
            other => other,
        };
        self.map.entry(value.clone()).or_insert(value).clone()
    }

    /// Number of distinct constants seen.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether nothing has been merged yet.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
