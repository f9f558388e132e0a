// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Column types and the uniform `{is_null, payload}` value representation
//! produced by expression evaluation.

use std::cmp::Ordering;
use std::fmt;

use crate::error::Result;
use crate::internal_err;

/// Width of the fixed slot used for variable-length columns: an 8-byte
/// offset plus an 8-byte length.
pub const VAR_LEN_SLOT_WIDTH: usize = 16;

/// The data types the aggregation and join operators understand.
///
/// Decimal payloads are fixed-scale integers whose byte size is derived from
/// the precision (4, 8 or 16 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    Utf8,
    Binary,
    Decimal { precision: u8, scale: u8 },
}

impl ColumnType {
    /// The number of bytes a decimal of the given precision occupies.
    pub fn decimal_byte_size(precision: u8) -> usize {
        if precision <= 9 {
            4
        } else if precision <= 18 {
            8
        } else {
            16
        }
    }

    /// Byte width of this type's slot in a fixed row layout. Variable-length
    /// types store an offset + length pair.
    pub fn fixed_width(&self) -> usize {
        match self {
            ColumnType::Bool | ColumnType::Int8 => 1,
            ColumnType::Int16 => 2,
            ColumnType::Int32 | ColumnType::Float32 => 4,
            ColumnType::Int64 | ColumnType::Float64 => 8,
            ColumnType::Utf8 | ColumnType::Binary => VAR_LEN_SLOT_WIDTH,
            ColumnType::Decimal { precision, .. } => {
                Self::decimal_byte_size(*precision)
            }
        }
    }

    /// True for types whose payload lives out of line.
    pub fn is_var_len(&self) -> bool {
        matches!(self, ColumnType::Utf8 | ColumnType::Binary)
    }

    /// True for types that have ordered numeric min/max sentinels.
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            ColumnType::Int8
                | ColumnType::Int16
                | ColumnType::Int32
                | ColumnType::Int64
                | ColumnType::Float32
                | ColumnType::Float64
                | ColumnType::Decimal { .. }
        )
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ColumnType::Decimal { precision, scale } => {
                write!(f, "Decimal({precision},{scale})")
            }
            other => write!(f, "{other:?}"),
        }
    }
}

/// An evaluated value: the `Null` variant is the null indicator, every other
/// variant carries the typed payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Datum {
    Null,
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Utf8(String),
    Binary(Vec<u8>),
    /// Fixed-scale integer; precision and scale are carried by the schema.
    Decimal(i128),
}

impl Datum {
    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    /// Writes this value's little-endian image into `out`, which must be
    /// exactly `ty.fixed_width()` bytes. Only valid for non-null values of
    /// fixed-width types.
    pub fn encode_fixed(&self, ty: &ColumnType, out: &mut [u8]) -> Result<()> {
        debug_assert_eq!(out.len(), ty.fixed_width());
        match (self, ty) {
            (Datum::Bool(v), ColumnType::Bool) => out[0] = *v as u8,
            (Datum::Int8(v), ColumnType::Int8) => out.copy_from_slice(&v.to_le_bytes()),
            (Datum::Int16(v), ColumnType::Int16) => {
                out.copy_from_slice(&v.to_le_bytes())
            }
            (Datum::Int32(v), ColumnType::Int32) => {
                out.copy_from_slice(&v.to_le_bytes())
            }
            (Datum::Int64(v), ColumnType::Int64) => {
                out.copy_from_slice(&v.to_le_bytes())
            }
            (Datum::Float32(v), ColumnType::Float32) => {
                out.copy_from_slice(&v.to_le_bytes())
            }
            (Datum::Float64(v), ColumnType::Float64) => {
                out.copy_from_slice(&v.to_le_bytes())
            }
            (Datum::Decimal(v), ColumnType::Decimal { .. }) => {
                out.copy_from_slice(&v.to_le_bytes()[..out.len()])
            }
            (value, ty) => {
                return internal_err!("cannot encode {value:?} as fixed {ty}")
            }
        }
        Ok(())
    }

    /// Reconstructs a value from the little-endian image produced by
    /// [`Datum::encode_fixed`].
    pub fn decode_fixed(ty: &ColumnType, bytes: &[u8]) -> Result<Datum> {
        debug_assert_eq!(bytes.len(), ty.fixed_width());
        Ok(match ty {
            ColumnType::Bool => Datum::Bool(bytes[0] != 0),
            ColumnType::Int8 => Datum::Int8(i8::from_le_bytes([bytes[0]])),
            ColumnType::Int16 => {
                Datum::Int16(i16::from_le_bytes(bytes.try_into().unwrap()))
            }
            ColumnType::Int32 => {
                Datum::Int32(i32::from_le_bytes(bytes.try_into().unwrap()))
            }
            ColumnType::Int64 => {
                Datum::Int64(i64::from_le_bytes(bytes.try_into().unwrap()))
            }
            ColumnType::Float32 => {
                Datum::Float32(f32::from_le_bytes(bytes.try_into().unwrap()))
            }
            ColumnType::Float64 => {
                Datum::Float64(f64::from_le_bytes(bytes.try_into().unwrap()))
            }
            ColumnType::Decimal { .. } => {
                // Sign-extend from the stored width to 16 bytes.
                let mut wide = if bytes[bytes.len() - 1] & 0x80 != 0 {
                    [0xffu8; 16]
                } else {
                    [0u8; 16]
                };
                wide[..bytes.len()].copy_from_slice(bytes);
                Datum::Decimal(i128::from_le_bytes(wide))
            }
            ColumnType::Utf8 | ColumnType::Binary => {
                return internal_err!("decode_fixed called on var-len type {ty}")
            }
        })
    }

    /// Total order over two values of the same type. Nulls sort first;
    /// floats use IEEE total order so NaNs compare consistently.
    pub fn total_cmp(&self, other: &Datum) -> Ordering {
        match (self, other) {
            (Datum::Null, Datum::Null) => Ordering::Equal,
            (Datum::Null, _) => Ordering::Less,
            (_, Datum::Null) => Ordering::Greater,
            (Datum::Bool(a), Datum::Bool(b)) => a.cmp(b),
            (Datum::Int8(a), Datum::Int8(b)) => a.cmp(b),
            (Datum::Int16(a), Datum::Int16(b)) => a.cmp(b),
            (Datum::Int32(a), Datum::Int32(b)) => a.cmp(b),
            (Datum::Int64(a), Datum::Int64(b)) => a.cmp(b),
            (Datum::Float32(a), Datum::Float32(b)) => a.total_cmp(b),
            (Datum::Float64(a), Datum::Float64(b)) => a.total_cmp(b),
            (Datum::Utf8(a), Datum::Utf8(b)) => a.cmp(b),
            (Datum::Binary(a), Datum::Binary(b)) => a.cmp(b),
            (Datum::Decimal(a), Datum::Decimal(b)) => a.cmp(b),
            (a, b) => {
                debug_assert!(false, "comparing mismatched datums {a:?} / {b:?}");
                Ordering::Equal
            }
        }
    }

    /// The largest representable value of a numeric type. Used to seed MIN
    /// accumulators so the hot update path needs no null check.
    pub fn max_sentinel(ty: &ColumnType) -> Option<Datum> {
        Some(match ty {
            ColumnType::Int8 => Datum::Int8(i8::MAX),
            ColumnType::Int16 => Datum::Int16(i16::MAX),
            ColumnType::Int32 => Datum::Int32(i32::MAX),
            ColumnType::Int64 => Datum::Int64(i64::MAX),
            ColumnType::Float32 => Datum::Float32(f32::INFINITY),
            ColumnType::Float64 => Datum::Float64(f64::INFINITY),
            ColumnType::Decimal { .. } => Datum::Decimal(i128::MAX),
            _ => return None,
        })
    }

    /// The smallest representable value of a numeric type, seeding MAX
    /// accumulators.
    pub fn min_sentinel(ty: &ColumnType) -> Option<Datum> {
        Some(match ty {
            ColumnType::Int8 => Datum::Int8(i8::MIN),
            ColumnType::Int16 => Datum::Int16(i16::MIN),
            ColumnType::Int32 => Datum::Int32(i32::MIN),
            ColumnType::Int64 => Datum::Int64(i64::MIN),
            ColumnType::Float32 => Datum::Float32(f32::NEG_INFINITY),
            ColumnType::Float64 => Datum::Float64(f64::NEG_INFINITY),
            ColumnType::Decimal { .. } => Datum::Decimal(i128::MIN),
            _ => return None,
        })
    }

    /// Var-len payload bytes, for Utf8 / Binary values.
    pub fn var_len_bytes(&self) -> Option<&[u8]> {
        match self {
            Datum::Utf8(s) => Some(s.as_bytes()),
            Datum::Binary(b) => Some(b),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_widths() {
        assert_eq!(ColumnType::Bool.fixed_width(), 1);
        assert_eq!(ColumnType::Int64.fixed_width(), 8);
        assert_eq!(ColumnType::Utf8.fixed_width(), VAR_LEN_SLOT_WIDTH);
        assert_eq!(
            ColumnType::Decimal {
                precision: 9,
                scale: 2
            }
            .fixed_width(),
            4
        );
        assert_eq!(
            ColumnType::Decimal {
                precision: 19,
                scale: 2
            }
            .fixed_width(),
            16
        );
    }

    #[test]
    fn fixed_image_round_trip() {
        let cases = [
            (Datum::Int32(-7), ColumnType::Int32),
            (Datum::Int64(1 << 40), ColumnType::Int64),
            (Datum::Float64(-0.5), ColumnType::Float64),
            (Datum::Bool(true), ColumnType::Bool),
            (
                Datum::Decimal(-123456),
                ColumnType::Decimal {
                    precision: 18,
                    scale: 4,
                },
            ),
        ];
        for (value, ty) in cases {
            let mut buf = vec![0u8; ty.fixed_width()];
            value.encode_fixed(&ty, &mut buf).unwrap();
            assert_eq!(Datum::decode_fixed(&ty, &buf).unwrap(), value);
        }
    }

    #[test]
    fn decimal_sign_extension() {
        let ty = ColumnType::Decimal {
            precision: 9,
            scale: 0,
        };
        let mut buf = vec![0u8; 4];
        Datum::Decimal(-1).encode_fixed(&ty, &mut buf).unwrap();
        assert_eq!(Datum::decode_fixed(&ty, &buf).unwrap(), Datum::Decimal(-1));
    }

    #[test]
    fn nulls_sort_first() {
        assert_eq!(Datum::Null.total_cmp(&Datum::Int32(0)), Ordering::Less);
        assert_eq!(
            Datum::Float64(f64::NAN).total_cmp(&Datum::Float64(f64::NAN)),
            Ordering::Equal
        );
    }
}
