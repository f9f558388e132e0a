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

//! Fixed-scale decimal helpers.
//!
//! Decimals are `i128` payloads at a declared scale. Rescaling between
//! scales and the rounding-delta computation used when dropping fractional
//! digits live here; overflow is reported to the caller (the aggregate
//! evaluators record it as a warning and produce NULL).

/// Maximum supported decimal precision.
pub const MAX_PRECISION: u8 = 38;

/// `10^scale`. Panics if `scale` exceeds the representable range (37 digits
/// beyond which `i128` multiplication overflows for any payload).
pub fn scale_multiplier(scale: u32) -> i128 {
    debug_assert!(scale < 39);
    10i128.pow(scale)
}

/// Rounding applied when a decimal loses fractional digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundMode {
    Truncate,
    Floor,
    Ceil,
    /// Round half away from zero, with the tie decided by a strict
    /// comparison (see [`round_delta`]).
    Round,
}

/// The -1/0/+1 adjustment to add to a value truncated from `src_scale` to
/// `target_scale`.
///
/// An exact .5 tie does NOT round away from zero: the comparison against
/// half of the trailing base is strictly less-than, so the delta for an
/// exact tie is 0. `round_half_exact_tie_stays` pins this down.
pub fn round_delta(value: i128, src_scale: i32, target_scale: i32, mode: RoundMode) -> i128 {
    if mode == RoundMode::Truncate {
        return 0;
    }
    // Adding digits: the new digits are just zero.
    if src_scale <= target_scale {
        return 0;
    }
    if value > 0 && mode == RoundMode::Floor {
        return 0;
    }
    if value < 0 && mode == RoundMode::Ceil {
        return 0;
    }

    let delta_scale = (src_scale - target_scale) as u32;
    let trailing_base = scale_multiplier(delta_scale);
    let trailing_digits = value % trailing_base;
    if trailing_digits == 0 {
        return 0;
    }

    match mode {
        RoundMode::Ceil => 1,
        RoundMode::Floor => -1,
        RoundMode::Round => {
            if trailing_digits.abs() < trailing_base / 2 {
                0
            } else if value < 0 {
                -1
            } else {
                1
            }
        }
        RoundMode::Truncate => unreachable!(),
    }
}

/// Rescales `value` from `src_scale` to `dst_scale`, rounding half away
/// from zero when digits are dropped. Returns `None` on overflow of either
/// the multiplication or the `dst_precision` digit budget.
pub fn scale_to(
    value: i128,
    src_scale: i32,
    dst_scale: i32,
    dst_precision: u8,
) -> Option<i128> {
    let result = if dst_scale >= src_scale {
        let mult = scale_multiplier((dst_scale - src_scale) as u32);
        value.checked_mul(mult)?
    } else {
        let delta = round_delta(value, src_scale, dst_scale, RoundMode::Round);
        let div = scale_multiplier((src_scale - dst_scale) as u32);
        value / div + delta
    };
    let bound = scale_multiplier(dst_precision.min(MAX_PRECISION) as u32);
    if result.abs() >= bound {
        return None;
    }
    Some(result)
}
