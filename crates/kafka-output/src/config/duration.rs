// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Go-style duration strings: `500ms`, `2s`, `1m30s`, `1.5h`.

use std::time::Duration;

const NANOS_PER_UNIT: [(&str, u128); 8] = [
    ("ns", 1),
    ("us", 1_000),
    ("µs", 1_000),
    ("μs", 1_000),
    ("ms", 1_000_000),
    ("s", 1_000_000_000),
    ("m", 60_000_000_000),
    ("h", 3_600_000_000_000),
];

/// Parses a duration made of one or more `<number><unit>` terms.
///
/// A bare `0` is accepted, any other number needs a unit. Negative durations
/// are rejected.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err("empty duration".to_string());
    }
    if trimmed.starts_with('-') {
        return Err(format!("negative duration '{trimmed}'"));
    }
    let text = trimmed.strip_prefix('+').unwrap_or(trimmed);
    if text == "0" {
        return Ok(Duration::ZERO);
    }

    let mut rest = text;
    let mut total: u128 = 0;
    while !rest.is_empty() {
        let int_len = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        let (int_part, after_int) = rest.split_at(int_len);
        let (frac_part, after_number) = match after_int.strip_prefix('.') {
            Some(fraction) => {
                let frac_len = fraction
                    .find(|c: char| !c.is_ascii_digit())
                    .unwrap_or(fraction.len());
                fraction.split_at(frac_len)
            }
            None => ("", after_int),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(format!("invalid duration '{trimmed}'"));
        }

        let unit_len = after_number
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(after_number.len());
        let (unit, remainder) = after_number.split_at(unit_len);
        if unit.is_empty() {
            return Err(format!("missing unit in duration '{trimmed}'"));
        }
        let Some((_, unit_nanos)) = NANOS_PER_UNIT.iter().find(|(name, _)| *name == unit) else {
            return Err(format!("unknown unit '{unit}' in duration '{trimmed}'"));
        };

        let overflow = || format!("duration '{trimmed}' is out of range");
        let whole: u128 = if int_part.is_empty() {
            0
        } else {
            int_part.parse().map_err(|_| overflow())?
        };
        total = whole
            .checked_mul(*unit_nanos)
            .and_then(|nanos| total.checked_add(nanos))
            .ok_or_else(overflow)?;

        if !frac_part.is_empty() {
            // Digits past nanosecond precision cannot change the result.
            let digits = &frac_part[..frac_part.len().min(18)];
            let numerator: u128 = digits.parse().map_err(|_| overflow())?;
            let scale = 10u128.pow(digits.len() as u32);
            total = total
                .checked_add(numerator * unit_nanos / scale)
                .ok_or_else(overflow)?;
        }

        rest = remainder;
    }

    let nanos = u64::try_from(total).map_err(|_| format!("duration '{trimmed}' is out of range"))?;
    Ok(Duration::from_nanos(nanos))
}
