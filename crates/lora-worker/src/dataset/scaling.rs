//! Repeat factor for normalizing dataset size.

use serde::{Deserialize, Serialize};

/// How `target / count` ties are rounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundingMode {
    /// Ties go to the even neighbour (banker's rounding).
    #[default]
    HalfEven,
    /// Ties go up.
    HalfUp,
}

/// `max(1, round(target / count))`, computed exactly in integers.
///
/// A zero `count` yields 1; callers validate the count before scaling.
pub fn repeat_factor(target: u32, count: usize, rounding: RoundingMode) -> u32 {
    if count == 0 {
        return 1;
    }
    let target = u64::from(target);
    let count = count as u64;
    let quotient = target / count;
    let twice_remainder = 2 * (target % count);

    let rounded = if twice_remainder > count {
        quotient + 1
    } else if twice_remainder < count {
        quotient
    } else {
        match rounding {
            RoundingMode::HalfUp => quotient + 1,
            RoundingMode::HalfEven if quotient % 2 == 0 => quotient,
            RoundingMode::HalfEven => quotient + 1,
        }
    };

    u32::try_from(rounded).unwrap_or(u32::MAX).max(1)
}

/// Images the trainer will see per epoch.
pub fn effective_samples(count: usize, repeat: u32) -> u64 {
    count as u64 * u64::from(repeat)
}
