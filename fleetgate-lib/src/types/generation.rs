use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter};

/// Hardware/firmware tier of a device.
///
/// The tier selects the concurrency ceiling, pacing interval and circuit
/// threshold a device is throttled with. Raw generation numbers are clamped
/// into the known range: anything below 1 is treated as [`Generation::Gen1`]
/// (the more conservative tier) and anything above 2 as [`Generation::Gen2`].
///
/// ```
/// use fleetgate_lib::Generation;
///
/// assert_eq!(Generation::from(0), Generation::Gen1);
/// assert_eq!(Generation::from(2), Generation::Gen2);
/// assert_eq!(Generation::from(7), Generation::Gen2);
/// ```
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Display,
    EnumIter,
    Serialize,
    Deserialize,
)]
#[serde(from = "i64", into = "u8")]
pub enum Generation {
    /// First generation devices: slow, single request at a time
    #[default]
    #[strum(serialize = "gen1")]
    Gen1,
    /// Second generation devices
    #[strum(serialize = "gen2")]
    Gen2,
}

impl Generation {
    /// The tier as a plain number (1 or 2)
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Gen1 => 1,
            Self::Gen2 => 2,
        }
    }
}

impl From<i64> for Generation {
    fn from(value: i64) -> Self {
        if value >= 2 { Self::Gen2 } else { Self::Gen1 }
    }
}

impl From<i32> for Generation {
    fn from(value: i32) -> Self {
        Self::from(i64::from(value))
    }
}

impl From<u8> for Generation {
    fn from(value: u8) -> Self {
        Self::from(i64::from(value))
    }
}

impl From<Generation> for u8 {
    fn from(generation: Generation) -> Self {
        generation.as_u8()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use strum::IntoEnumIterator;

    #[rstest]
    #[case(i64::MIN, Generation::Gen1)]
    #[case(-1, Generation::Gen1)]
    #[case(0, Generation::Gen1)]
    #[case(1, Generation::Gen1)]
    #[case(2, Generation::Gen2)]
    #[case(3, Generation::Gen2)]
    #[case(i64::MAX, Generation::Gen2)]
    fn test_generation_clamping(#[case] raw: i64, #[case] expected: Generation) {
        assert_eq!(Generation::from(raw), expected);
    }

    #[test]
    fn test_generation_display() {
        let names: Vec<String> = Generation::iter().map(|g| g.to_string()).collect();
        assert_eq!(names, vec!["gen1", "gen2"]);
    }

    #[test]
    fn test_generation_serde_roundtrip_clamps() {
        let generation: Generation = serde_json::from_str("5").unwrap();
        assert_eq!(generation, Generation::Gen2);
        assert_eq!(serde_json::to_string(&Generation::Gen1).unwrap(), "1");
    }
}
