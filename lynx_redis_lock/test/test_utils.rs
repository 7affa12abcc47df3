/// Asserts that the given [`chrono::Duration`] falls within the given range.
#[macro_export]
macro_rules! assert_td_in_range {
    ($td:expr, $range:expr) => {
        assert!(
            $td >= $range.start && $td <= $range.end,
            "Expected '{:?}' to be in range '{:?}' - '{:?}'.",
            $td,
            $range.start,
            $range.end,
        );
    };
}

// Re-export:
pub use crate::assert_td_in_range;
