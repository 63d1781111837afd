//! Daily sending window

use chrono::{DateTime, Duration, Timelike, Utc};
use outpost_common::config::SendWindow;

/// Whether `hour` (UTC) falls inside `[start_hour, end_hour)`.
/// A window with equal bounds is always open.
pub fn is_open(window: &SendWindow, hour: u32) -> bool {
    let (start, end) = (window.start_hour, window.end_hour);
    if start == end {
        true
    } else if start < end {
        hour >= start && hour < end
    } else {
        hour >= start || hour < end
    }
}

/// Earliest instant at or after `at` inside the window
pub fn next_open(window: &SendWindow, at: DateTime<Utc>) -> DateTime<Utc> {
    if is_open(window, at.hour()) {
        return at;
    }

    let start_today = match at.date_naive().and_hms_opt(window.start_hour, 0, 0) {
        Some(naive) => naive.and_utc(),
        None => return at,
    };

    if start_today > at {
        start_today
    } else {
        start_today + Duration::days(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn at(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, day, hour, minute, 0).unwrap()
    }

    #[test]
    fn test_daytime_window() {
        let window = SendWindow {
            start_hour: 9,
            end_hour: 17,
        };
        assert!(!is_open(&window, 8));
        assert!(is_open(&window, 9));
        assert!(is_open(&window, 16));
        assert!(!is_open(&window, 17));

        assert_eq!(next_open(&window, at(5, 12, 30)), at(5, 12, 30));
        assert_eq!(next_open(&window, at(5, 6, 15)), at(5, 9, 0));
        assert_eq!(next_open(&window, at(5, 18, 0)), at(6, 9, 0));
    }

    #[test]
    fn test_window_wrapping_midnight() {
        let window = SendWindow {
            start_hour: 22,
            end_hour: 6,
        };
        assert!(is_open(&window, 23));
        assert!(is_open(&window, 0));
        assert!(is_open(&window, 5));
        assert!(!is_open(&window, 6));
        assert!(!is_open(&window, 21));

        assert_eq!(next_open(&window, at(5, 2, 0)), at(5, 2, 0));
        assert_eq!(next_open(&window, at(5, 12, 0)), at(5, 22, 0));
    }

    #[test]
    fn test_equal_bounds_always_open() {
        let window = SendWindow {
            start_hour: 8,
            end_hour: 8,
        };
        assert_eq!(next_open(&window, at(5, 3, 0)), at(5, 3, 0));
    }
}
