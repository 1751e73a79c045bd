//! Timecode formatting helpers.

/// Format seconds as `HH:MM:SS` (or `HH:MM:SS.mmm` when a fractional part
/// is present). Rounds to whole milliseconds before decomposing so values
/// just under a field boundary carry into the next field.
pub fn format_timecode(total_secs: f64) -> String {
    let total_ms = (total_secs.max(0.0) * 1000.0).round() as u64;
    let hours = total_ms / 3_600_000;
    let mins = (total_ms % 3_600_000) / 60_000;
    let secs = (total_ms % 60_000) / 1000;
    let millis = total_ms % 1000;

    if millis > 0 {
        format!("{:02}:{:02}:{:02}.{:03}", hours, mins, secs, millis)
    } else {
        format!("{:02}:{:02}:{:02}", hours, mins, secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whole_seconds() {
        assert_eq!(format_timecode(0.0), "00:00:00");
        assert_eq!(format_timecode(5400.0), "01:30:00");
        assert_eq!(format_timecode(61.0), "00:01:01");
    }

    #[test]
    fn test_fractional_seconds() {
        assert_eq!(format_timecode(1.5), "00:00:01.500");
    }

    #[test]
    fn test_rounding_carries_into_minutes() {
        // Just under a minute must not render a 60-second field.
        assert_eq!(format_timecode(59.9996), "00:01:00");
        assert_eq!(format_timecode(3599.9996), "01:00:00");
        assert_eq!(format_timecode(59.994), "00:00:59.994");
    }

    #[test]
    fn test_negative_clamped() {
        assert_eq!(format_timecode(-3.0), "00:00:00");
    }
}
