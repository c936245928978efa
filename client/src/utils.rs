/// Format seconds into MM:SS or HH:MM:SS
pub fn format_time(seconds: f64) -> String {
    let total_secs = seconds.max(0.0) as u64;
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let secs = total_secs % 60;

    if hours > 0 {
        format!("{:02}:{:02}:{:02}", hours, minutes, secs)
    } else {
        format!("{:02}:{:02}", minutes, secs)
    }
}

/// Parse a seek target: plain seconds ("90", "12.5") or MM:SS / HH:MM:SS.
pub fn parse_seek_target(input: &str) -> Option<f64> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    if !input.contains(':') {
        return input.parse::<f64>().ok().filter(|secs| *secs >= 0.0);
    }

    let mut total = 0.0;
    for part in input.split(':') {
        let value = part.parse::<f64>().ok().filter(|v| *v >= 0.0)?;
        total = total * 60.0 + value;
    }
    Some(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_short_and_long_durations() {
        assert_eq!(format_time(0.0), "00:00");
        assert_eq!(format_time(75.4), "01:15");
        assert_eq!(format_time(3671.0), "01:01:11");
        assert_eq!(format_time(-5.0), "00:00");
    }

    #[test]
    fn parses_seconds_and_clock_targets() {
        assert_eq!(parse_seek_target("90"), Some(90.0));
        assert_eq!(parse_seek_target("12.5"), Some(12.5));
        assert_eq!(parse_seek_target("1:30"), Some(90.0));
        assert_eq!(parse_seek_target("1:01:11"), Some(3671.0));
        assert_eq!(parse_seek_target("-3"), None);
        assert_eq!(parse_seek_target("abc"), None);
        assert_eq!(parse_seek_target(""), None);
    }
}
