//! Human readable rendering of speeds, traffic and loss ratios.

const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

/// Render a byte count (or bytes per second) with two decimals, e.g. `1.50MB`.
pub fn format_bytes(bytes: f64) -> String {
    let mut value = if bytes.is_finite() && bytes > 0.0 {
        bytes
    } else {
        0.0
    };
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2}{}", value, UNITS[unit])
}

/// Speed column value: `N/A` when nothing was measured.
pub fn format_speed(speed: Option<f64>) -> String {
    match speed {
        Some(v) if v > 0.0 => format_bytes(v),
        _ => "N/A".to_string(),
    }
}

pub fn format_percent(ratio: f64) -> String {
    format!("{:.2}%", ratio * 100.0)
}

pub fn format_ms(ms: f64) -> String {
    format!("{:.2}", ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes_units() {
        assert_eq!(format_bytes(0.0), "0.00B");
        assert_eq!(format_bytes(512.0), "512.00B");
        assert_eq!(format_bytes(1536.0), "1.50KB");
        assert_eq!(format_bytes(5.0 * 1024.0 * 1024.0), "5.00MB");
        assert_eq!(format_bytes(f64::NAN), "0.00B");
    }

    #[test]
    fn test_format_speed_not_measured() {
        assert_eq!(format_speed(None), "N/A");
        assert_eq!(format_speed(Some(0.0)), "N/A");
        assert_eq!(format_speed(Some(2048.0)), "2.00KB");
    }

    #[test]
    fn test_format_percent() {
        assert_eq!(format_percent(1.0), "100.00%");
        assert_eq!(format_percent(0.125), "12.50%");
    }
}
