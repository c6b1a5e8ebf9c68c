//! Human-readable size and percentage formatting for capacity reports.

const UNITS: [&str; 5] = ["bytes", "KB", "MB", "GB", "TB"];

/// Render a byte count in the largest unit that keeps the magnitude below
/// 1024, with two decimals. Anything past the TB range stays in TB.
pub fn disk_size_format(bytes: u64) -> String {
    let mut num = bytes as f64;
    for unit in &UNITS[..UNITS.len() - 1] {
        if num < 1024.0 {
            return format!("{num:.2} {unit}");
        }
        num /= 1024.0;
    }
    format!("{num:.2} {}", UNITS[UNITS.len() - 1])
}

/// Render a ratio (0.25 → "25.00%").
pub fn percent_format(ratio: f64) -> String {
    format!("{:.2}%", ratio * 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kilobytes_with_two_decimals() {
        assert_eq!(disk_size_format(1536), "1.50 KB");
    }

    #[test]
    fn small_values_stay_in_bytes() {
        assert_eq!(disk_size_format(0), "0.00 bytes");
        assert_eq!(disk_size_format(1023), "1023.00 bytes");
        assert_eq!(disk_size_format(1024), "1.00 KB");
    }

    #[test]
    fn every_unit_keeps_magnitude_below_1024() {
        for exp in 0..5u32 {
            let n = 1000u64 * 1024u64.pow(exp);
            let rendered = disk_size_format(n);
            let (num, unit) = rendered.split_once(' ').unwrap();
            assert!(num.parse::<f64>().unwrap() < 1024.0, "{rendered}");
            assert_eq!(unit, UNITS[exp as usize]);
        }
    }

    #[test]
    fn beyond_terabytes_stays_in_tb() {
        let five_pb = 5 * 1024u64.pow(5);
        assert_eq!(disk_size_format(five_pb), "5120.00 TB");
    }

    #[test]
    fn percentages() {
        assert_eq!(percent_format(0.25), "25.00%");
        assert_eq!(percent_format(1.5), "150.00%");
        assert_eq!(percent_format(1.0 / 3.0), "33.33%");
    }
}
