use crate::error::NidoError;

const KIB: u64 = 1024;

/// Binary units, largest first.
const UNITS: [(&str, u64); 4] = [
    ("T", KIB * KIB * KIB * KIB),
    ("G", KIB * KIB * KIB),
    ("M", KIB * KIB),
    ("K", KIB),
];

/// Bytes for a size such as `20G`, `512M`, `100KB` or a plain byte count.
/// Units are binary (1G = 1024³ bytes) and case-insensitive.
pub fn parse_size(s: &str) -> Result<u64, NidoError> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, suffix) = s.split_at(split);
    let suffix = suffix.to_ascii_uppercase();

    let number: u64 = digits.parse().map_err(|_| NidoError::Validation {
        message: format!("invalid size '{s}'"),
    })?;
    let multiplier = if suffix.is_empty() || suffix == "B" {
        1
    } else {
        let unit = suffix.strip_suffix('B').unwrap_or(&suffix);
        UNITS
            .iter()
            .find(|(name, _)| *name == unit)
            .map(|(_, factor)| *factor)
            .ok_or_else(|| NidoError::Validation {
                message: format!("unknown size unit '{suffix}' in '{s}' (use K, M, G or T)"),
            })?
    };

    number
        .checked_mul(multiplier)
        .filter(|&bytes| bytes > 0)
        .ok_or_else(|| NidoError::Validation {
            message: format!("size '{s}' must be positive and fit in 64 bits"),
        })
}

/// `1.5 GB`-style rendering for log lines and reports.
pub fn format_size(bytes: u64) -> String {
    UNITS
        .iter()
        .skip(1)
        .find(|(_, factor)| bytes >= *factor)
        .map(|(name, factor)| format!("{:.1} {name}B", bytes as f64 / *factor as f64))
        .unwrap_or_else(|| format!("{bytes} B"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_size_units() {
        assert_eq!(parse_size("20G").unwrap(), 20 * 1024 * 1024 * 1024);
        assert_eq!(parse_size("1gb").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_size("512M").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_size("100K").unwrap(), 100 * 1024);
        assert_eq!(parse_size("1073741824").unwrap(), 1073741824);
        assert_eq!(parse_size(" 2t ").unwrap(), 2 << 40);
        assert_eq!(parse_size("4096B").unwrap(), 4096);
    }

    #[test]
    fn parse_size_rejects_garbage() {
        assert!(parse_size("").is_err());
        assert!(parse_size("G").is_err());
        assert!(parse_size("1.5G").is_err());
        assert!(parse_size("10X").is_err());
        assert!(parse_size("0G").is_err());
        assert!(parse_size("99999999999T").is_err());
    }

    #[test]
    fn format_size_picks_unit() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1536), "1.5 KB");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024), "3.0 GB");
        assert_eq!(format_size(5 << 40), "5120.0 GB");
    }
}
