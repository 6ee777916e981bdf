//! Helpers for memory size strings such as `"8g"` or `"512m"`.

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;
const TIB: u64 = 1024 * GIB;

/// Parse memory string (e.g., "8g", "512m", "1024k") to bytes
pub fn parse_memory_bytes(mem: &str) -> Option<u64> {
    let mem = mem.trim().to_lowercase();
    let suffixes: [(&str, u64); 8] = [
        ("tb", TIB),
        ("t", TIB),
        ("gb", GIB),
        ("g", GIB),
        ("mb", MIB),
        ("m", MIB),
        ("kb", KIB),
        ("k", KIB),
    ];
    let (num_str, multiplier) = suffixes
        .iter()
        .find(|(suffix, _)| mem.ends_with(suffix))
        .map(|(suffix, mult)| (mem.trim_end_matches(suffix), *mult))
        .unwrap_or((mem.as_str(), 1));
    num_str
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|n| *n >= 0.0)
        .map(|n| (n * multiplier as f64) as u64)
}

/// Convert a memory string to GiB. Unparseable strings count as zero.
pub fn memory_string_to_gb(mem: &str) -> f64 {
    match parse_memory_bytes(mem) {
        Some(bytes) => bytes as f64 / GIB as f64,
        None => {
            log::warn!("Could not parse memory string '{}'", mem);
            0.0
        }
    }
}

pub fn bytes_to_gb(bytes: u64) -> f64 {
    bytes as f64 / GIB as f64
}

/// Format bytes to memory string (e.g., "12g", "512m")
pub fn format_memory_bytes_short(bytes: u64) -> String {
    if bytes >= GIB {
        format!("{}g", bytes / GIB)
    } else if bytes >= MIB {
        format!("{}m", bytes / MIB)
    } else if bytes >= KIB {
        format!("{}k", bytes / KIB)
    } else {
        format!("{}b", bytes)
    }
}

/// Memory in whole MiB, rounded up, as batch schedulers expect it.
pub fn memory_string_to_mb(mem: &str) -> Option<u64> {
    parse_memory_bytes(mem).map(|bytes| bytes.div_ceil(MIB))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_memory_bytes_gigabytes() {
        assert_eq!(parse_memory_bytes("8g"), Some(8 * GIB));
        assert_eq!(parse_memory_bytes("8gb"), Some(8 * GIB));
        assert_eq!(parse_memory_bytes("8G"), Some(8 * GIB));
    }

    #[test]
    fn test_parse_memory_bytes_other_units() {
        assert_eq!(parse_memory_bytes("512m"), Some(512 * MIB));
        assert_eq!(parse_memory_bytes("1024kb"), Some(MIB));
        assert_eq!(parse_memory_bytes("1t"), Some(TIB));
        assert_eq!(parse_memory_bytes("1000"), Some(1000));
        assert_eq!(parse_memory_bytes("  8g  "), Some(8 * GIB));
    }

    #[test]
    fn test_parse_memory_bytes_invalid() {
        assert_eq!(parse_memory_bytes("invalid"), None);
        assert_eq!(parse_memory_bytes("8x"), None);
        assert_eq!(parse_memory_bytes("-1g"), None);
    }

    #[test]
    fn test_memory_string_to_gb() {
        assert_eq!(memory_string_to_gb("2g"), 2.0);
        assert_eq!(memory_string_to_gb("512m"), 0.5);
        assert_eq!(memory_string_to_gb("bogus"), 0.0);
    }

    #[test]
    fn test_memory_string_to_mb_rounds_up() {
        assert_eq!(memory_string_to_mb("1g"), Some(1024));
        assert_eq!(memory_string_to_mb("1500k"), Some(2));
    }

    #[test]
    fn test_parse_format_memory_roundtrip() {
        let bytes = parse_memory_bytes("12g").unwrap();
        assert_eq!(format_memory_bytes_short(bytes), "12g");
        assert_eq!(format_memory_bytes_short(512), "512b");
    }
}
