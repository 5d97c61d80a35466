//! 文件大小字符串（如 `50 MiB`）的解析与格式化。

const UNITS: [(&str, u64); 5] = [
    ("", 1),
    ("KiB", 1 << 10),
    ("MiB", 1 << 20),
    ("GiB", 1 << 30),
    ("TiB", 1 << 40),
];

/// 解析 `<数字> [单位]`，单位大小写不敏感；溢出或格式错误返回 None。
pub fn parse_file_size(size: &str) -> Option<u64> {
    let size = size.trim();
    let digits_end = size
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(size.len());
    if digits_end == 0 {
        return None;
    }
    let value: u64 = size[..digits_end].parse().ok()?;
    let unit = size[digits_end..].trim();
    let ratio = UNITS
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(unit))
        .map(|(_, ratio)| *ratio)?;
    value.checked_mul(ratio)
}

/// 取能整除出非零值的最大单位，向下截断（1536 → `1 KiB`）。
pub fn format_file_size(size: u64) -> String {
    UNITS
        .iter()
        .rev()
        .find(|(_, ratio)| size / ratio != 0)
        .map(|(name, ratio)| {
            if name.is_empty() {
                (size / ratio).to_string()
            } else {
                format!("{} {}", size / ratio, name)
            }
        })
        .unwrap_or_else(|| "0".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_units() {
        assert_eq!(parse_file_size("50 MiB"), Some(50 * 1024 * 1024));
        assert_eq!(parse_file_size("2gib"), Some(2 * 1024 * 1024 * 1024));
        assert_eq!(parse_file_size("  1024 "), Some(1024));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_file_size("MiB"), None);
        assert_eq!(parse_file_size("10 MB"), None);
        assert_eq!(parse_file_size("-1"), None);
        assert_eq!(parse_file_size("99999999999999999999 TiB"), None);
    }

    #[test]
    fn formats_largest_unit() {
        assert_eq!(format_file_size(1536), "1 KiB");
        assert_eq!(format_file_size(2 * 1024 * 1024 * 1024), "2 GiB");
        assert_eq!(format_file_size(512), "512");
        assert_eq!(format_file_size(0), "0");
    }
}
