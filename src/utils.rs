#![allow(clippy::used_underscore_items, clippy::cast_possible_truncation)]

const _IOC_NRBITS: u32 = 8;
const _IOC_TYPEBITS: u32 = 8;
const _IOC_SIZEBITS: u32 = 14;

const _IOC_NRSHIFT: u32 = 0;
const _IOC_TYPESHIFT: u32 = _IOC_NRSHIFT + _IOC_NRBITS;
const _IOC_SIZESHIFT: u32 = _IOC_TYPESHIFT + _IOC_TYPEBITS;
const _IOC_DIRSHIFT: u32 = _IOC_SIZESHIFT + _IOC_SIZEBITS;

const _IOC_WRITE: u32 = 1;
const _IOC_READ: u32 = 2;

#[must_use]
pub const fn _ioc(dir: u32, type_: u32, nr: u32, size: usize) -> u32 {
    (dir << _IOC_DIRSHIFT)
        | (type_ << _IOC_TYPESHIFT)
        | (nr << _IOC_NRSHIFT)
        | ((size as u32) << _IOC_SIZESHIFT)
}

#[must_use]
pub const fn ior<T>(type_: u32, nr: u32) -> u32 {
    _ioc(_IOC_READ, type_, nr, std::mem::size_of::<T>())
}

#[must_use]
pub const fn iow<T>(type_: u32, nr: u32) -> u32 {
    _ioc(_IOC_WRITE, type_, nr, std::mem::size_of::<T>())
}

#[must_use]
pub const fn iowr<T>(type_: u32, nr: u32) -> u32 {
    _ioc(_IOC_READ | _IOC_WRITE, type_, nr, std::mem::size_of::<T>())
}

/// Rounds `value` up to the next multiple of `alignment`.
///
/// Works for any alignment, not only powers of two. An alignment of zero leaves
/// the value untouched. Returns `None` on overflow.
#[must_use]
pub const fn align(value: u64, alignment: u64) -> Option<u64> {
    if alignment == 0 {
        return Some(value);
    }
    let rem = value % alignment;
    if rem == 0 {
        Some(value)
    } else {
        value.checked_add(alignment - rem)
    }
}

/// Power-of-two fast path used by the KFD layer.
#[must_use]
pub const fn align_up(val: u64, align: u64) -> u64 {
    (val + align - 1) & !(align - 1)
}

/// Formats a byte count with SI units (`983.0 kB`, `2.1 MB`).
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn human_readable_bytes(bytes: u64) -> String {
    const UNIT: u64 = 1000;
    const PREFIXES: [char; 6] = ['k', 'M', 'G', 'T', 'P', 'E'];

    if bytes < UNIT {
        return format!("{bytes} B");
    }

    let mut exp = 0usize;
    let mut div = UNIT;
    while exp + 1 < PREFIXES.len() && bytes / div >= UNIT {
        div *= UNIT;
        exp += 1;
    }

    format!("{:.1} {}B", bytes as f64 / div as f64, PREFIXES[exp])
}

/// Parses sizes such as `512MB`, `2GB`, `64KB`, `1GiB` or a raw byte count.
///
/// Decimal and binary suffixes are both accepted; the decimal ones are treated
/// as binary multiples, which is what users of heap-size flags expect.
#[must_use]
pub fn parse_byte_size(text: &str) -> Option<u64> {
    let text = text.trim();
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (digits, suffix) = text.split_at(split);
    let value: u64 = digits.parse().ok()?;

    let multiplier: u64 = match suffix.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KIB" => 1 << 10,
        "M" | "MB" | "MIB" => 1 << 20,
        "G" | "GB" | "GIB" => 1 << 30,
        "T" | "TB" | "TIB" => 1 << 40,
        _ => return None,
    };

    value.checked_mul(multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_matches_reference_formula() {
        assert_eq!(align(0, 128), Some(0));
        assert_eq!(align(1, 128), Some(128));
        assert_eq!(align(128, 128), Some(128));
        assert_eq!(align(130, 24), Some(144));
        assert_eq!(align(77, 0), Some(77));
        assert_eq!(align(u64::MAX, 16), None);
    }

    #[test]
    fn human_readable_uses_si_units() {
        assert_eq!(human_readable_bytes(999), "999 B");
        assert_eq!(human_readable_bytes(1000), "1.0 kB");
        assert_eq!(human_readable_bytes(983_040), "983.0 kB");
        assert_eq!(human_readable_bytes(2_097_152), "2.1 MB");
        assert_eq!(human_readable_bytes(1_073_741_824), "1.1 GB");
    }

    #[test]
    fn parses_heap_size_flags() {
        assert_eq!(parse_byte_size("2GB"), Some(2 << 30));
        assert_eq!(parse_byte_size("512MB"), Some(512 << 20));
        assert_eq!(parse_byte_size("64kb"), Some(64 << 10));
        assert_eq!(parse_byte_size("4096"), Some(4096));
        assert_eq!(parse_byte_size(" 1 GiB "), Some(1 << 30));
        assert_eq!(parse_byte_size("GB"), None);
        assert_eq!(parse_byte_size("12XB"), None);
    }
}
