use itertools::Itertools;

/// Parses a 16-bit ID written in hex, with or without a `0x` prefix.
pub fn parse_u16(s: &str) -> Result<u16, String> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);

    u16::from_str_radix(digits, 16).map_err(|err| format!("invalid hex ID {:?}: {}", s, err))
}

/// Parses a single byte written in hex, with or without a `0x` prefix.
pub fn parse_u8(s: &str) -> Result<u8, String> {
    let value = parse_u16(s)?;
    u8::try_from(value).map_err(|_| format!("{:?} does not fit into a byte", s))
}

/// Parses bytes written in hex.
///
/// Bytes may be separated by whitespace, `:` or `-`, or written back to back.
pub fn parse_bytes(s: &str) -> Result<Vec<u8>, String> {
    let digits: String = s
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':' && *c != '-')
        .collect();

    if digits.is_empty() {
        return Err("no bytes given".to_string());
    }
    if digits.len() % 2 != 0 {
        return Err(format!("{:?} has an odd number of hex digits", s));
    }

    digits
        .as_bytes()
        .chunks(2)
        .map(|pair| {
            std::str::from_utf8(pair)
                .ok()
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| format!("invalid hex byte {:?}", String::from_utf8_lossy(pair)))
        })
        .collect()
}

pub fn format(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids() {
        assert_eq!(parse_u16("046d"), Ok(0x046d));
        assert_eq!(parse_u16("0xC52B"), Ok(0xc52b));
        assert!(parse_u16("10000").is_err());
        assert!(parse_u16("xyz").is_err());
        assert_eq!(parse_u8("0x10"), Ok(0x10));
        assert!(parse_u8("100").is_err());
    }

    #[test]
    fn bytes() {
        assert_eq!(parse_bytes("00 01 ff"), Ok(vec![0x00, 0x01, 0xff]));
        assert_eq!(parse_bytes("0001ff"), Ok(vec![0x00, 0x01, 0xff]));
        assert_eq!(parse_bytes("de:ad-BE ef"), Ok(vec![0xde, 0xad, 0xbe, 0xef]));
        assert!(parse_bytes("").is_err());
        assert!(parse_bytes("123").is_err());
        assert!(parse_bytes("zz").is_err());
    }

    #[test]
    fn formats_bytes() {
        assert_eq!(format(&[0x00, 0x1f, 0xa0]), "00 1f a0");
        assert_eq!(format(&[]), "");
    }
}
