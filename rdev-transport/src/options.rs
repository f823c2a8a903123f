//! Helpers for the comma separated target and option strings.

use crate::{Error, Result};

/// Returns field `index` of a comma separated string, trimmed. Missing fields
/// are empty.
pub fn field(spec: &str, index: usize) -> &str {
    spec.split(',').nth(index).map(str::trim).unwrap_or("")
}

/// Parses an unsigned number the way C's `strtoul(s, 0, 0)` does: `0x` means
/// hex, a leading `0` means octal, anything else is decimal.
pub fn parse_number(s: &str) -> Result<u32> {
    let s = s.trim();
    let (digits, radix) = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        (hex, 16)
    } else if s.len() > 1 && s.starts_with('0') {
        (&s[1..], 8)
    } else {
        (s, 10)
    };
    u32::from_str_radix(digits, radix).map_err(|_| Error::parse(format!("invalid number {s:?}")))
}

/// Like [`parse_number`], but an empty field or zero yields `default`.
pub fn number_or(s: &str, default: u32) -> Result<u32> {
    if s.trim().is_empty() {
        return Ok(default);
    }
    match parse_number(s)? {
        0 => Ok(default),
        n => Ok(n),
    }
}

/// Splits `host[:port]`, falling back to `default_port`.
pub fn host_port(target: &str, default_port: u16) -> Result<(String, u16)> {
    let target = field(target, 0);
    if target.is_empty() {
        return Err(Error::parse("empty host"));
    }
    match target.rsplit_once(':') {
        Some((host, port)) => {
            let port = if port.is_empty() {
                default_port
            } else {
                match port.parse::<u16>() {
                    Ok(0) => default_port,
                    Ok(port) => port,
                    Err(_) => return Err(Error::parse(format!("invalid port {port:?}"))),
                }
            };
            Ok((host.to_owned(), port))
        }
        None => Ok((target.to_owned(), default_port)),
    }
}

/// `yes` and `true`, in any case, are true.
pub fn flag(s: &str) -> bool {
    s.eq_ignore_ascii_case("yes") || s.eq_ignore_ascii_case("true")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields() {
        assert_eq!(field("500000, 0x300-0x30f ,yes", 1), "0x300-0x30f");
        assert_eq!(field("500000", 2), "");
        assert_eq!(field("", 0), "");
    }

    #[test]
    fn numbers() {
        assert_eq!(parse_number("250000").unwrap(), 250000);
        assert_eq!(parse_number("0x30F").unwrap(), 0x30f);
        assert_eq!(parse_number("010").unwrap(), 8);
        assert_eq!(parse_number("0").unwrap(), 0);
        assert!(parse_number("fast").is_err());
        assert_eq!(number_or("", 9600).unwrap(), 9600);
        assert_eq!(number_or("0", 9600).unwrap(), 9600);
        assert_eq!(number_or("19200", 9600).unwrap(), 19200);
    }

    #[test]
    fn hosts() {
        assert_eq!(host_port("gw:4000", 3930).unwrap(), ("gw".to_owned(), 4000));
        assert_eq!(host_port("gw", 3930).unwrap(), ("gw".to_owned(), 3930));
        assert_eq!(host_port("gw:,x", 3930).unwrap(), ("gw".to_owned(), 3930));
        assert!(host_port("gw:port", 3930).is_err());
        assert!(host_port("", 3930).is_err());
    }

    #[test]
    fn flags() {
        assert!(flag("YES"));
        assert!(flag("true"));
        assert!(!flag("no"));
        assert!(!flag(""));
    }
}
