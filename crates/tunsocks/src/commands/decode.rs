use tunsocks_bridge::packet;

use crate::cli::DecodeArgs;
use crate::error::CliError;

pub fn decode(args: DecodeArgs) -> Result<(), CliError> {
    let bytes = parse_hex(&args.hex)?;
    let parsed = packet::parse(&bytes)
        .ok_or_else(|| CliError::Other("no result: not a well-formed IPv4/IPv6 packet".to_string()))?;

    if args.json {
        let json = serde_json::to_string_pretty(&parsed)
            .map_err(|e| CliError::Other(format!("JSON serialization failed: {e}")))?;
        println!("{json}");
    } else {
        println!("{parsed}");
    }
    Ok(())
}

/// Hex digits with whitespace and an optional `0x` prefix stripped.
fn parse_hex(input: &str) -> Result<Vec<u8>, CliError> {
    let trimmed = input.trim();
    let digits: String = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed)
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();

    hex::decode(&digits).map_err(|e| CliError::Other(format!("Invalid hex input: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_ignores_prefix_and_spaces() {
        assert_eq!(parse_hex("0x45 00\n0a").unwrap(), vec![0x45, 0x00, 0x0a]);
        assert_eq!(parse_hex("DEADbeef").unwrap(), vec![0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn test_parse_hex_rejects_odd_length_and_junk() {
        assert!(parse_hex("abc").is_err());
        assert!(parse_hex("zz").is_err());
    }

    #[test]
    fn test_decode_rejects_non_ip_bytes() {
        let args = DecodeArgs {
            hex: "45".to_string(),
            json: false,
        };
        assert!(matches!(decode(args), Err(CliError::Other(msg)) if msg.starts_with("no result")));
    }
}
