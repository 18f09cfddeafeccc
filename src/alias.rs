//! Human-readable device names.
//!
//! Aliases are exported as the `name` label next to the `hw` address label,
//! so dashboards can show "Bedroom" instead of an address.

use crate::mac_address::MacAddress;
use std::collections::BTreeMap;

/// Device address to human-readable name.
pub type AliasMap = BTreeMap<MacAddress, String>;

/// A parsed `MAC=NAME` alias.
#[derive(Debug, Clone, PartialEq)]
pub struct Alias {
    pub address: MacAddress,
    pub name: String,
}

/// Parse an alias from a string in the format `MAC=NAME`.
///
/// # Example
/// ```
/// use switchbot_exporter::alias::parse_alias;
///
/// let alias = parse_alias("C4:7C:8D:6A:01:0F=Bedroom").unwrap();
/// assert_eq!(alias.address.to_string(), "C4:7C:8D:6A:01:0F");
/// assert_eq!(alias.name, "Bedroom");
/// ```
pub fn parse_alias(src: &str) -> Result<Alias, String> {
    let (address, name) = src
        .split_once('=')
        .ok_or_else(|| "invalid alias: expected format MAC=NAME".to_string())?;
    let address = address
        .parse()
        .map_err(|e| format!("invalid alias: {e}"))?;

    Ok(Alias {
        address,
        name: name.to_string(),
    })
}

/// Collect aliases into a lookup map; later entries win.
pub fn to_map(aliases: &[Alias]) -> AliasMap {
    aliases
        .iter()
        .map(|a| (a.address, a.name.clone()))
        .collect()
}

/// Name for `address`, or an empty string when no alias is configured.
pub fn resolve_name<'a>(address: &MacAddress, aliases: &'a AliasMap) -> &'a str {
    aliases.get(address).map_or("", String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TEST_MAC;

    #[test]
    fn test_parse_alias_valid() {
        let alias = parse_alias("AA:BB:CC:DD:EE:FF=Living Room").unwrap();
        assert_eq!(alias.address, TEST_MAC);
        assert_eq!(alias.name, "Living Room");
    }

    #[test]
    fn test_parse_alias_missing_separator() {
        assert!(parse_alias("no-equals-sign").is_err());
    }

    #[test]
    fn test_parse_alias_bad_address() {
        let err = parse_alias("AA:BB=Kitchen").unwrap_err();
        assert!(err.contains("expected 6 parts"), "{err}");
    }

    #[test]
    fn test_to_map_and_resolve() {
        let other = MacAddress([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
        let aliases = vec![
            parse_alias("AA:BB:CC:DD:EE:FF=Kitchen").unwrap(),
            parse_alias("aa:bb:cc:dd:ee:ff=Pantry").unwrap(),
        ];
        let map = to_map(&aliases);
        assert_eq!(map.len(), 1);
        assert_eq!(resolve_name(&TEST_MAC, &map), "Pantry");
        assert_eq!(resolve_name(&other, &map), "");
    }
}
