use std::net::IpAddr;

/// Checks `address` against a `;`-separated allow-list.
///
/// Each entry is either a single address or an inclusive `start-end` range.
/// Entries that fail to parse are skipped. Ranges only match addresses of
/// the same family.
pub fn is_ip_allowed(allowed_list: &str, address: IpAddr) -> bool {
    allowed_list
        .split(';')
        .map(str::trim)
        .filter(|rule| !rule.is_empty())
        .any(|rule| rule_matches(rule, address))
}

/// True when every entry is blank. A list holding only unparsable entries
/// is still restrictive and admits nobody.
pub fn is_unrestricted(allowed_list: &str) -> bool {
    allowed_list.split(';').all(|rule| rule.trim().is_empty())
}

fn rule_matches(rule: &str, address: IpAddr) -> bool {
    match rule.split_once('-') {
        None => rule.parse::<IpAddr>().is_ok_and(|ip| ip == address),
        Some((start, end)) => {
            let (Ok(start), Ok(end)) = (start.trim().parse::<IpAddr>(), end.trim().parse::<IpAddr>())
            else {
                return false;
            };
            match (start, end, address) {
                (IpAddr::V4(s), IpAddr::V4(e), IpAddr::V4(a)) => {
                    (u32::from(s)..=u32::from(e)).contains(&u32::from(a))
                }
                (IpAddr::V6(s), IpAddr::V6(e), IpAddr::V6(a)) => {
                    (u128::from(s)..=u128::from(e)).contains(&u128::from(a))
                }
                _ => false,
            }
        }
    }
}
