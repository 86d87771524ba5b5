//! RFC 3696 style address parsing
//!
//! These helpers never allocate more than the address itself and never
//! consult configuration; the decisions driven by configuration live in
//! [`AddressPolicy`](super::AddressPolicy).

use crate::error::{MailError, Result};
use std::net::IpAddr;

/// Maximum length of a complete address
pub const MAX_ADDRESS_LENGTH: usize = 320;

/// Maximum length of the local part
pub const MAX_LOCAL_LENGTH: usize = 128;

/// Maximum length of a domain
pub const MAX_DOMAIN_LENGTH: usize = 255;

/// Maximum length of a single domain label
pub const MAX_LABEL_LENGTH: usize = 63;

/// Characters allowed unquoted in a local part, besides letters and digits
const LOCAL_SPECIALS: &[u8] = b"!#$%&'*+-/=?^_`{|}~";

/// Characters allowed in a canonical mailbox name, besides letters and digits
const MAILBOX_SPECIALS: &[u8] = b"!#$%&'*+-=/?^_`.{|}~";

fn invalid(msg: impl Into<String>) -> MailError {
    MailError::InvalidAddress(msg.into())
}

/// Unescapes an address and splits it into local part and domain, then
/// validates the domain.
pub fn parse_email_address(address: &str) -> Result<(String, String)> {
    let (local, domain) = split_address(address)?;
    if !validate_domain_part(&domain) {
        return Err(invalid(format!("domain part {:?} failed validation", domain)));
    }
    Ok((local, domain))
}

/// Unescapes an address and splits it into local part and domain.
///
/// The domain is optional and not validated. Quoted strings may only open
/// the address; a backslash quotes exactly the next character.
pub fn split_address(address: &str) -> Result<(String, String)> {
    if address.is_empty() {
        return Err(invalid("empty address"));
    }
    if address.len() > MAX_ADDRESS_LENGTH {
        return Err(invalid("address exceeds 320 characters"));
    }

    // Forward-path route, e.g. `@relay.example:user@example.com`
    let address = if address.starts_with('@') {
        let end = address
            .find(':')
            .ok_or_else(|| invalid("missing terminating ':' in route specification"))?;
        let rest = &address[end + 1..];
        if rest.is_empty() {
            return Err(invalid("address empty after removing route specification"));
        }
        rest
    } else {
        address
    };

    let bytes = address.as_bytes();
    if bytes[0] == b'.' {
        return Err(invalid("address cannot start with a period"));
    }

    let mut local = String::with_capacity(address.len());
    let mut domain = String::new();
    let mut prev = b'.';
    let mut in_char_quote = false;
    let mut in_string_quote = false;

    for (i, &c) in bytes.iter().enumerate() {
        match c {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' => {
                local.push(c as char);
                in_char_quote = false;
            }
            c if LOCAL_SPECIALS.contains(&c) => {
                local.push(c as char);
                in_char_quote = false;
            }
            b'.' => {
                if prev == b'.' {
                    return Err(invalid("sequence of periods is not permitted"));
                }
                local.push('.');
                in_char_quote = false;
            }
            b'\\' => {
                in_char_quote = true;
            }
            b'"' => {
                if in_char_quote {
                    local.push('"');
                    in_char_quote = false;
                } else if in_string_quote {
                    in_string_quote = false;
                } else if i == 0 {
                    in_string_quote = true;
                } else {
                    return Err(invalid("quoted string can only begin at start of address"));
                }
            }
            b'@' => {
                if in_char_quote || in_string_quote {
                    local.push('@');
                    in_char_quote = false;
                } else {
                    if i > MAX_LOCAL_LENGTH {
                        return Err(invalid("local part must not exceed 128 characters"));
                    }
                    if prev == b'.' {
                        return Err(invalid("local part cannot end with a period"));
                    }
                    domain = address[i + 1..].to_string();
                    break;
                }
            }
            c if c > 127 => {
                return Err(invalid("characters outside of US-ASCII range not permitted"));
            }
            c => {
                if in_char_quote || in_string_quote {
                    local.push(c as char);
                    in_char_quote = false;
                } else {
                    return Err(invalid(format!("character {:?} must be quoted", c as char)));
                }
            }
        }
        prev = c;
    }

    if in_char_quote {
        return Err(invalid("cannot end address with unterminated quoted-pair"));
    }
    if in_string_quote {
        return Err(invalid("cannot end address with unterminated string quote"));
    }

    Ok((local, domain))
}

/// Returns true if the domain complies with RFC 3696 / RFC 1035.
///
/// Bracketed IP literals (`[192.0.2.1]`, `[IPv6:2001:db8::1]`) are accepted.
pub fn validate_domain_part(domain: &str) -> bool {
    let len = domain.len();
    if len == 0 || len > MAX_DOMAIN_LENGTH {
        return false;
    }

    if len >= 4 && domain.starts_with('[') && domain.ends_with(']') {
        let inner = &domain[1..len - 1];
        let inner = inner.strip_prefix("IPv6:").unwrap_or(inner);
        return inner.parse::<IpAddr>().is_ok();
    }

    let mut prev = '.';
    let mut label_len = 0;
    let mut has_alnum = false;

    // A trailing period is implied so the last label gets checked too
    for c in domain.chars().chain(if domain.ends_with('.') { None } else { Some('.') }) {
        match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '_' => {
                has_alnum = true;
                label_len += 1;
            }
            '-' => {
                if prev == '.' || prev == '-' {
                    return false;
                }
                label_len += 1;
            }
            '.' => {
                if prev == '.' || prev == '-' {
                    return false;
                }
                if label_len > MAX_LABEL_LENGTH || !has_alnum {
                    return false;
                }
                label_len = 0;
                has_alnum = false;
            }
            _ => return false,
        }
        prev = c;
    }

    true
}

/// Canonicalizes a local part into a mailbox name.
///
/// The result is lower-cased and truncated at the first `+`. Characters
/// that would need quoting are rejected, as is a name left empty by the
/// truncation.
pub fn parse_mailbox_name(local_part: &str) -> Result<String> {
    if local_part.is_empty() {
        return Err(invalid("mailbox name cannot be empty"));
    }

    let lowered = local_part.to_ascii_lowercase();
    let bad: String = lowered
        .bytes()
        .filter(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || MAILBOX_SPECIALS.contains(c)))
        .map(|c| c as char)
        .collect();
    if !bad.is_empty() {
        return Err(invalid(format!(
            "mailbox name contained invalid character(s): {:?}",
            bad
        )));
    }

    let name = match lowered.find('+') {
        Some(idx) => lowered[..idx].to_string(),
        None => lowered,
    };
    if name.is_empty() {
        return Err(invalid("mailbox name cannot be empty"));
    }
    Ok(name)
}

/// Extracts the mailbox name when domain naming is configured.
pub fn extract_domain_mailbox(address: &str) -> Result<String> {
    let (local, domain) = if address.len() >= 2 && address.starts_with('[') && address.ends_with(']') {
        (String::new(), address.to_string())
    } else {
        split_address(address)?
    };

    let local = if local.is_empty() {
        local
    } else {
        parse_mailbox_name(&local)?
    };

    // A bare name is a mailbox lookup, not a delivery
    let domain = if domain.is_empty() { local } else { domain };

    if !validate_domain_part(&domain) {
        return Err(invalid(format!(
            "domain part {:?} in {:?} failed validation",
            domain, address
        )));
    }

    Ok(domain)
}

/// Matches `value` against a pattern where `*` stands for any run of characters.
pub fn match_wildcards(pattern: &str, value: &str) -> bool {
    let pattern = pattern.as_bytes();
    let value = value.as_bytes();
    let (mut p, mut v) = (0, 0);
    let mut star: Option<usize> = None;
    let mut resume = 0;

    while v < value.len() {
        if p < pattern.len() && pattern[p] == b'*' {
            star = Some(p);
            p += 1;
            resume = v;
        } else if p < pattern.len() && pattern[p] == value[v] {
            p += 1;
            v += 1;
        } else if let Some(s) = star {
            p = s + 1;
            resume += 1;
            v = resume;
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|&c| c == b'*')
}
