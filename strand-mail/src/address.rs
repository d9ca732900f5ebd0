//! SMTP envelope address parsing.
//!
//! Accepts `<local@host>[ KEY=value;…]` with strict character sets on both
//! sides of the `@`. Within the configured local domains two folder
//! encodings are recognized and canonicalized: `folder.mbox.user@host` and
//! `folder@user.host` both deliver to `user@host` in `folder`.

use nom::{
    bytes::complete::{tag, take_until},
    sequence::delimited,
    IResult,
};

use crate::{
    config::MailServerConfig,
    shared::{MailDirection, ParsedUser},
};

fn bracketed(input: &str) -> IResult<&str, &str> {
    delimited(tag("<"), take_until(">"), tag(">"))(input)
}

fn valid_local_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '=' | '+')
}

fn valid_host_char(c: char) -> bool {
    c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '-' | '_')
}

/// `KEY=value` parameters after the closing bracket, `;`-separated.
fn requested_size(params: &str) -> u64 {
    for part in params.split(';') {
        if let Some((key, value)) = part.split_once('=') {
            if key.trim().eq_ignore_ascii_case("size") {
                return value.trim().parse().unwrap_or(0);
            }
        }
    }
    0
}

pub fn parse_address(input: &str, config: &MailServerConfig) -> Option<ParsedUser> {
    let input = input.trim();
    let (params, address) = bracketed(input).ok()?;
    let params = params.trim();

    let mut ats = 0;
    let (mut local_len, mut host_len) = (0usize, 0usize);
    for c in address.chars() {
        if c == '@' {
            ats += 1;
        } else if ats == 0 {
            if !valid_local_char(c) {
                return None;
            }
            local_len += 1;
        } else {
            if !valid_host_char(c) {
                return None;
            }
            host_len += 1;
        }
    }
    if ats != 1 || local_len == 0 || host_len == 0 {
        return None;
    }

    let original_email = address.to_owned();
    let at_pos = address.find('@').unwrap_or(0);
    let mut email = original_email.clone();
    let mut folder = String::new();
    let mut local = false;

    for host in &config.smtp_hosts {
        let dotted = format!(".{host}");
        let direct = format!("@{host}");
        if original_email.ends_with(&dotted) {
            // folder@user.host
            local = true;
            folder = original_email[..at_pos].to_owned();
            let user = &original_email[at_pos + 1..original_email.len() - dotted.len()];
            email = format!("{user}@{host}");
            break;
        } else if original_email.ends_with(&direct) {
            local = true;
            // folder.mbox.user@host
            if let Some(mbox) = original_email.find(".mbox.") {
                if mbox != 0 {
                    folder = original_email[..mbox].to_owned();
                    email = original_email[mbox + 6..].to_owned();
                    break;
                }
            }
        }
    }

    let at_pos = email.find('@').unwrap_or(0);
    let original_email_server = email[at_pos + 1..].to_owned();

    Some(ParsedUser {
        original_email,
        original_email_server,
        email,
        folder,
        requested_size: requested_size(params),
        direction: MailDirection::Inbound,
        local,
        authenticated: false,
        user: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> MailServerConfig {
        MailServerConfig {
            smtp_hosts: vec!["example.org".to_owned(), "example.net".to_owned()],
            ..MailServerConfig::default()
        }
    }

    #[test]
    fn plain_addresses_parse() {
        let parsed = parse_address("<user@example.org>", &config()).expect("parses");
        assert_eq!(parsed.email, "user@example.org");
        assert_eq!(parsed.original_email, "user@example.org");
        assert_eq!(parsed.original_email_server, "example.org");
        assert!(parsed.local);
        assert!(parsed.folder.is_empty());
        assert_eq!(parsed.requested_size, 0);
    }

    #[test]
    fn remote_addresses_are_not_local() {
        let parsed = parse_address("<user@elsewhere.test>", &config()).expect("parses");
        assert!(!parsed.local);
        assert_eq!(parsed.original_email_server, "elsewhere.test");
    }

    #[test]
    fn size_parameter_is_honored() {
        let parsed = parse_address("<user@example.org> SIZE=12345", &config()).expect("parses");
        assert_eq!(parsed.requested_size, 12345);
        let parsed = parse_address("<user@example.org> SIZE=bogus", &config()).expect("parses");
        assert_eq!(parsed.requested_size, 0);
    }

    #[test]
    fn mbox_folder_encoding_canonicalizes() {
        let parsed =
            parse_address("<archive.mbox.user@example.org>", &config()).expect("parses");
        assert!(parsed.local);
        assert_eq!(parsed.folder, "archive");
        assert_eq!(parsed.email, "user@example.org");
    }

    #[test]
    fn prefix_folder_encoding_canonicalizes() {
        let parsed = parse_address("<archive@user.example.org>", &config()).expect("parses");
        assert!(parsed.local);
        assert_eq!(parsed.folder, "archive");
        assert_eq!(parsed.email, "user@example.org");
        assert_eq!(parsed.original_email, "archive@user.example.org");
    }

    #[test]
    fn malformed_addresses_are_rejected() {
        let cfg = config();
        for bad in [
            "user@example.org",        // no brackets
            "<user@@example.org>",     // two separators
            "<user>",                  // no host
            "<@example.org>",          // no local part
            "<us er@example.org>",     // bad local char
            "<user@EXAMPLE.org>",      // upper-case host char
        ] {
            assert!(parse_address(bad, &cfg).is_none(), "{bad}");
        }
    }
}
