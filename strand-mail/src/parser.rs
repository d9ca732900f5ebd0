//! MIME message parsing.
//!
//! Takes the raw DATA bytes of a stored message apart: header block with
//! continuation lines, encoded-word subject lines, quoted-printable and
//! base64 transfer encodings, charset conversion, `multipart/*` recursion
//! and attachment extraction.

use std::collections::{BTreeSet, HashMap};

use base64::Engine;
use tracing::trace;

#[derive(Clone, Debug, Default)]
pub struct Attachment {
    pub attachment_id: String,
    pub name: String,
    pub file_name: String,
    pub disposition: String,
    pub mime: String,
    pub headers: Vec<(String, String)>,
    pub content: Vec<u8>,
}

#[derive(Clone, Debug, Default)]
pub struct ParsedMail {
    pub subject: String,
    pub from: String,
    pub return_path: String,
    pub reply_to: String,
    pub in_reply_to: String,
    pub external_message_id: String,
    pub dkim_domain: String,
    pub cc: BTreeSet<String>,
    pub bcc: BTreeSet<String>,
    pub headers: Vec<(String, String)>,
    pub text_body: String,
    pub text_charset: String,
    pub html_body: String,
    pub html_charset: String,
    pub indexable_text: String,
    pub attachments: Vec<Attachment>,
}

/// Split a header block off `data`: lower-cased keys, continuation lines
/// folded into their parent value. Returns the headers and the body that
/// follows the blank line.
pub fn parse_mail_headers(data: &str) -> (Vec<(String, String)>, &str) {
    let mut headers: Vec<(String, String)> = Vec::new();
    let mut rest = data;
    loop {
        let (line, tail) = match rest.split_once("\r\n") {
            Some(split) => split,
            None => (rest, ""),
        };
        if line.is_empty() {
            return (headers, tail);
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some(last) = headers.last_mut() {
                last.1.push(' ');
                last.1.push_str(line.trim());
            }
        } else if let Some((key, value)) = line.split_once(':') {
            headers.push((key.trim().to_ascii_lowercase(), value.trim().to_owned()));
        }
        if tail.is_empty() {
            return (headers, "");
        }
        rest = tail;
    }
}

fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.as_str())
}

/// `text/plain; charset="utf-8"` into the mime type and its parameters.
pub fn parse_header_params(value: &str) -> (String, HashMap<String, String>) {
    let mut parts = value.split(';');
    let mime = parts.next().unwrap_or("").trim().to_ascii_lowercase();
    let mut params = HashMap::new();
    for part in parts {
        if let Some((key, value)) = part.split_once('=') {
            params.insert(
                key.trim().to_ascii_lowercase(),
                value.trim().trim_matches('"').to_owned(),
            );
        }
    }
    (mime, params)
}

pub fn decode_quoted_printable(input: &str, underscore_as_space: bool) -> Vec<u8> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'=' => {
                // soft line break
                if bytes[i + 1..].starts_with(b"\r\n") {
                    i += 3;
                    continue;
                }
                let hex = bytes.get(i + 1..i + 3);
                match hex.and_then(|h| u8::from_str_radix(&String::from_utf8_lossy(h), 16).ok()) {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    None => {
                        out.push(b'=');
                        i += 1;
                    }
                }
            }
            b'_' if underscore_as_space => {
                out.push(b' ');
                i += 1;
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    out
}

/// Bytes to text honoring the declared charset; UTF-8 straight through,
/// Latin-1 transcoded, anything else best-effort UTF-8.
pub fn convert_charset(bytes: &[u8], charset: &str) -> String {
    match charset.to_ascii_lowercase().as_str() {
        "" | "utf-8" | "utf8" | "us-ascii" | "ascii" => {
            String::from_utf8_lossy(bytes).into_owned()
        }
        "iso-8859-1" | "latin1" | "windows-1252" => {
            bytes.iter().map(|&b| b as char).collect()
        }
        other => {
            trace!(charset = other, "unknown charset");
            String::from_utf8_lossy(bytes).into_owned()
        }
    }
}

/// RFC-2047 encoded words: `=?charset?Q|B?payload?=`, mixed freely with
/// plain text.
pub fn decode_encoded_words(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("=?") {
        out.push_str(&rest[..start]);
        let candidate = &rest[start..];
        let decoded = (|| {
            let inner = &candidate[2..];
            let (charset, inner) = inner.split_once('?')?;
            let (encoding, inner) = inner.split_once('?')?;
            let end = inner.find("?=")?;
            let payload = &inner[..end];
            let bytes = match encoding {
                "B" | "b" => base64::engine::general_purpose::STANDARD
                    .decode(payload)
                    .ok()?,
                "Q" | "q" => decode_quoted_printable(payload, true),
                _ => return None,
            };
            Some((
                convert_charset(&bytes, charset),
                2 + charset.len() + 1 + encoding.len() + 1 + end + 2,
            ))
        })();
        match decoded {
            Some((text, consumed)) => {
                out.push_str(&text);
                rest = &candidate[consumed..];
            }
            None => {
                out.push_str("=?");
                rest = &candidate[2..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Undo the content-transfer-encoding of one MIME part.
fn decode_transfer(body: &str, encoding: Option<&str>) -> Vec<u8> {
    match encoding.map(|e| e.trim().to_ascii_lowercase()).as_deref() {
        Some("base64") => {
            let compact: String = body.chars().filter(|c| !c.is_whitespace()).collect();
            base64::engine::general_purpose::STANDARD
                .decode(compact.as_bytes())
                .unwrap_or_else(|_| body.as_bytes().to_vec())
        }
        Some("quoted-printable") => decode_quoted_printable(body, false),
        _ => body.as_bytes().to_vec(),
    }
}

/// Extract the bare address out of `Name <addr>` or a bare `addr`.
pub fn extract_address(value: &str) -> String {
    match (value.find('<'), value.find('>')) {
        (Some(start), Some(end)) if start < end => value[start + 1..end].trim().to_owned(),
        _ => value.trim().to_owned(),
    }
}

fn address_set(value: &str) -> BTreeSet<String> {
    value
        .split(',')
        .map(extract_address)
        .filter(|addr| !addr.is_empty())
        .collect()
}

fn dkim_domain_of(headers: &[(String, String)]) -> String {
    header(headers, "dkim-signature")
        .map(|value| {
            value
                .split(';')
                .filter_map(|part| part.trim().strip_prefix("d="))
                .map(|domain| domain.trim().to_owned())
                .next()
                .unwrap_or_default()
        })
        .unwrap_or_default()
}

fn strip_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            c if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}

fn handle_part(
    parsed: &mut ParsedMail,
    message_id: &str,
    headers: Vec<(String, String)>,
    body: &str,
) {
    let (mime, params) = parse_header_params(header(&headers, "content-type").unwrap_or(""));
    let charset = params.get("charset").cloned().unwrap_or_default();
    let transfer = header(&headers, "content-transfer-encoding");
    let disposition_raw = header(&headers, "content-disposition").unwrap_or("");
    let (disposition, disposition_params) = parse_header_params(disposition_raw);

    if let Some(boundary) = params.get("boundary") {
        walk_multipart(parsed, message_id, body, boundary);
        return;
    }

    let content = decode_transfer(body, transfer);
    let is_attachment = disposition == "attachment";

    if mime == "text/plain" && !is_attachment && parsed.text_body.is_empty() {
        parsed.text_body = convert_charset(&content, &charset);
        parsed.text_charset = if charset.is_empty() {
            "utf-8".to_owned()
        } else {
            charset
        };
    } else if mime == "text/html" && !is_attachment && parsed.html_body.is_empty() {
        parsed.html_body = convert_charset(&content, &charset);
        parsed.html_charset = if charset.is_empty() {
            "utf-8".to_owned()
        } else {
            charset
        };
    } else {
        let index = parsed.attachments.len();
        parsed.attachments.push(Attachment {
            attachment_id: format!("{message_id}.{index}"),
            name: params.get("name").cloned().unwrap_or_default(),
            file_name: disposition_params
                .get("filename")
                .cloned()
                .unwrap_or_default(),
            disposition: if disposition.is_empty() {
                "attachment".to_owned()
            } else {
                disposition
            },
            mime,
            headers,
            content,
        });
    }
}

fn walk_multipart(parsed: &mut ParsedMail, message_id: &str, body: &str, boundary: &str) {
    let marker = format!("--{boundary}");
    let mut sections = body.split(marker.as_str());
    // everything before the first marker is preamble
    sections.next();
    for section in sections {
        if section.starts_with("--") {
            break;
        }
        let section = section
            .strip_prefix("\r\n")
            .unwrap_or(section)
            .trim_end_matches("\r\n");
        if section.is_empty() {
            continue;
        }
        let (headers, part_body) = parse_mail_headers(section);
        handle_part(parsed, message_id, headers, part_body);
    }
}

/// Parse a complete message into its indexed form.
pub fn parse_mail(message_id: &str, data: &[u8]) -> ParsedMail {
    let text = String::from_utf8_lossy(data).into_owned();
    let (headers, body) = parse_mail_headers(&text);

    let mut parsed = ParsedMail {
        subject: decode_encoded_words(header(&headers, "subject").unwrap_or("")),
        from: header(&headers, "from").unwrap_or("").to_owned(),
        return_path: extract_address(header(&headers, "return-path").unwrap_or("")),
        reply_to: extract_address(header(&headers, "reply-to").unwrap_or("")),
        in_reply_to: extract_address(header(&headers, "in-reply-to").unwrap_or("")),
        external_message_id: extract_address(header(&headers, "message-id").unwrap_or("")),
        dkim_domain: dkim_domain_of(&headers),
        cc: address_set(header(&headers, "cc").unwrap_or("")),
        bcc: address_set(header(&headers, "bcc").unwrap_or("")),
        ..ParsedMail::default()
    };

    handle_part(&mut parsed, message_id, headers.clone(), body);
    parsed.headers = headers;

    parsed.indexable_text = if parsed.text_body.is_empty() {
        strip_tags(&parsed.html_body)
    } else {
        parsed.text_body.clone()
    };
    parsed
}
