//! Query-string and URL helpers.

use std::collections::HashMap;

use hmac::{Hmac, Mac};
use sha2::Sha256;

/// Percent-decoding with `+` treated as a space, as query strings want.
pub fn url_decode(input: &str) -> String {
    let plus_fixed = input.replace('+', " ");
    urlencoding::decode(&plus_fixed)
        .map(|s| s.into_owned())
        .unwrap_or(plus_fixed)
}

pub fn url_encode(input: &str) -> String {
    urlencoding::encode(input).into_owned()
}

/// `a=1&b=x%20y` into a map, both sides URL-decoded.
pub fn parse_query_string(query: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        params.insert(url_decode(key), url_decode(value));
    }
    params
}

/// Canonical `k=v&…` over sorted keys, used for signing and verifying query
/// parameters. The signature parameter itself never takes part.
pub const SIGNATURE_PARAM: &str = "sign";

pub fn canonical_query(params: &HashMap<String, String>) -> String {
    let mut keys: Vec<_> = params
        .keys()
        .filter(|k| k.as_str() != SIGNATURE_PARAM)
        .collect();
    keys.sort();
    keys.iter()
        .map(|k| format!("{}={}", k, params[*k]))
        .collect::<Vec<_>>()
        .join("&")
}

pub fn sign_query(params: &HashMap<String, String>, key: &str) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(key.as_bytes()).expect("hmac accepts any key length");
    mac.update(canonical_query(params).as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// The verified view of a signed query: the parameters when the `sign`
/// parameter matches, empty otherwise.
pub fn verify_signed_query(
    params: &HashMap<String, String>,
    key: &str,
) -> HashMap<String, String> {
    match params.get(SIGNATURE_PARAM) {
        Some(signature) if *signature == sign_query(params, key) => {
            let mut verified = params.clone();
            verified.remove(SIGNATURE_PARAM);
            verified
        }
        _ => HashMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_strings_decode_pairs() {
        let params = parse_query_string("a=1&b=x%20y&c=p+q&flag");
        assert_eq!(params["a"], "1");
        assert_eq!(params["b"], "x y");
        assert_eq!(params["c"], "p q");
        assert_eq!(params["flag"], "");
    }

    #[test]
    fn signed_queries_verify_and_reject() {
        let mut params = HashMap::new();
        params.insert("user".to_owned(), "7".to_owned());
        params.insert("page".to_owned(), "2".to_owned());
        let signature = sign_query(&params, "master");
        params.insert(SIGNATURE_PARAM.to_owned(), signature);

        let verified = verify_signed_query(&params, "master");
        assert_eq!(verified.len(), 2);
        assert_eq!(verified["user"], "7");

        assert!(verify_signed_query(&params, "other-key").is_empty());
        params.insert("user".to_owned(), "8".to_owned());
        assert!(verify_signed_query(&params, "master").is_empty());
    }
}
