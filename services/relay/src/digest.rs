//! HTTP digest access authentication (RFC 2617, MD5).

use md5::{Digest, Md5};
use rand::Rng;
use std::collections::HashMap;

/// Parsed `WWW-Authenticate: Digest ...` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    pub algorithm: Option<String>,
    /// True when the server offers `qop=auth`.
    pub qop_auth: bool,
}

impl DigestChallenge {
    /// Parse a challenge header value. Returns `None` for non-digest schemes,
    /// when realm/nonce are missing, or for algorithms other than MD5 and
    /// MD5-sess.
    pub fn parse(header: &str) -> Option<Self> {
        let header = header.trim();
        let (scheme, rest) = header.split_once(char::is_whitespace)?;
        if !scheme.eq_ignore_ascii_case("digest") {
            return None;
        }

        let params = parse_params(rest);

        let qop_auth = params
            .get("qop")
            .map(|qop| qop.split(',').any(|q| q.trim().eq_ignore_ascii_case("auth")))
            .unwrap_or(false);

        let algorithm = params.get("algorithm").cloned();
        if let Some(name) = &algorithm {
            if !name.eq_ignore_ascii_case("md5") && !name.eq_ignore_ascii_case("md5-sess") {
                return None;
            }
        }

        Some(Self {
            realm: params.get("realm")?.clone(),
            nonce: params.get("nonce")?.clone(),
            opaque: params.get("opaque").cloned(),
            algorithm,
            qop_auth,
        })
    }

    /// Build the `Authorization` header value for a request.
    pub fn authorization(&self, method: &str, uri: &str, username: &str, password: &str) -> String {
        let cnonce = format!("{:016x}", rand::thread_rng().gen::<u64>());
        self.authorization_with_cnonce(method, uri, username, password, &cnonce, 1)
    }

    pub fn authorization_with_cnonce(
        &self,
        method: &str,
        uri: &str,
        username: &str,
        password: &str,
        cnonce: &str,
        nonce_count: u32,
    ) -> String {
        let mut ha1 = md5_hex(&format!("{}:{}:{}", username, self.realm, password));
        if self.is_session() {
            ha1 = md5_hex(&format!("{}:{}:{}", ha1, self.nonce, cnonce));
        }
        let ha2 = md5_hex(&format!("{}:{}", method, uri));
        let nc = format!("{:08x}", nonce_count);

        let response = if self.qop_auth {
            md5_hex(&format!(
                "{}:{}:{}:{}:auth:{}",
                ha1, self.nonce, nc, cnonce, ha2
            ))
        } else {
            md5_hex(&format!("{}:{}:{}", ha1, self.nonce, ha2))
        };

        let mut header = format!(
            r#"Digest username="{}", realm="{}", nonce="{}", uri="{}", response="{}""#,
            username, self.realm, self.nonce, uri, response
        );

        if let Some(algorithm) = &self.algorithm {
            header.push_str(&format!(", algorithm={}", algorithm));
        }
        if let Some(opaque) = &self.opaque {
            header.push_str(&format!(r#", opaque="{}""#, opaque));
        }
        if self.qop_auth {
            header.push_str(&format!(r#", qop=auth, nc={}, cnonce="{}""#, nc, cnonce));
        } else if self.is_session() {
            header.push_str(&format!(r#", cnonce="{}""#, cnonce));
        }

        header
    }

    fn is_session(&self) -> bool {
        self.algorithm
            .as_deref()
            .map(|a| a.eq_ignore_ascii_case("md5-sess"))
            .unwrap_or(false)
    }
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", Md5::digest(input.as_bytes()))
}

/// Split `key=value, key="quoted, value"` pairs. Keys are lowercased.
fn parse_params(input: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut chars = input.chars().peekable();

    loop {
        while matches!(chars.peek(), Some(c) if *c == ',' || c.is_whitespace()) {
            chars.next();
        }

        let key: String = chars
            .by_ref()
            .take_while(|c| *c != '=')
            .collect::<String>()
            .trim()
            .to_lowercase();
        if key.is_empty() {
            break;
        }

        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => break,
                    _ => value.push(c),
                }
            }
        } else {
            while let Some(c) = chars.peek() {
                if *c == ',' {
                    break;
                }
                value.push(*c);
                chars.next();
            }
            value = value.trim().to_string();
        }

        params.insert(key, value);
    }

    params
}
