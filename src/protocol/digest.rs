//! HTTP Digest 认证
//!
//! 从 `WWW-Authenticate` 挑战中解析 realm/nonce/qop/algorithm，
//! 计算 `Authorization` 头。除随机 cnonce 外不保留任何状态。

use crate::error::DigestError;
use md5::Md5;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// 固定的请求计数，每个挑战只用一次
pub const NONCE_COUNT: &str = "00000001";

/// 摘要算法
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Md5,
    Sha256,
}

impl DigestAlgorithm {
    fn parse(name: &str) -> Result<Self, DigestError> {
        match name.trim().to_ascii_uppercase().as_str() {
            "" | "MD5" => Ok(DigestAlgorithm::Md5),
            "SHA-256" => Ok(DigestAlgorithm::Sha256),
            other => Err(DigestError::UnsupportedAlgorithm {
                algorithm: other.to_string(),
            }),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            DigestAlgorithm::Md5 => "MD5",
            DigestAlgorithm::Sha256 => "SHA-256",
        }
    }

    fn hash(&self, input: &str) -> String {
        match self {
            DigestAlgorithm::Md5 => hex::encode(Md5::digest(input.as_bytes())),
            DigestAlgorithm::Sha256 => hex::encode(Sha256::digest(input.as_bytes())),
        }
    }
}

/// 已解析的 Digest 挑战
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub qop: Option<String>,
    pub algorithm: Option<String>,
    pub opaque: Option<String>,
}

impl DigestChallenge {
    /// 解析 `WWW-Authenticate` 头
    pub fn parse(header: &str) -> Result<Self, DigestError> {
        let header = header.trim();
        let params = match header.get(..7) {
            Some(scheme) if scheme.eq_ignore_ascii_case("digest ") => &header[7..],
            _ => {
                return Err(DigestError::NotDigest {
                    header: header.to_string(),
                })
            }
        };

        let fields = parse_params(params);
        let realm = fields
            .get("realm")
            .cloned()
            .ok_or(DigestError::MissingField { field: "realm" })?;
        let nonce = fields
            .get("nonce")
            .cloned()
            .ok_or(DigestError::MissingField { field: "nonce" })?;

        Ok(Self {
            realm,
            nonce,
            qop: fields.get("qop").cloned(),
            algorithm: fields.get("algorithm").cloned(),
            opaque: fields.get("opaque").cloned(),
        })
    }

    /// 生成 `Authorization` 头，每次调用使用新的随机 cnonce
    pub fn authorization(
        &self,
        method: &str,
        uri: &str,
        username: &str,
        password: &str,
    ) -> Result<String, DigestError> {
        let cnonce = hex::encode(fastrand::u64(..).to_be_bytes());
        self.authorization_with_cnonce(method, uri, username, password, &cnonce)
    }

    /// 使用指定 cnonce 生成 `Authorization` 头，结果可逐字节复现
    pub fn authorization_with_cnonce(
        &self,
        method: &str,
        uri: &str,
        username: &str,
        password: &str,
        cnonce: &str,
    ) -> Result<String, DigestError> {
        let algorithm = DigestAlgorithm::parse(self.algorithm.as_deref().unwrap_or(""))?;
        let qop = self.selected_qop();

        let ha1 = algorithm.hash(&format!("{}:{}:{}", username, self.realm, password));
        let ha2 = algorithm.hash(&format!("{}:{}", method, uri));
        let response = match qop {
            Some(qop) => algorithm.hash(&format!(
                "{}:{}:{}:{}:{}:{}",
                ha1, self.nonce, NONCE_COUNT, cnonce, qop, ha2
            )),
            None => algorithm.hash(&format!("{}:{}:{}", ha1, self.nonce, ha2)),
        };

        let mut header = format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", algorithm={}, response=\"{}\"",
            username,
            self.realm,
            self.nonce,
            uri,
            algorithm.name(),
            response
        );
        if let Some(qop) = qop {
            header.push_str(&format!(", qop={}, nc={}, cnonce=\"{}\"", qop, NONCE_COUNT, cnonce));
        }
        if let Some(opaque) = &self.opaque {
            header.push_str(&format!(", opaque=\"{}\"", opaque));
        }

        Ok(header)
    }

    /// 服务器给出多个 qop 时选 `auth`，不支持 `auth-int`
    fn selected_qop(&self) -> Option<&'static str> {
        let qop = self.qop.as_deref()?;
        qop.split(',')
            .map(str::trim)
            .any(|q| q.eq_ignore_ascii_case("auth"))
            .then_some("auth")
    }
}

/// 解析 `key="value"` 与 `key=token` 形式的参数列表
fn parse_params(input: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    let mut rest = input.trim();

    while !rest.is_empty() {
        let Some(eq) = rest.find('=') else {
            break;
        };
        let key = rest[..eq].trim().trim_start_matches(',').trim().to_ascii_lowercase();
        rest = rest[eq + 1..].trim_start();

        let value = if let Some(quoted) = rest.strip_prefix('"') {
            match quoted.find('"') {
                Some(end) => {
                    let value = quoted[..end].to_string();
                    rest = &quoted[end + 1..];
                    value
                }
                None => {
                    let value = quoted.to_string();
                    rest = "";
                    value
                }
            }
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            let value = rest[..end].trim().to_string();
            rest = &rest[end..];
            value
        };

        rest = rest.trim_start().trim_start_matches(',').trim_start();
        if !key.is_empty() {
            fields.insert(key, value);
        }
    }

    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    const RFC_CHALLENGE: &str = r#"Digest realm="testrealm@host.com", qop="auth,auth-int", nonce="dcd98b7102dd2f0e8b11d0f600bfb0c093", opaque="5ccc069c403ebaf9f0171e9517f40e41""#;

    #[test]
    fn test_parse_challenge() {
        let challenge = DigestChallenge::parse(RFC_CHALLENGE).unwrap();
        assert_eq!(challenge.realm, "testrealm@host.com");
        assert_eq!(challenge.nonce, "dcd98b7102dd2f0e8b11d0f600bfb0c093");
        assert_eq!(challenge.qop.as_deref(), Some("auth,auth-int"));
        assert_eq!(challenge.opaque.as_deref(), Some("5ccc069c403ebaf9f0171e9517f40e41"));
        assert_eq!(challenge.algorithm, None);
    }

    #[test]
    fn test_parse_unquoted_tokens() {
        let challenge =
            DigestChallenge::parse(r#"Digest realm="antMiner Configuration", nonce="abc", qop=auth, algorithm=MD5"#)
                .unwrap();
        assert_eq!(challenge.realm, "antMiner Configuration");
        assert_eq!(challenge.qop.as_deref(), Some("auth"));
        assert_eq!(challenge.algorithm.as_deref(), Some("MD5"));
    }

    #[test]
    fn test_parse_missing_fields() {
        assert_eq!(
            DigestChallenge::parse(r#"Digest nonce="y""#),
            Err(DigestError::MissingField { field: "realm" })
        );
        assert_eq!(
            DigestChallenge::parse(r#"Digest realm="x""#),
            Err(DigestError::MissingField { field: "nonce" })
        );
        assert!(matches!(
            DigestChallenge::parse(r#"Basic realm="x""#),
            Err(DigestError::NotDigest { .. })
        ));
    }

    #[test]
    fn test_rfc2617_response() {
        let challenge = DigestChallenge::parse(RFC_CHALLENGE).unwrap();
        let header = challenge
            .authorization_with_cnonce("GET", "/dir/index.html", "Mufasa", "Circle Of Life", "0a4f113b")
            .unwrap();

        assert!(header.contains(r#"response="6629fae49393a05397450978507c4ef1""#));
        assert!(header.contains("qop=auth, nc=00000001, cnonce=\"0a4f113b\""));
        assert!(header.contains(r#"opaque="5ccc069c403ebaf9f0171e9517f40e41""#));
    }

    #[test]
    fn test_no_qop_response_is_reproducible() {
        let challenge = DigestChallenge::parse(r#"Digest realm="x", nonce="y""#).unwrap();
        let first = challenge
            .authorization_with_cnonce("GET", "/cgi-bin/get_miner_status.cgi", "root", "root", "c1")
            .unwrap();
        let second = challenge
            .authorization_with_cnonce("GET", "/cgi-bin/get_miner_status.cgi", "root", "root", "c2")
            .unwrap();

        // 没有 qop 时 cnonce 不参与计算
        assert_eq!(first, second);
        assert!(!first.contains("qop="));
        assert!(!first.contains("cnonce="));

        let ha1 = hex::encode(Md5::digest(b"root:x:root"));
        let ha2 = hex::encode(Md5::digest(b"GET:/cgi-bin/get_miner_status.cgi"));
        let expected = hex::encode(Md5::digest(format!("{}:y:{}", ha1, ha2).as_bytes()));
        assert!(first.contains(&format!("response=\"{}\"", expected)));
    }

    #[test]
    fn test_random_cnonce_differs() {
        let challenge = DigestChallenge::parse(r#"Digest realm="x", nonce="y", qop="auth""#).unwrap();
        let a = challenge.authorization("GET", "/", "root", "root").unwrap();
        let b = challenge.authorization("GET", "/", "root", "root").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_sha256_algorithm() {
        let challenge =
            DigestChallenge::parse(r#"Digest realm="x", nonce="y", algorithm="SHA-256""#).unwrap();
        let header = challenge
            .authorization_with_cnonce("GET", "/", "root", "root", "c")
            .unwrap();
        assert!(header.contains("algorithm=SHA-256"));

        let unsupported = DigestChallenge::parse(r#"Digest realm="x", nonce="y", algorithm="SHA-512-256""#)
            .unwrap()
            .authorization("GET", "/", "root", "root");
        assert!(matches!(unsupported, Err(DigestError::UnsupportedAlgorithm { .. })));
    }
}
