//! PEM decoding for KMS client certificates, keys and CA bundles.
//!
//! A `tlsCertificateKeyFile` holds the client certificate chain and its private
//! key in one file, so blocks are decoded once and then split by label
//! (RFC 7468).

use base64::prelude::*;
use pkcs8::EncryptedPrivateKeyInfo;
use rustls::pki_types::{
    CertificateDer, PrivateKeyDer, PrivatePkcs1KeyDer, PrivatePkcs8KeyDer, PrivateSec1KeyDer,
};

/// PEM decoding error.
#[derive(Debug, thiserror::Error)]
pub enum PemError {
    #[error("invalid PEM format: {0}")]
    InvalidFormat(String),
    #[error("base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),
    #[error("no PEM blocks found")]
    NoPemBlocks,
    #[error("no {0} found")]
    Missing(&'static str),
    #[error("private key is encrypted but no passphrase was configured")]
    PassphraseRequired,
    #[error("failed to decrypt private key: {0}")]
    Decrypt(String),
    #[error("legacy PEM encryption is unsupported, convert the key to PKCS#8")]
    LegacyEncryption,
}

/// A decoded PEM block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PemBlock {
    /// Label from the BEGIN line, e.g. `CERTIFICATE` or `PRIVATE KEY`.
    pub label: String,
    /// DER contents.
    pub contents: Vec<u8>,
    /// Set when the block carried a `Proc-Type: 4,ENCRYPTED` header.
    pub legacy_encrypted: bool,
}

/// Decodes every PEM block in `input`, ignoring text between blocks.
pub fn parse_pem(input: &[u8]) -> Result<Vec<PemBlock>, PemError> {
    let text = std::str::from_utf8(input)
        .map_err(|_| PemError::InvalidFormat("not valid UTF-8".to_string()))?;

    let mut blocks = Vec::new();
    let mut current: Option<(String, String, bool)> = None;

    for line in text.lines().map(str::trim) {
        if let Some(label) = boundary(line, "-----BEGIN ") {
            if let Some((open, ..)) = &current {
                return Err(PemError::InvalidFormat(format!(
                    "BEGIN {label} inside unterminated {open} block"
                )));
            }
            current = Some((label.to_string(), String::new(), false));
            continue;
        }

        if let Some(label) = boundary(line, "-----END ") {
            let Some((open, body, legacy_encrypted)) = current.take() else {
                return Err(PemError::InvalidFormat(format!("END {label} without BEGIN")));
            };
            if open != label {
                return Err(PemError::InvalidFormat(format!(
                    "mismatched PEM markers: BEGIN {open} but END {label}"
                )));
            }
            let contents = BASE64_STANDARD.decode(body.as_bytes())?;
            blocks.push(PemBlock {
                label: open,
                contents,
                legacy_encrypted,
            });
            continue;
        }

        // RFC 1421 headers inside a block are not part of the body.
        if let Some((_, body, legacy_encrypted)) = current.as_mut() {
            if let Some(value) = line.strip_prefix("Proc-Type:") {
                *legacy_encrypted |= value.trim().ends_with("ENCRYPTED");
            } else if !line.is_empty() && !line.contains(':') {
                body.push_str(line);
            }
        }
    }

    if let Some((open, ..)) = current {
        return Err(PemError::InvalidFormat(format!("unterminated {open} block")));
    }
    if blocks.is_empty() {
        return Err(PemError::NoPemBlocks);
    }

    Ok(blocks)
}

fn boundary<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    line.strip_prefix(prefix)?.strip_suffix("-----")
}

/// Extracts every `CERTIFICATE` block.
pub fn certificates(blocks: &[PemBlock]) -> Result<Vec<CertificateDer<'static>>, PemError> {
    let certs: Vec<CertificateDer<'static>> = blocks
        .iter()
        .filter(|block| block.label == "CERTIFICATE")
        .map(|block| CertificateDer::from(block.contents.clone()))
        .collect();

    if certs.is_empty() {
        return Err(PemError::Missing("certificate"));
    }
    Ok(certs)
}

/// Extracts the first private key, decrypting PKCS#8 keys with `passphrase`.
pub fn private_key(
    blocks: &[PemBlock],
    passphrase: Option<&str>,
) -> Result<PrivateKeyDer<'static>, PemError> {
    for block in blocks {
        if block.legacy_encrypted {
            return Err(PemError::LegacyEncryption);
        }
        let key = match block.label.as_str() {
            "PRIVATE KEY" => PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(block.contents.clone())),
            "RSA PRIVATE KEY" => {
                PrivateKeyDer::Pkcs1(PrivatePkcs1KeyDer::from(block.contents.clone()))
            }
            "EC PRIVATE KEY" => {
                PrivateKeyDer::Sec1(PrivateSec1KeyDer::from(block.contents.clone()))
            }
            "ENCRYPTED PRIVATE KEY" => {
                let passphrase = passphrase.ok_or(PemError::PassphraseRequired)?;
                decrypt_pkcs8(&block.contents, passphrase)?
            }
            _ => continue,
        };
        return Ok(key);
    }

    Err(PemError::Missing("private key"))
}

fn decrypt_pkcs8(der: &[u8], passphrase: &str) -> Result<PrivateKeyDer<'static>, PemError> {
    let info =
        EncryptedPrivateKeyInfo::try_from(der).map_err(|e| PemError::Decrypt(e.to_string()))?;
    let document = info
        .decrypt(passphrase)
        .map_err(|e| PemError::Decrypt(e.to_string()))?;
    Ok(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        document.as_bytes().to_vec(),
    )))
}
