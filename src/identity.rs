//! Ed25519 server identity: keypair load/generate, self-signed certificate
//! construction, and the pinned client-certificate verifier used when
//! `tls_mode = "mutual"`.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use base64::Engine;
use ed25519_dalek::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_ED25519};
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer, UnixTime};

const SUBJECT_NAME: &str = "Phoenix Secure Tunnel";
const CERT_VALIDITY_YEARS: i64 = 100;

/// Load an Ed25519 signing key from a PKCS#8 PEM file, generating and
/// persisting a new one if `path` doesn't exist yet.
pub fn load_or_generate_keypair(path: &Path) -> Result<SigningKey> {
    if path.exists() {
        let der = std::fs::read(path)
            .with_context(|| format!("failed to read private key {:?}", path))?;
        let key = SigningKey::from_pkcs8_der(&der)
            .map_err(|e| anyhow::anyhow!("invalid private key {:?}: {e}", path))?;
        Ok(key)
    } else {
        let key = generate_keypair();
        persist_keypair(&key, path)?;
        Ok(key)
    }
}

pub fn generate_keypair() -> SigningKey {
    SigningKey::generate(&mut OsRng)
}

#[cfg(unix)]
fn persist_keypair(key: &SigningKey, path: &Path) -> Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;
    let der = key
        .to_pkcs8_der()
        .context("failed to encode private key")?;
    let mut opts = std::fs::OpenOptions::new();
    opts.write(true).create(true).truncate(true).mode(0o600);
    let mut f = opts
        .open(path)
        .with_context(|| format!("failed to create private key file {:?}", path))?;
    f.write_all(der.as_bytes())?;
    Ok(())
}

#[cfg(not(unix))]
fn persist_keypair(key: &SigningKey, path: &Path) -> Result<()> {
    let der = key
        .to_pkcs8_der()
        .context("failed to encode private key")?;
    std::fs::write(path, der.as_bytes())
        .with_context(|| format!("failed to create private key file {:?}", path))?;
    Ok(())
}

/// Base64 (standard) encode a raw Ed25519 public key, the form exchanged
/// out of band as `server_public_key` / `authorized_clients` entries.
pub fn encode_public_key(key: &ed25519_dalek::VerifyingKey) -> String {
    base64::engine::general_purpose::STANDARD.encode(key.as_bytes())
}

pub fn decode_public_key(s: &str) -> Result<ed25519_dalek::VerifyingKey> {
    let raw = base64::engine::general_purpose::STANDARD
        .decode(s.trim())
        .context("public key is not valid base64")?;
    let bytes: [u8; 32] = raw
        .as_slice()
        .try_into()
        .context("public key must be 32 bytes")?;
    ed25519_dalek::VerifyingKey::from_bytes(&bytes).context("invalid Ed25519 public key")
}

/// Build a self-signed Ed25519 certificate + key pair suitable for the
/// `rustls::ServerConfig` / `rustls::ClientConfig` builders.
pub fn self_signed_cert(
    signing_key: &SigningKey,
) -> Result<(CertificateDer<'static>, PrivatePkcs8KeyDer<'static>)> {
    let pkcs8 = signing_key
        .to_pkcs8_der()
        .context("failed to DER-encode signing key")?;
    let key_pair =
        KeyPair::from_der_and_sign_algo(pkcs8.as_bytes(), &PKCS_ED25519).context("rcgen key")?;

    let mut params = CertificateParams::new(vec![SUBJECT_NAME.to_string()])?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, SUBJECT_NAME);
    params.distinguished_name = dn;
    params.key_usages = vec![
        rcgen::KeyUsagePurpose::DigitalSignature,
        rcgen::KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![
        rcgen::ExtendedKeyUsagePurpose::ServerAuth,
        rcgen::ExtendedKeyUsagePurpose::ClientAuth,
    ];
    let now = time::OffsetDateTime::now_utc();
    params.not_before = now - time::Duration::days(1);
    params.not_after = now + time::Duration::days(365 * CERT_VALIDITY_YEARS);

    let cert = params.self_signed(&key_pair).context("self-sign cert")?;
    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivatePkcs8KeyDer::from(pkcs8.as_bytes().to_vec());
    Ok((cert_der, key_der))
}

/// Client-certificate verifier that accepts a connecting client iff the
/// raw Ed25519 public key embedded in its self-signed leaf certificate
/// matches one of `authorized`. Used only in `tls_mode = "mutual"`.
#[derive(Debug)]
pub struct PinnedClientVerifier {
    authorized: Vec<[u8; 32]>,
}

impl PinnedClientVerifier {
    pub fn new(authorized: Vec<ed25519_dalek::VerifyingKey>) -> Arc<Self> {
        Arc::new(Self {
            authorized: authorized.iter().map(|k| *k.as_bytes()).collect(),
        })
    }

    fn matches(&self, cert: &CertificateDer<'_>) -> bool {
        match extract_ed25519_pubkey(cert) {
            Some(pk) => self
                .authorized
                .iter()
                .any(|known| constant_time_eq(known, &pk)),
            None => false,
        }
    }
}

impl rustls::server::danger::ClientCertVerifier for PinnedClientVerifier {
    fn root_hint_subjects(&self) -> &[rustls::DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<rustls::server::danger::ClientCertVerified, rustls::Error> {
        if self.matches(end_entity) {
            Ok(rustls::server::danger::ClientCertVerified::assertion())
        } else {
            Err(rustls::Error::General(
                "client public key is not authorized".into(),
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![rustls::SignatureScheme::ED25519]
    }
}

/// Extract the raw 32-byte Ed25519 public key from a DER certificate's
/// SubjectPublicKeyInfo. rcgen's Ed25519 leaf stores it as the final 32
/// bytes of the SPKI `BIT STRING`, which is how we get it back out without
/// pulling in a full X.509 parser.
pub fn extract_ed25519_pubkey(cert: &CertificateDer<'_>) -> Option<[u8; 32]> {
    let der = cert.as_ref();
    if der.len() < 32 {
        return None;
    }
    let tail = &der[der.len() - 32..];
    tail.try_into().ok()
}

pub fn constant_time_eq(a: &[u8; 32], b: &[u8; 32]) -> bool {
    let mut diff = 0u8;
    for i in 0..32 {
        diff |= a[i] ^ b[i];
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pubkey_roundtrip() {
        let key = generate_keypair();
        let encoded = encode_public_key(&key.verifying_key());
        let decoded = decode_public_key(&encoded).unwrap();
        assert_eq!(key.verifying_key(), decoded);
    }

    #[test]
    fn constant_time_eq_detects_mismatch() {
        let a = [1u8; 32];
        let mut b = [1u8; 32];
        assert!(constant_time_eq(&a, &b));
        b[31] = 2;
        assert!(!constant_time_eq(&a, &b));
    }

    #[test]
    fn self_signed_cert_embeds_recoverable_pubkey() {
        let key = generate_keypair();
        let (cert, _) = self_signed_cert(&key).unwrap();
        let extracted = extract_ed25519_pubkey(&cert).unwrap();
        assert_eq!(extracted, *key.verifying_key().as_bytes());
    }
}
