//! Shadowsocks inbound: terminates the AEAD stream cipher from a local
//! Shadowsocks-speaking application, recovers the SOCKS5-encoded target
//! address from the first decrypted chunk, then splices to a tunnel
//! stream. Cipher internals (AEAD construction, subkey derivation) are
//! consumed from `aes-gcm`/`chacha20poly1305`/`hkdf` as library primitives,
//! not respecified here.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm, Nonce};
use anyhow::{Context, Result};
use bytes::BytesMut;
use chacha20poly1305::ChaCha20Poly1305;
use hkdf::Hkdf;
use sha1::Sha1;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::InboundConfig;
use crate::transport::PinningTransport;
use crate::wire::SocksAddr;

const TAG_SIZE: usize = 16;
const SUBKEY_INFO: &[u8] = b"ss-subkey";
const MAX_CHUNK: usize = 0x3FFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CipherKind {
    Aes128Gcm,
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl CipherKind {
    fn parse(method: &str) -> Result<Self> {
        match method.to_ascii_lowercase().as_str() {
            "aes-128-gcm" => Ok(CipherKind::Aes128Gcm),
            "aes-256-gcm" => Ok(CipherKind::Aes256Gcm),
            "chacha20-ietf-poly1305" | "chacha20-poly1305" => Ok(CipherKind::ChaCha20Poly1305),
            other => anyhow::bail!("unsupported shadowsocks cipher: {other}"),
        }
    }

    fn key_size(&self) -> usize {
        match self {
            CipherKind::Aes128Gcm => 16,
            CipherKind::Aes256Gcm | CipherKind::ChaCha20Poly1305 => 32,
        }
    }
}

/// `method:password` parsed from an inbound's `auth` field.
struct Credential {
    cipher: CipherKind,
    key: Vec<u8>,
}

impl Credential {
    fn parse(auth: &str) -> Result<Self> {
        let (method, password) = auth
            .split_once(':')
            .context("auth must be `method:password`")?;
        let cipher = CipherKind::parse(method)?;
        let key = derive_master_key(password.as_bytes(), cipher.key_size());
        Ok(Self { cipher, key })
    }
}

/// Password-based key derivation compatible with the original Shadowsocks
/// `EVP_BytesToKey` scheme (repeated MD5 of `prev || password`).
fn derive_master_key(password: &[u8], key_size: usize) -> Vec<u8> {
    use md5::{Digest, Md5};
    let mut key = Vec::with_capacity(key_size);
    let mut prev: Vec<u8> = Vec::new();
    while key.len() < key_size {
        let mut hasher = Md5::new();
        hasher.update(&prev);
        hasher.update(password);
        prev = hasher.finalize().to_vec();
        key.extend_from_slice(&prev);
    }
    key.truncate(key_size);
    key
}

fn derive_subkey(master: &[u8], salt: &[u8], key_size: usize) -> Vec<u8> {
    let hk = Hkdf::<Sha1>::new(Some(salt), master);
    let mut subkey = vec![0u8; key_size];
    hk.expand(SUBKEY_INFO, &mut subkey)
        .expect("hkdf output length is valid for any supported cipher");
    subkey
}

fn increment_nonce(nonce: &mut [u8; 12]) {
    for byte in nonce.iter_mut() {
        *byte = byte.wrapping_add(1);
        if *byte != 0 {
            break;
        }
    }
}

fn aead_open(cipher: CipherKind, key: &[u8], nonce: &[u8; 12], data: &[u8]) -> Result<Vec<u8>> {
    let payload = Payload { msg: data, aad: b"" };
    let out = match cipher {
        CipherKind::Aes128Gcm => Aes128Gcm::new_from_slice(key)
            .map_err(|e| anyhow::anyhow!("bad key: {e}"))?
            .decrypt(Nonce::from_slice(nonce), payload),
        CipherKind::Aes256Gcm => Aes256Gcm::new_from_slice(key)
            .map_err(|e| anyhow::anyhow!("bad key: {e}"))?
            .decrypt(Nonce::from_slice(nonce), payload),
        CipherKind::ChaCha20Poly1305 => ChaCha20Poly1305::new_from_slice(key)
            .map_err(|e| anyhow::anyhow!("bad key: {e}"))?
            .decrypt(Nonce::from_slice(nonce), payload),
    };
    out.map_err(|_| anyhow::anyhow!("AEAD tag verification failed"))
}

fn aead_seal(cipher: CipherKind, key: &[u8], nonce: &[u8; 12], data: &[u8]) -> Result<Vec<u8>> {
    let payload = Payload { msg: data, aad: b"" };
    let out = match cipher {
        CipherKind::Aes128Gcm => Aes128Gcm::new_from_slice(key)
            .map_err(|e| anyhow::anyhow!("bad key: {e}"))?
            .encrypt(Nonce::from_slice(nonce), payload),
        CipherKind::Aes256Gcm => Aes256Gcm::new_from_slice(key)
            .map_err(|e| anyhow::anyhow!("bad key: {e}"))?
            .encrypt(Nonce::from_slice(nonce), payload),
        CipherKind::ChaCha20Poly1305 => ChaCha20Poly1305::new_from_slice(key)
            .map_err(|e| anyhow::anyhow!("bad key: {e}"))?
            .encrypt(Nonce::from_slice(nonce), payload),
    };
    out.map_err(|e| anyhow::anyhow!("AEAD seal failed: {e}"))
}

/// Wraps a plain TCP connection with the AEAD chunk framing: a random salt
/// up front, then a sequence of `encrypt(len) || encrypt(payload)` chunks,
/// each independently authenticated and nonce-incremented.
struct CipherStream {
    inner: TcpStream,
    cipher: CipherKind,
    master_key: Vec<u8>,
    read_key: Option<Vec<u8>>,
    read_nonce: [u8; 12],
    read_raw: BytesMut,
    read_plain: BytesMut,
    write_key: Vec<u8>,
    write_nonce: [u8; 12],
}

impl CipherStream {
    /// Reads the client-chosen salt off the wire and derives the read-side
    /// subkey; generates our own salt and sends it for the write side.
    async fn handshake(mut inner: TcpStream, credential: &Credential) -> Result<Self> {
        let key_size = credential.cipher.key_size();

        let mut client_salt = vec![0u8; key_size];
        inner.read_exact(&mut client_salt).await?;
        let read_key = derive_subkey(&credential.key, &client_salt, key_size);

        let mut server_salt = vec![0u8; key_size];
        use rand::RngCore;
        rand::thread_rng().fill_bytes(&mut server_salt);
        inner.write_all(&server_salt).await?;
        let write_key = derive_subkey(&credential.key, &server_salt, key_size);

        Ok(Self {
            inner,
            cipher: credential.cipher,
            master_key: credential.key.clone(),
            read_key: Some(read_key),
            read_nonce: [0u8; 12],
            read_raw: BytesMut::with_capacity(4096),
            read_plain: BytesMut::new(),
            write_key,
            write_nonce: [0u8; 12],
        })
    }

    /// Reads and decrypts exactly one `(length, payload)` chunk pair,
    /// blocking on more I/O as needed. Used only during the handshake to
    /// recover the plaintext target address before handing the stream off
    /// to the generic splice loop.
    async fn read_chunk(&mut self) -> Result<Vec<u8>> {
        loop {
            if let Some(chunk) = self.try_decode_one()? {
                return Ok(chunk);
            }
            let mut buf = [0u8; 4096];
            let n = self.inner.read(&mut buf).await?;
            if n == 0 {
                anyhow::bail!("connection closed during shadowsocks handshake");
            }
            self.read_raw.extend_from_slice(&buf[..n]);
        }
    }

    fn try_decode_one(&mut self) -> Result<Option<Vec<u8>>> {
        let min_len = 2 + TAG_SIZE;
        if self.read_raw.len() < min_len {
            return Ok(None);
        }
        let key = self.read_key.clone().context("decryption key not set")?;
        let len_bytes = aead_open(self.cipher, &key, &self.read_nonce, &self.read_raw[..min_len])?;
        let payload_len = (u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize) & MAX_CHUNK;
        let total = min_len + payload_len + TAG_SIZE;
        if self.read_raw.len() < total {
            return Ok(None);
        }
        increment_nonce(&mut self.read_nonce);
        let _ = self.read_raw.split_to(min_len);
        let encrypted_payload = self.read_raw.split_to(payload_len + TAG_SIZE);
        let payload = aead_open(self.cipher, &key, &self.read_nonce, &encrypted_payload)?;
        increment_nonce(&mut self.read_nonce);
        Ok(Some(payload))
    }

    fn encrypt_chunk(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let len_bytes = ((data.len() as u16) & MAX_CHUNK as u16).to_be_bytes();
        let enc_len = aead_seal(self.cipher, &self.write_key, &self.write_nonce, &len_bytes)?;
        increment_nonce(&mut self.write_nonce);
        let enc_payload = aead_seal(self.cipher, &self.write_key, &self.write_nonce, data)?;
        increment_nonce(&mut self.write_nonce);
        let mut out = Vec::with_capacity(enc_len.len() + enc_payload.len());
        out.extend_from_slice(&enc_len);
        out.extend_from_slice(&enc_payload);
        Ok(out)
    }
}

impl AsyncRead for CipherStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.read_plain.is_empty() {
                let n = buf.remaining().min(self.read_plain.len());
                let chunk = self.read_plain.split_to(n);
                buf.put_slice(&chunk);
                return Poll::Ready(Ok(()));
            }
            match self.try_decode_one() {
                Ok(Some(payload)) => {
                    self.read_plain = BytesMut::from(&payload[..]);
                    continue;
                }
                Ok(None) => {}
                Err(e) => return Poll::Ready(Err(io::Error::new(io::ErrorKind::InvalidData, e))),
            }
            let mut raw = [0u8; 4096];
            let mut inner_buf = ReadBuf::new(&mut raw);
            match Pin::new(&mut self.inner).poll_read(cx, &mut inner_buf) {
                Poll::Ready(Ok(())) => {
                    let filled = inner_buf.filled();
                    if filled.is_empty() {
                        return Poll::Ready(Ok(()));
                    }
                    self.read_raw.extend_from_slice(filled);
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for CipherStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let n = data.len().min(MAX_CHUNK);
        let chunk = match self.encrypt_chunk(&data[..n]) {
            Ok(c) => c,
            Err(e) => return Poll::Ready(Err(io::Error::new(io::ErrorKind::InvalidData, e))),
        };
        match Pin::new(&mut self.inner).poll_write(cx, &chunk) {
            Poll::Ready(Ok(_)) => Poll::Ready(Ok(n)),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

pub async fn run(
    inbound: InboundConfig,
    transport: Arc<PinningTransport>,
    ready: Option<watch::Sender<bool>>,
) -> Result<()> {
    let credential = Arc::new(Credential::parse(
        inbound
            .auth
            .as_deref()
            .context("shadowsocks inbound requires an `auth = \"method:password\"` entry")?,
    )?);

    let listener = TcpListener::bind(&inbound.local_addr)
        .await
        .with_context(|| format!("failed to bind shadowsocks inbound to {}", inbound.local_addr))?;
    info!(bind = %inbound.local_addr, "shadowsocks inbound listening");
    if let Some(tx) = ready {
        let _ = tx.send(true);
    }

    loop {
        let (stream, client_addr) = listener.accept().await?;
        let transport = transport.clone();
        let credential = credential.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_client(stream, client_addr, transport, credential).await {
                debug!(client = %client_addr, error = %e, "shadowsocks client error");
            }
        });
    }
}

async fn handle_client(
    stream: TcpStream,
    client_addr: SocketAddr,
    transport: Arc<PinningTransport>,
    credential: Arc<Credential>,
) -> Result<()> {
    let mut cipher_stream = CipherStream::handshake(stream, &credential).await?;
    let header = cipher_stream.read_chunk().await?;
    let (addr, port, _) = SocksAddr::decode(&header).context("invalid target address in shadowsocks header")?;
    let target = format!("{}:{}", addr.to_host_string(), port);

    let tunnel_stream = match transport.open_stream("shadowsocks", Some(&target)).await {
        Ok(s) => s,
        Err(e) => {
            warn!(target = %target, error = %e, "failed to open shadowsocks tunnel stream");
            return Err(e);
        }
    };
    debug!(client = %client_addr, target = %target, "shadowsocks tunnel established");

    let (mut local_read, mut local_write) = tokio::io::split(cipher_stream);
    let (mut tunnel_read, mut tunnel_write) = tokio::io::split(tunnel_stream);

    let up = async {
        let _ = tokio::io::copy(&mut local_read, &mut tunnel_write).await;
        let _ = tunnel_write.shutdown().await;
    };
    let down = async {
        let _ = tokio::io::copy(&mut tunnel_read, &mut local_write).await;
        let _ = local_write.shutdown().await;
    };
    tokio::join!(up, down);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_ciphers() {
        assert_eq!(CipherKind::parse("aes-256-gcm").unwrap(), CipherKind::Aes256Gcm);
        assert_eq!(
            CipherKind::parse("chacha20-ietf-poly1305").unwrap(),
            CipherKind::ChaCha20Poly1305
        );
        assert!(CipherKind::parse("rc4-md5").is_err());
    }

    #[test]
    fn credential_requires_colon() {
        assert!(Credential::parse("aes-256-gcm-nopassword").is_err());
    }

    #[test]
    fn master_key_has_requested_length() {
        let key = derive_master_key(b"hunter2", 32);
        assert_eq!(key.len(), 32);
    }

    #[test]
    fn aead_roundtrips() {
        let key = derive_master_key(b"hunter2", 32);
        let salt = [7u8; 32];
        let subkey = derive_subkey(&key, &salt, 32);
        let nonce = [0u8; 12];
        let ciphertext = aead_seal(CipherKind::ChaCha20Poly1305, &subkey, &nonce, b"hello").unwrap();
        let plain = aead_open(CipherKind::ChaCha20Poly1305, &subkey, &nonce, &ciphertext).unwrap();
        assert_eq!(plain, b"hello");
    }
}
