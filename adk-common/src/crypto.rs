// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Crypto helpers: HMAC-SHA256 (batch and streaming), base64 and hex
//! encoding, the device-id derivation, and UUID formatting.

use sha2::{Digest, Sha256};
use uuid::Uuid;

pub const SHA256_SIZE: usize = 32;
const SHA256_BLOCK: usize = 64;

/// Default device signature key, base64 encoded. Hosts that provision a
/// per-platform key override this at build time.
const DEVICE_SIGNATURE_KEY: &str =
    "Dje2/XcY9UQTheBdIV5W1o47WcWLLPBf9pzGk6abKT3qLZYhdiocVxbGjQz8WDpeqqP4iwzCi7yuXKB4Fmkw8w==";

/// One-shot HMAC-SHA256 (RFC 2104).
pub fn hmac_sha256(key: &[u8], input: &[u8]) -> [u8; SHA256_SIZE] {
    let mut ctx = HmacSha256::new(key);
    ctx.update(input);
    ctx.finish()
}

/// Streaming HMAC-SHA256 context.
pub struct HmacSha256 {
    inner: Sha256,
    opad: [u8; SHA256_BLOCK],
}

impl HmacSha256 {
    pub fn new(key: &[u8]) -> Self {
        let mut block_key = [0u8; SHA256_BLOCK];
        if key.len() > SHA256_BLOCK {
            let digest = Sha256::digest(key);
            block_key[..SHA256_SIZE].copy_from_slice(&digest);
        } else {
            block_key[..key.len()].copy_from_slice(key);
        }

        let mut ipad = [0u8; SHA256_BLOCK];
        let mut opad = [0u8; SHA256_BLOCK];
        for i in 0..SHA256_BLOCK {
            ipad[i] = block_key[i] ^ 0x36;
            opad[i] = block_key[i] ^ 0x5c;
        }

        let mut inner = Sha256::new();
        inner.update(ipad);
        Self { inner, opad }
    }

    pub fn update(&mut self, input: &[u8]) {
        self.inner.update(input);
    }

    pub fn finish(self) -> [u8; SHA256_SIZE] {
        let inner_digest = self.inner.finalize();
        let mut outer = Sha256::new();
        outer.update(self.opad);
        outer.update(inner_digest);
        outer.finalize().into()
    }
}

/// Standard-alphabet base64 encode.
pub fn encode_base64(input: &[u8]) -> String {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD.encode(input)
}

/// Standard-alphabet base64 decode.
pub fn decode_base64(input: &str) -> Result<Vec<u8>, base64::DecodeError> {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD.decode(input)
}

/// Lowercase hex encode.
pub fn encode_hex(input: &[u8]) -> String {
    hex::encode(input)
}

/// Stable device identifier: HMAC-SHA256 of `buffer` under the decoded
/// device signature key, hex encoded.
pub fn device_id_hmac_hex(buffer: &[u8]) -> String {
    let key = decode_base64(DEVICE_SIGNATURE_KEY).unwrap_or_else(|err| {
        tracing::error!(%err, "device signature key is not valid base64");
        Vec::new()
    });
    encode_hex(&hmac_sha256(&key, buffer))
}

/// Fresh random UUID.
pub fn generate_uuid() -> Uuid {
    Uuid::new_v4()
}

/// Canonical hyphenated form, 36 lowercase characters.
pub fn uuid_string(uuid: &Uuid) -> String {
    uuid.hyphenated().to_string()
}

/// 32 lowercase hex characters, no hyphens. The reporter's event-id form.
pub fn uuid_simple_string(uuid: &Uuid) -> String {
    uuid.simple().to_string()
}
