//! Action links: signed, self-describing direct-fetch requests.
//!
//! `action_link=yes` makes the output a URL instead of a tag:
//!
//! ```text
//! <endpoint>?packet=<hex(JSON(original params))>&sig=<hex(HMAC-SHA256(secret, packet))>
//! ```
//!
//! The packet carries the parameters exactly as the caller supplied them,
//! so replaying it yields the same cache key as the original request.
//! [`serve_packet`] verifies the signature, runs the pipeline in direct-fetch
//! mode, and answers with image bytes or a bare status code.
//!
//! | Failure | Status |
//! |---|---|
//! | bad packet, bad signature, invalid parameter | 400 |
//! | no source could be loaded | 404 |
//! | anything else | 500 |
//!
//! Error responses never carry a body.

use crate::context::{Flag, ProcessingContext};
use crate::markup::Rendered;
use crate::params::TagParams;
use crate::pipeline::{Pipeline, PipelineError};
use crate::services::ServiceBundle;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum PacketError {
    #[error("Action links need a configured secret")]
    NoSecret,
    #[error("Packet is not valid hex: {0}")]
    Encoding(#[from] hex::FromHexError),
    #[error("Packet is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Packet signature does not match")]
    BadSignature,
    #[error("Secret cannot be used as an HMAC key")]
    UnusableSecret,
}

type HmacSha256 = Hmac<Sha256>;

fn mac(secret: &str, packet: &str) -> Result<HmacSha256, PacketError> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| PacketError::UnusableSecret)?;
    mac.update(packet.as_bytes());
    Ok(mac)
}

/// Hex HMAC-SHA256 of a packet.
pub fn sign_packet(packet: &str, secret: &str) -> Result<String, PacketError> {
    Ok(hex::encode(mac(secret, packet)?.finalize().into_bytes()))
}

/// Encode and sign parameters. Returns `(packet, signature)`.
pub fn encode_packet(params: &TagParams, secret: &str) -> Result<(String, String), PacketError> {
    if secret.is_empty() {
        return Err(PacketError::NoSecret);
    }
    let packet = hex::encode(serde_json::to_vec(params)?);
    let sig = sign_packet(&packet, secret)?;
    Ok((packet, sig))
}

/// Verify and decode a packet.
pub fn decode_packet(packet: &str, sig: &str, secret: &str) -> Result<TagParams, PacketError> {
    if secret.is_empty() {
        return Err(PacketError::NoSecret);
    }
    let given = hex::decode(sig.trim())?;
    mac(secret, packet)?
        .verify_slice(&given)
        .map_err(|_| PacketError::BadSignature)?;
    let json = hex::decode(packet.trim())?;
    Ok(serde_json::from_slice(&json)?)
}

/// The action-link URL for a request.
pub fn action_url(endpoint: &str, params: &TagParams, secret: &str) -> Result<String, PacketError> {
    let (packet, sig) = encode_packet(params, secret)?;
    let separator = if endpoint.contains('?') { '&' } else { '?' };
    Ok(format!("{endpoint}{separator}packet={packet}&sig={sig}"))
}

/// Response to a direct fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectResponse {
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
}

impl DirectResponse {
    fn failure(status: u16) -> Self {
        Self {
            status,
            content_type: String::new(),
            body: Vec::new(),
        }
    }
}

/// Verify a packet and serve the image it describes.
pub fn serve_packet(services: &Arc<ServiceBundle>, packet: &str, sig: &str) -> DirectResponse {
    match fetch_packet(services, packet, sig) {
        Ok(response) => response,
        Err(e) => {
            let status = e.http_status();
            warn!(status, error = %e, "direct fetch failed");
            DirectResponse::failure(status)
        }
    }
}

fn fetch_packet(
    services: &Arc<ServiceBundle>,
    packet: &str,
    sig: &str,
) -> Result<DirectResponse, PipelineError> {
    let mut params = decode_packet(packet, sig, &services.settings.action.secret)?;
    params.remove("action_link");
    let mut ctx = ProcessingContext::new(params);
    ctx.set_flag(Flag::DirectFetch);
    Pipeline::standard(services.clone()).run(&mut ctx)?;
    match ctx.output.take() {
        Some(Rendered::Bytes { content_type, body }) => {
            info!(bytes = body.len(), content_type = %content_type, "direct fetch served");
            Ok(DirectResponse {
                status: 200,
                content_type,
                body,
            })
        }
        _ => Err(PipelineError::Invariant("direct fetch produced no bytes".into())),
    }
}
