//! Encode/decode helpers for the two wire unions.
//!
//! The binary codec itself is treated as a provided primitive (see the
//! crate's module doc): frames are BARE-encoded tagged unions, one per
//! WebSocket binary message, with the WebSocket frame boundary doing the
//! length-prefixing.

use anyhow::Context;

use crate::{ToClient, ToServer};

pub fn encode_to_server(msg: &ToServer) -> anyhow::Result<Vec<u8>> {
	serde_bare::to_vec(msg).context("failed to encode ToServer message")
}

pub fn decode_to_server(buf: &[u8]) -> anyhow::Result<ToServer> {
	serde_bare::from_slice(buf).context("failed to decode ToServer message")
}

pub fn encode_to_client(msg: &ToClient) -> anyhow::Result<Vec<u8>> {
	serde_bare::to_vec(msg).context("failed to encode ToClient message")
}

pub fn decode_to_client(buf: &[u8]) -> anyhow::Result<ToClient> {
	serde_bare::from_slice(buf).context("failed to decode ToClient message")
}
