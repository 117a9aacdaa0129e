//! Identifier generation
//!
//! Socket ids and RPC call ids are opaque unique tokens; auth tokens are
//! random url-safe strings that are never derived from anything guessable.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;

/// Fresh id for a socket session or an RPC call
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Random token a peer issues to authenticate inbound calls
pub fn generate_auth_token() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
