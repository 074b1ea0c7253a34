//! Security helpers for the connector layer: webhook signature verification
//! and signed, single-use OAuth state tokens.

pub mod nonce;
pub mod signature;
pub mod state;

pub use nonce::{InMemoryNonceStore, NonceStore, SharedNonceStore};
pub use signature::{SIGNATURE_PREFIX, sign_body, verify_signature};
pub use state::{STATE_TTL, StateClaims, sign_state, verify_state};
