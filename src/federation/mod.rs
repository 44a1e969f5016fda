//! ActivityPub federation module
//!
//! Handles:
//! - Inbound activity processing (inbox state machine)
//! - Outbound activity delivery (fan-out, retry)
//! - HTTP Signatures
//! - WebFinger resolution and actor fetching
//! - Actor signing keys

mod delivery;
mod inbox;
mod keys;
mod resolver;
mod signature;
mod verify;

pub use delivery::{DeliveryDispatcher, builder, collapse_recipient_inboxes, run_delivery_worker};
pub use inbox::{InboundActivity, InboxProcessor, ParsedActivity, ProcessOutcome, UndoObject};
pub use keys::{KeyPairPem, generate_keypair};
pub use resolver::{
    ActorResolver, ParsedActor, WebFingerLink, WebFingerResponse, parse_actor_document,
    validate_remote_url,
};
pub use signature::{
    ParsedSignature, SignatureHeaders, extract_signature_key_id, generate_digest,
    key_id_matches_actor, parse_signature_header, sign_request, verify_signature,
};
pub use verify::verify_inbound;
