pub mod signature;

pub use signature::{
    SignatureError, SignatureHeader, generate_webhook_signature, verify_webhook_signature,
};
