pub mod frame;
pub mod messages;
pub mod registry;

// Re-export the envelope plumbing the broker session lives on.
pub use registry::{decode_envelope, encode_envelope, Envelope, OpenApiMessage};
