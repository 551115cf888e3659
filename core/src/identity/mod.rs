// Identity: the keys a listener uses to answer join challenges

mod keys;

pub use keys::{peer_id_from_public_key, IdentityKeys};
