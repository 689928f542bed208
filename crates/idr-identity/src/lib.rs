//! idr-identity
//!
//! Pure identity-key derivation. Nothing here performs IO.
//!
//! - [`build_keys`]: observation -> deduplicated identity keys
//! - [`prioritize_keys`]: highest-confidence first, stable within a kind
//! - [`key_path`]: bit-exact storage path for a key
//! - [`hash_identity_metadata`] / [`build_record`] / [`keys_from_record`]:
//!   canonical record content derived from the same identity fields

mod keys;
mod path;
mod record;

pub use keys::{build_keys, normalize_ip, parse_mac_list, prioritize_keys, priority_rank};
pub use path::{key_path, kind_segment, sanitize_segment, DEFAULT_NAMESPACE};
pub use record::{build_record, hash_identity_metadata, keys_from_record};
