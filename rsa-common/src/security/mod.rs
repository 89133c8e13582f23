//! Security primitives for credential storage.

pub mod cipher;

pub use cipher::{generate_key, generate_key_base64, load_or_create_key, CredentialCipher};
