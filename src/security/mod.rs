pub mod encryption;

pub use encryption::CredentialCipher;
