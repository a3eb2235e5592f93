use rand::rngs::OsRng;
use rand::RngCore;

/// Generate `n` random bytes from the OS CSPRNG, hex encoded (2n characters)
pub fn generate_hex(n: usize) -> String {
    let mut bytes = vec![0u8; n];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Generate a token id (16 bytes, hex encoded = 32 characters)
pub fn generate_token_id() -> String {
    generate_hex(16)
}

/// Generate an email verification token (32 bytes, hex encoded = 64 characters)
pub fn generate_email_token() -> String {
    generate_hex(32)
}
