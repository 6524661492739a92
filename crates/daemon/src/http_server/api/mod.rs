pub mod ciphertext;
pub mod diagnostics;
pub mod objects;
