use rand::Rng;

use super::{IdProvider, ProviderError};

/// Exposes the first `id_len` characters of a random hex id.
pub struct RandomId {
    id_len: usize,
}

impl RandomId {
    pub fn new(id_len: usize) -> Result<Self, ProviderError> {
        if id_len == 0 || id_len > 32 {
            return Err(ProviderError::IdTooLong(id_len));
        }
        Ok(Self { id_len })
    }
}

impl IdProvider for RandomId {
    fn generate(&self) -> Result<String, ProviderError> {
        let bytes: [u8; 16] = rand::thread_rng().gen();
        let mut id = hex::encode(bytes);
        id.truncate(self.id_len);
        Ok(id)
    }
}
