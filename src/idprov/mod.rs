//! Label generation for new claims.
//!
//! Providers hand out candidate labels without any uniqueness guarantee;
//! collision handling is the store's job. Several providers can be active
//! at once, in which case the store rotates among them.

mod random;
mod wordlist;

pub use random::RandomId;
pub use wordlist::WordlistId;

use thiserror::Error;

use crate::config::ProviderConfig;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("embedded wordlist is empty")]
    EmptyWordlist,

    #[error("requested id length {0} exceeds the generated id")]
    IdTooLong(usize),
}

/// A source of candidate labels.
pub trait IdProvider: Send + Sync {
    /// Produce one lowercase ASCII label candidate.
    fn generate(&self) -> Result<String, ProviderError>;
}

/// Build the provider set selected by the configuration, in a fixed order
/// so rotation is deterministic for a given config.
pub fn from_config(config: &ProviderConfig) -> Result<Vec<Box<dyn IdProvider>>, ProviderError> {
    let mut providers: Vec<Box<dyn IdProvider>> = Vec::new();
    if config.random.enable {
        providers.push(Box::new(RandomId::new(config.random.id_len)?));
    }
    if config.wordlist.enable {
        providers.push(Box::new(WordlistId::new()?));
    }
    Ok(providers)
}
