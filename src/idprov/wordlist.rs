use rand::Rng;

use super::{IdProvider, ProviderError};

const WORDS: &str = include_str!("words.txt");

/// Picks a uniformly random word from the embedded wordlist.
pub struct WordlistId {
    words: Vec<&'static str>,
}

impl WordlistId {
    pub fn new() -> Result<Self, ProviderError> {
        let words: Vec<&'static str> = WORDS.lines().filter(|w| !w.is_empty()).collect();
        if words.is_empty() {
            return Err(ProviderError::EmptyWordlist);
        }
        Ok(Self { words })
    }
}

impl IdProvider for WordlistId {
    fn generate(&self) -> Result<String, ProviderError> {
        let index = rand::thread_rng().gen_range(0..self.words.len());
        Ok(self.words[index].to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wordlist_is_dns_safe() {
        let provider = WordlistId::new().unwrap();
        for word in &provider.words {
            assert!(!word.is_empty());
            assert!(word.len() <= 63, "label too long: {word}");
            assert!(word.chars().all(|c| c.is_ascii_lowercase()), "bad label: {word}");
        }
    }

    #[test]
    fn generates_words_from_the_list() {
        let provider = WordlistId::new().unwrap();
        for _ in 0..20 {
            let word = provider.generate().unwrap();
            assert!(provider.words.contains(&word.as_str()));
        }
    }
}
