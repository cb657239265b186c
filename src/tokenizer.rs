use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::config::{Config, TokenizerType};
use crate::error::{Error, Result};

/// Text/token conversion. Two interchangeable variants, selected by the
/// config's `tokenizer_type`.
pub enum Tokenizer {
    CharLevel(CharLevelTokenizer),
    Vocab(VocabTokenizer),
}

impl Tokenizer {
    pub fn from_config(config: &Config) -> Result<Self> {
        match config.tokenizer_type {
            TokenizerType::CharLevel => Ok(Tokenizer::CharLevel(CharLevelTokenizer::new(
                config.vocab_size,
            ))),
            TokenizerType::VocabFile => {
                let path = config.vocab_file.as_ref().ok_or_else(|| Error::Config {
                    reason: "vocab_file is required for VocabFile tokenizer".to_string(),
                })?;
                Ok(Tokenizer::Vocab(VocabTokenizer::from_file(path)?))
            }
        }
    }

    pub fn encode(&self, text: &str) -> Result<Vec<usize>> {
        match self {
            Tokenizer::CharLevel(t) => t.encode(text),
            Tokenizer::Vocab(t) => t.encode(text),
        }
    }

    pub fn decode(&self, tokens: &[usize]) -> Result<String> {
        match self {
            Tokenizer::CharLevel(t) => t.decode(tokens),
            Tokenizer::Vocab(t) => t.decode(tokens),
        }
    }

    /// Decodes a single token for incremental printing.
    pub fn decode_token(&self, token: usize) -> Result<String> {
        self.decode(&[token])
    }

    pub fn vocab_size(&self) -> usize {
        match self {
            Tokenizer::CharLevel(t) => t.vocab_size,
            Tokenizer::Vocab(t) => t.vocab_size,
        }
    }
}

/// Byte-level tokenizer: token id == byte value.
pub struct CharLevelTokenizer {
    pub vocab_size: usize,
}

impl CharLevelTokenizer {
    pub fn new(vocab_size: usize) -> Self {
        Self { vocab_size }
    }

    pub fn encode(&self, text: &str) -> Result<Vec<usize>> {
        text.as_bytes()
            .iter()
            .map(|&byte| {
                let id = byte as usize;
                if id < self.vocab_size {
                    Ok(id)
                } else {
                    Err(Error::Tokenizer {
                        reason: format!("byte {byte} outside vocabulary of {}", self.vocab_size),
                    })
                }
            })
            .collect()
    }

    pub fn decode(&self, tokens: &[usize]) -> Result<String> {
        let mut bytes = Vec::with_capacity(tokens.len());
        for &token in tokens {
            if token >= self.vocab_size || token > u8::MAX as usize {
                return Err(Error::Tokenizer {
                    reason: format!("token {token} outside vocabulary of {}", self.vocab_size),
                });
            }
            bytes.push(token as u8);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Tokenizer backed by a JSON vocabulary file mapping piece -> id.
///
/// Encoding is greedy longest-prefix match over the text; characters with no
/// piece fall back to single-byte pieces spelled `<0xNN>` when the vocabulary
/// carries them.
pub struct VocabTokenizer {
    pub vocab_size: usize,
    pub token_to_id: HashMap<String, usize>,
    pub id_to_token: HashMap<usize, String>,
    max_piece_len: usize,
}

impl VocabTokenizer {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref()).map_err(|e| Error::Tokenizer {
            reason: format!("cannot open vocab file {}: {e}", path.as_ref().display()),
        })?;
        let token_to_id: HashMap<String, usize> = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| Error::Tokenizer {
                reason: format!("malformed vocab file {}: {e}", path.as_ref().display()),
            })?;
        Self::from_vocab(token_to_id)
    }

    pub fn from_vocab(token_to_id: HashMap<String, usize>) -> Result<Self> {
        if token_to_id.is_empty() {
            return Err(Error::Tokenizer {
                reason: "vocabulary is empty".to_string(),
            });
        }
        let mut id_to_token = HashMap::with_capacity(token_to_id.len());
        for (piece, &id) in &token_to_id {
            if id_to_token.insert(id, piece.clone()).is_some() {
                return Err(Error::Tokenizer {
                    reason: format!("duplicate token id {id} in vocabulary"),
                });
            }
        }
        let vocab_size = id_to_token.keys().max().map(|&id| id + 1).unwrap_or(0);
        let max_piece_len = token_to_id.keys().map(|piece| piece.len()).max().unwrap_or(1);
        Ok(Self {
            vocab_size,
            token_to_id,
            id_to_token,
            max_piece_len,
        })
    }

    pub fn encode(&self, text: &str) -> Result<Vec<usize>> {
        let mut tokens = Vec::new();
        let mut rest = text;
        while !rest.is_empty() {
            let mut matched = None;
            let upper = self.max_piece_len.min(rest.len());
            for len in (1..=upper).rev() {
                if !rest.is_char_boundary(len) {
                    continue;
                }
                if let Some(&id) = self.token_to_id.get(&rest[..len]) {
                    matched = Some((id, len));
                    break;
                }
            }
            match matched {
                Some((id, len)) => {
                    tokens.push(id);
                    rest = &rest[len..];
                }
                None => {
                    // byte fallback: encode each byte of the next char as <0xNN>
                    let ch = rest.chars().next().expect("rest is non-empty");
                    for byte in ch.to_string().as_bytes() {
                        let piece = format!("<0x{byte:02X}>");
                        let id = self.token_to_id.get(&piece).ok_or_else(|| {
                            Error::Tokenizer {
                                reason: format!("no vocabulary entry for {ch:?} or its bytes"),
                            }
                        })?;
                        tokens.push(*id);
                    }
                    rest = &rest[ch.len_utf8()..];
                }
            }
        }
        Ok(tokens)
    }

    pub fn decode(&self, tokens: &[usize]) -> Result<String> {
        let mut bytes = Vec::new();
        for &token in tokens {
            let piece = self.id_to_token.get(&token).ok_or_else(|| Error::Tokenizer {
                reason: format!("token {token} outside vocabulary of {}", self.vocab_size),
            })?;
            // pieces of the form <0xNN> designate raw bytes
            if let Some(hex) = piece.strip_prefix("<0x") {
                if hex.len() >= 2 {
                    if let Ok(byte) = u8::from_str_radix(&hex[..2], 16) {
                        bytes.push(byte);
                        continue;
                    }
                }
            }
            bytes.extend_from_slice(piece.as_bytes());
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn char_level_ascii_codes() {
        let tokenizer = CharLevelTokenizer::new(256);
        assert_eq!(tokenizer.encode("AB").unwrap(), vec![65, 66]);
    }

    #[test]
    fn char_level_round_trip_printable_ascii() {
        let tokenizer = CharLevelTokenizer::new(256);
        let text: String = (0x20u8..0x7f).map(|b| b as char).collect();
        let encoded = tokenizer.encode(&text).unwrap();
        assert_eq!(tokenizer.decode(&encoded).unwrap(), text);
    }

    #[test]
    fn char_level_rejects_out_of_vocab_byte() {
        let tokenizer = CharLevelTokenizer::new(64);
        assert!(matches!(
            tokenizer.encode("z"),
            Err(Error::Tokenizer { .. })
        ));
    }

    fn small_vocab() -> VocabTokenizer {
        let vocab: HashMap<String, usize> = [
            ("a".to_string(), 0),
            ("b".to_string(), 1),
            ("ab".to_string(), 2),
            ("abc".to_string(), 3),
            ("<0x21>".to_string(), 4),
        ]
        .into_iter()
        .collect();
        VocabTokenizer::from_vocab(vocab).unwrap()
    }

    #[test]
    fn vocab_longest_match_wins() {
        let tokenizer = small_vocab();
        assert_eq!(tokenizer.encode("abc").unwrap(), vec![3]);
        assert_eq!(tokenizer.encode("abb").unwrap(), vec![2, 1]);
    }

    #[test]
    fn vocab_byte_fallback_round_trip() {
        let tokenizer = small_vocab();
        // '!' has no direct piece, only the <0x21> byte fallback
        let encoded = tokenizer.encode("ab!a").unwrap();
        assert_eq!(encoded, vec![2, 4, 0]);
        assert_eq!(tokenizer.decode(&encoded).unwrap(), "ab!a");
    }

    #[test]
    fn vocab_unencodable_char_errors() {
        let tokenizer = small_vocab();
        assert!(matches!(
            tokenizer.encode("xyz"),
            Err(Error::Tokenizer { .. })
        ));
    }

    #[test]
    fn vocab_duplicate_id_rejected() {
        let vocab: HashMap<String, usize> =
            [("a".to_string(), 0), ("b".to_string(), 0)].into_iter().collect();
        assert!(matches!(
            VocabTokenizer::from_vocab(vocab),
            Err(Error::Tokenizer { .. })
        ));
    }
}
