// src/text.rs
//
// Vocabulary building and sparse token batches for the convolutional
// models. The tokenizer is deliberately demo-grade: lowercase, split on
// anything non-alphanumeric.

use crate::dataset::LabelledDoc;
use std::collections::HashMap;

pub const UNK: &str = "<unk>";
pub const PAD: &str = "<pad>";
pub const BOS: &str = "<bos>";
pub const EOS: &str = "<eos>";

/// Token-to-index mapping with special tokens first and frequency-ordered
/// regular tokens, capped at `max_tokens`. Unknown tokens map to `<unk>`.
#[derive(Debug, Clone)]
pub struct Vocab {
    index: HashMap<String, usize>,
    tokens: Vec<String>,
}

impl Vocab {
    /// Build from an iterator of tokenized documents.
    pub fn build<'a, I>(docs: I, max_tokens: usize) -> Self
    where
        I: IntoIterator<Item = &'a [String]>,
    {
        let mut freq: HashMap<&str, u64> = HashMap::new();
        for doc in docs {
            for tok in doc {
                *freq.entry(tok.as_str()).or_insert(0) += 1;
            }
        }

        let specials = [UNK, PAD, BOS, EOS];
        let mut ranked: Vec<(&str, u64)> = freq
            .into_iter()
            .filter(|(t, _)| !specials.contains(t))
            .collect();
        // Frequency descending, then lexicographic so the ordering is
        // deterministic across runs.
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));

        let mut tokens: Vec<String> = specials.iter().map(|s| s.to_string()).collect();
        for (tok, _) in ranked {
            if tokens.len() >= max_tokens {
                break;
            }
            tokens.push(tok.to_string());
        }

        let index = tokens
            .iter()
            .enumerate()
            .map(|(i, t)| (t.clone(), i))
            .collect();
        Self { index, tokens }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Index of a token, falling back to `<unk>`.
    pub fn get(&self, token: &str) -> usize {
        self.index.get(token).copied().unwrap_or(0)
    }

    pub fn token(&self, idx: usize) -> Option<&str> {
        self.tokens.get(idx).map(String::as_str)
    }
}

/// A tokenized document as word indices by position.
#[derive(Debug, Clone)]
pub struct SparseDoc {
    pub word_ids: Vec<usize>,
}

impl SparseDoc {
    pub fn len(&self) -> usize {
        self.word_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.word_ids.is_empty()
    }
}

/// A batch of sparse documents plus the dense shape it would occupy:
/// `(n_docs, vocab_size, max_len)`.
#[derive(Debug, Clone)]
pub struct SparseBatch {
    pub docs: Vec<SparseDoc>,
    pub vocab_size: usize,
    pub max_len: usize,
}

impl SparseBatch {
    pub fn n_docs(&self) -> usize {
        self.docs.len()
    }
}

/// Tokenizer plus vocabulary, mirroring the original pipeline's processor
/// object.
#[derive(Debug, Clone)]
pub struct TextProcessor {
    pub vocab: Vocab,
}

/// Lowercase and split on non-alphanumeric characters.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl TextProcessor {
    /// Tokenize every document, build the capped vocabulary from the
    /// training texts, and return the processor.
    pub fn fit(docs: &[LabelledDoc], max_tokens: usize) -> Self {
        let tokenized: Vec<Vec<String>> = docs.iter().map(|d| tokenize(&d.text)).collect();
        let vocab = Vocab::build(tokenized.iter().map(Vec::as_slice), max_tokens);
        Self { vocab }
    }

    /// Convert labelled documents into a sparse batch and a label vector.
    /// Documents that tokenize to nothing are dropped together with their
    /// labels.
    pub fn batch(&self, docs: &[LabelledDoc]) -> (SparseBatch, Vec<usize>) {
        let mut sparse_docs = Vec::with_capacity(docs.len());
        let mut labels = Vec::with_capacity(docs.len());
        let mut max_len = 0usize;
        for doc in docs {
            let word_ids: Vec<usize> =
                tokenize(&doc.text).iter().map(|t| self.vocab.get(t)).collect();
            if word_ids.is_empty() {
                continue;
            }
            max_len = max_len.max(word_ids.len());
            sparse_docs.push(SparseDoc { word_ids });
            labels.push(doc.label);
        }
        (
            SparseBatch {
                docs: sparse_docs,
                vocab_size: self.vocab.len(),
                max_len,
            },
            labels,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(label: usize, text: &str) -> LabelledDoc {
        LabelledDoc {
            label,
            text: text.to_string(),
        }
    }

    #[test]
    fn test_tokenize_lowercases_and_splits() {
        let toks = tokenize("The cat, the CAT!");
        assert_eq!(toks, vec!["the", "cat", "the", "cat"]);
    }

    #[test]
    fn test_vocab_specials_first() {
        let docs = vec![tokenize("a b b c c c")];
        let vocab = Vocab::build(docs.iter().map(Vec::as_slice), 100);
        assert_eq!(vocab.get(UNK), 0);
        assert_eq!(vocab.get(PAD), 1);
        assert_eq!(vocab.get(BOS), 2);
        assert_eq!(vocab.get(EOS), 3);
        // Frequency order after the specials.
        assert_eq!(vocab.token(4), Some("c"));
        assert_eq!(vocab.token(5), Some("b"));
        assert_eq!(vocab.token(6), Some("a"));
    }

    #[test]
    fn test_vocab_cap_and_unk_fallback() {
        let docs = vec![tokenize("a a a b b c")];
        let vocab = Vocab::build(docs.iter().map(Vec::as_slice), 5);
        assert_eq!(vocab.len(), 5); // 4 specials + "a"
        assert_eq!(vocab.get("a"), 4);
        assert_eq!(vocab.get("b"), 0);
        assert_eq!(vocab.get("zebra"), 0);
    }

    #[test]
    fn test_vocab_deterministic_tie_break() {
        let docs = vec![tokenize("x y")];
        let vocab = Vocab::build(docs.iter().map(Vec::as_slice), 100);
        assert_eq!(vocab.token(4), Some("x"));
        assert_eq!(vocab.token(5), Some("y"));
    }

    #[test]
    fn test_batch_shape_and_labels() {
        let docs = vec![
            doc(0, "markets rallied on earnings"),
            doc(1, "the team won the match"),
        ];
        let processor = TextProcessor::fit(&docs, 1000);
        let (batch, labels) = processor.batch(&docs);
        assert_eq!(batch.n_docs(), 2);
        assert_eq!(labels, vec![0, 1]);
        assert_eq!(batch.max_len, 5);
        assert_eq!(batch.vocab_size, processor.vocab.len());
    }

    #[test]
    fn test_batch_drops_empty_documents() {
        let docs = vec![doc(0, "real words"), doc(1, "!!! ..."), doc(2, "more text")];
        let processor = TextProcessor::fit(&docs, 1000);
        let (batch, labels) = processor.batch(&docs);
        assert_eq!(batch.n_docs(), 2);
        assert_eq!(labels, vec![0, 2]);
    }

    #[test]
    fn test_batch_unknown_words_map_to_unk() {
        let train = vec![doc(0, "alpha beta gamma")];
        let processor = TextProcessor::fit(&train, 1000);
        let (batch, _) = processor.batch(&[doc(0, "alpha delta")]);
        assert_eq!(batch.docs[0].word_ids[0], processor.vocab.get("alpha"));
        assert_eq!(batch.docs[0].word_ids[1], 0);
    }
}
