//! Model/tokenizer provider seam.
//!
//! Epistemic foundation:
//! - K_i: The core never builds models or tokenizers itself; it talks to them
//!   through `LanguageModel` and `Processor`
//! - B_i: Every forward pass or encode may fail → Result, propagated as-is
//! - I^R: Backends are pluggable; `llama` is the bundled text-mode backend

mod input;
pub mod llama;

pub use input::*;
pub use llama::{ChatProcessor, LlamaModel};

use crate::models::{Result, SieveError};
use candle_core::Tensor;
use image::DynamicImage;
use serde::{Deserialize, Serialize};

/// A callable model producing next-token logits.
pub trait LanguageModel {
    /// Run one forward pass and return logits for the last position only,
    /// shape `(1, vocab)`.
    fn forward(&mut self, input: &EncodedInput) -> Result<Tensor>;
}

impl<M: LanguageModel + ?Sized> LanguageModel for &mut M {
    fn forward(&mut self, input: &EncodedInput) -> Result<Tensor> {
        (**self).forward(input)
    }
}

impl<M: LanguageModel + ?Sized> LanguageModel for Box<M> {
    fn forward(&mut self, input: &EncodedInput) -> Result<Tensor> {
        (**self).forward(input)
    }
}

/// Text (and optionally image) encoder paired with a model.
pub trait Processor {
    /// Encode a rendered prompt, with an image in vision mode, into a fresh
    /// model input.
    fn encode(&self, prompt: &str, image: Option<&DynamicImage>) -> Result<EncodedInput>;

    /// Tokenize raw text without special tokens or chat formatting.
    fn tokenize(&self, text: &str) -> Result<Vec<u32>>;
}

impl<P: Processor + ?Sized> Processor for &P {
    fn encode(&self, prompt: &str, image: Option<&DynamicImage>) -> Result<EncodedInput> {
        (**self).encode(prompt, image)
    }

    fn tokenize(&self, text: &str) -> Result<Vec<u32>> {
        (**self).tokenize(text)
    }
}

impl<P: Processor + ?Sized> Processor for Box<P> {
    fn encode(&self, prompt: &str, image: Option<&DynamicImage>) -> Result<EncodedInput> {
        (**self).encode(prompt, image)
    }

    fn tokenize(&self, text: &str) -> Result<Vec<u32>> {
        (**self).tokenize(text)
    }
}

/// Vocabulary ids standing for "yes" and "no".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerTokens {
    pub yes: u32,
    pub no: u32,
}

impl AnswerTokens {
    /// Literal whose first token means "keep".
    pub const YES_LITERAL: &'static str = "1";
    /// Literal whose first token means "discard".
    pub const NO_LITERAL: &'static str = "0";

    /// Resolve the answer ids by tokenizing "1" and "0" and taking the first
    /// token of each.
    ///
    /// B_i(tokenizer yields distinct single tokens) → Result
    pub fn resolve<P: Processor + ?Sized>(processor: &P) -> Result<Self> {
        let first = |literal: &'static str| -> Result<u32> {
            let ids = processor.tokenize(literal)?;
            ids.first().copied().ok_or(SieveError::AnswerToken {
                literal,
                reason: "tokenizer produced no tokens".to_string(),
            })
        };

        let yes = first(Self::YES_LITERAL)?;
        let no = first(Self::NO_LITERAL)?;
        if yes == no {
            return Err(SieveError::AnswerToken {
                literal: Self::NO_LITERAL,
                reason: format!("shares token id {yes} with {:?}", Self::YES_LITERAL),
            });
        }

        Ok(Self { yes, no })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    struct ByteProcessor;

    impl Processor for ByteProcessor {
        fn encode(&self, prompt: &str, _image: Option<&DynamicImage>) -> Result<EncodedInput> {
            EncodedInput::from_ids(&self.tokenize(prompt)?, &Device::Cpu)
        }

        fn tokenize(&self, text: &str) -> Result<Vec<u32>> {
            Ok(text.bytes().map(u32::from).collect())
        }
    }

    struct ConstProcessor(Vec<u32>);

    impl Processor for ConstProcessor {
        fn encode(&self, _prompt: &str, _image: Option<&DynamicImage>) -> Result<EncodedInput> {
            EncodedInput::from_ids(&self.0, &Device::Cpu)
        }

        fn tokenize(&self, _text: &str) -> Result<Vec<u32>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_resolve_answer_tokens() {
        let tokens = AnswerTokens::resolve(&ByteProcessor).unwrap();
        assert_eq!(tokens, AnswerTokens { yes: 49, no: 48 });
    }

    #[test]
    fn test_resolve_rejects_empty_tokenization() {
        let err = AnswerTokens::resolve(&ConstProcessor(vec![])).unwrap_err();
        assert!(matches!(err, SieveError::AnswerToken { literal: "1", .. }));
        assert!(err.is_misconfiguration());
    }

    #[test]
    fn test_resolve_rejects_identical_tokens() {
        let err = AnswerTokens::resolve(&ConstProcessor(vec![7, 8])).unwrap_err();
        assert!(matches!(err, SieveError::AnswerToken { literal: "0", .. }));
    }
}
