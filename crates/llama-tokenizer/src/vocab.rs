//! Reference fixed vocabulary.
//!
//! Layout:
//! - `0` `<unk>`, `1` `<s>` (BOS), `2` `</s>` (EOS, end of generation)
//! - `3..259` one token per byte value
//! - `259..` caller-provided multi-byte pieces
//!
//! Encoding is greedy longest-match over bytes, so any text is encodable.

use std::collections::HashMap;

use llama_engine::{LlamaModel, TokenId};

pub const UNK_ID: TokenId = 0;
pub const BOS_ID: TokenId = 1;
pub const EOS_ID: TokenId = 2;

const BYTE_OFFSET: TokenId = 3;
const N_CONTROL: usize = 3;
const CONTROL_TEXT: [&str; N_CONTROL] = ["<unk>", "<s>", "</s>"];

/// In-memory vocabulary implementing the read-only half of a model.
#[derive(Debug, Clone)]
pub struct FixedVocab {
    pieces: Vec<Vec<u8>>,
    lookup: HashMap<Vec<u8>, TokenId>,
    max_piece_len: usize,
    add_space_prefix: bool,
}

impl FixedVocab {
    /// Build a vocabulary from extra pieces. Empty, single-byte and duplicate
    /// pieces are ignored since bytes are always present.
    pub fn new<I, S>(extra_pieces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut pieces: Vec<Vec<u8>> = CONTROL_TEXT.iter().map(|s| s.as_bytes().to_vec()).collect();
        pieces.extend((0..=255u8).map(|b| vec![b]));

        let mut lookup = HashMap::new();
        let mut max_piece_len = 1;
        for piece in extra_pieces {
            let bytes = piece.as_ref().as_bytes();
            if bytes.len() < 2 || lookup.contains_key(bytes) {
                continue;
            }
            lookup.insert(bytes.to_vec(), pieces.len() as TokenId);
            max_piece_len = max_piece_len.max(bytes.len());
            pieces.push(bytes.to_vec());
        }

        Self {
            pieces,
            lookup,
            max_piece_len,
            add_space_prefix: false,
        }
    }

    /// Byte-level vocabulary with no merged pieces.
    pub fn bytes_only() -> Self {
        Self::new(std::iter::empty::<&str>())
    }

    /// Prepend a space to text runs on encode and strip it from the first
    /// rendered piece on decode.
    pub fn with_space_prefix(mut self, enabled: bool) -> Self {
        self.add_space_prefix = enabled;
        self
    }

    pub fn add_space_prefix(&self) -> bool {
        self.add_space_prefix
    }

    pub fn is_control(&self, token: TokenId) -> bool {
        (0..N_CONTROL as TokenId).contains(&token)
    }

    /// Raw bytes of a token, control tokens as their text form.
    pub fn piece(&self, token: TokenId) -> Option<&[u8]> {
        usize::try_from(token)
            .ok()
            .and_then(|i| self.pieces.get(i))
            .map(Vec::as_slice)
    }

    /// Id of an exact piece, falling back to the byte token for one byte.
    pub fn token_for(&self, bytes: &[u8]) -> Option<TokenId> {
        match bytes {
            [b] => Some(BYTE_OFFSET + *b as TokenId),
            _ => self.lookup.get(bytes).copied(),
        }
    }

    fn encode_text(&self, text: &[u8], out: &mut Vec<TokenId>) {
        let mut i = 0;
        while i < text.len() {
            let longest = self.max_piece_len.min(text.len() - i);
            let (id, len) = (2..=longest)
                .rev()
                .find_map(|len| self.lookup.get(&text[i..i + len]).map(|&id| (id, len)))
                .unwrap_or((BYTE_OFFSET + text[i] as TokenId, 1));
            out.push(id);
            i += len;
        }
    }

    /// Split `text` into literal runs and control tokens.
    fn fragments<'a>(&self, text: &'a str, parse_special: bool) -> Vec<Fragment<'a>> {
        if !parse_special {
            return vec![Fragment::Text(text)];
        }

        let mut out = Vec::new();
        let mut rest = text;
        while !rest.is_empty() {
            let next = CONTROL_TEXT
                .iter()
                .enumerate()
                .filter_map(|(id, s)| rest.find(s).map(|at| (at, id, s.len())))
                .min_by_key(|&(at, _, _)| at);
            match next {
                Some((at, id, len)) => {
                    if at > 0 {
                        out.push(Fragment::Text(&rest[..at]));
                    }
                    out.push(Fragment::Control(id as TokenId));
                    rest = &rest[at + len..];
                }
                None => {
                    out.push(Fragment::Text(rest));
                    break;
                }
            }
        }
        out
    }

    fn tokenize(&self, text: &str, add_special: bool, parse_special: bool) -> Vec<TokenId> {
        let mut out = Vec::with_capacity(text.len() + 1);
        if add_special {
            out.push(BOS_ID);
        }

        let mut prev_special = true;
        for fragment in self.fragments(text, parse_special) {
            match fragment {
                Fragment::Control(id) => {
                    out.push(id);
                    prev_special = true;
                }
                Fragment::Text("") => {}
                Fragment::Text(run) => {
                    if self.add_space_prefix && prev_special {
                        let mut prefixed = Vec::with_capacity(run.len() + 1);
                        prefixed.push(b' ');
                        prefixed.extend_from_slice(run.as_bytes());
                        self.encode_text(&prefixed, &mut out);
                    } else {
                        self.encode_text(run.as_bytes(), &mut out);
                    }
                    prev_special = false;
                }
            }
        }
        out
    }

    fn detokenize(&self, tokens: &[TokenId], remove_special: bool, unparse_special: bool) -> Vec<u8> {
        let mut out = Vec::new();
        let mut strip_space = self.add_space_prefix;
        for &token in tokens {
            let Some(piece) = self.piece(token) else {
                continue;
            };
            if self.is_control(token) {
                if !remove_special && unparse_special {
                    out.extend_from_slice(piece);
                    strip_space = false;
                }
                continue;
            }
            match piece {
                [b' ', rest @ ..] if strip_space => out.extend_from_slice(rest),
                _ => out.extend_from_slice(piece),
            }
            strip_space = false;
        }
        out
    }
}

enum Fragment<'a> {
    Text(&'a str),
    Control(TokenId),
}

fn write_into<T: Copy>(items: &[T], buf: &mut [T]) -> i32 {
    if items.len() > buf.len() {
        return -(items.len() as i32);
    }
    buf[..items.len()].copy_from_slice(items);
    items.len() as i32
}

impl LlamaModel for FixedVocab {
    fn n_vocab(&self) -> usize {
        self.pieces.len()
    }

    fn tokenize_into(
        &self,
        text: &str,
        add_special: bool,
        parse_special: bool,
        buf: &mut [TokenId],
    ) -> i32 {
        write_into(&self.tokenize(text, add_special, parse_special), buf)
    }

    fn detokenize_into(
        &self,
        tokens: &[TokenId],
        remove_special: bool,
        unparse_special: bool,
        buf: &mut [u8],
    ) -> i32 {
        write_into(&self.detokenize(tokens, remove_special, unparse_special), buf)
    }

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        token == EOS_ID
    }

    fn bos_token(&self) -> Option<TokenId> {
        Some(BOS_ID)
    }
}
