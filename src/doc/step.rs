//! Edit steps over the token model, transactions, and finished edits.

use super::mapping::{EditOp, Mapping, StepMap};
use super::mark_ops;
use super::{Block, BlockKind, Doc, Resolved};
use crate::core::mark::{Mark, MarkKind, MarkSet};
use serde::{Deserialize, Serialize};
use unicode_segmentation::UnicodeSegmentation;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Token {
    Open(BlockKind),
    Close,
    Char {
        ch: char,
        #[serde(default)]
        marks: MarkSet,
    },
}

impl Token {
    pub fn is_close(&self) -> bool {
        matches!(self, Token::Close)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Slice {
    tokens: Vec<Token>,
}

impl Slice {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(tokens: Vec<Token>) -> Self {
        Self { tokens }
    }

    pub fn text(text: &str, marks: &MarkSet) -> Self {
        Self {
            tokens: text
                .chars()
                .map(|ch| Token::Char {
                    ch,
                    marks: marks.clone(),
                })
                .collect(),
        }
    }

    /// Closes the current block and opens a new one of `kind`.
    pub fn split(kind: BlockKind) -> Self {
        Self {
            tokens: vec![Token::Close, Token::Open(kind)],
        }
    }

    /// A whole block holding plain `text`.
    pub fn block(kind: BlockKind, text: &str) -> Self {
        let mut tokens = vec![Token::Open(kind)];
        tokens.extend(Self::text(text, &MarkSet::new()).tokens);
        tokens.push(Token::Close);
        Self { tokens }
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl From<Vec<Token>> for Slice {
    fn from(tokens: Vec<Token>) -> Self {
        Self::new(tokens)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StepError {
    #[error("range {from}..{to} is outside the document (size {size})")]
    InvalidRange { from: usize, to: usize, size: usize },
    #[error("position {0} does not open a block")]
    NotABlock(usize),
    #[error("position {0} is not inside block content")]
    NotInBlock(usize),
    #[error("replacement leaves the document unbalanced")]
    Unbalanced,
    #[error("invalid grapheme boundary")]
    InvalidGraphemeBoundary,
    #[error("nothing to join at position {0}")]
    NothingToJoin(usize),
}

impl Doc {
    pub fn to_tokens(&self) -> Vec<Token> {
        let mut tokens = Vec::with_capacity(self.size());
        for block in self.blocks() {
            tokens.push(Token::Open(block.kind().clone()));
            for run in block.content() {
                tokens.extend(run.text().chars().map(|ch| Token::Char {
                    ch,
                    marks: run.marks().clone(),
                }));
            }
            tokens.push(Token::Close);
        }
        tokens
    }

    /// Parses a balanced token stream into a new document version.
    pub fn from_tokens(tokens: &[Token]) -> Result<Doc, StepError> {
        let mut blocks = Vec::new();
        let mut open: Option<(BlockKind, Vec<(char, MarkSet)>)> = None;
        for token in tokens {
            match token {
                Token::Open(kind) => {
                    if open.is_some() {
                        return Err(StepError::Unbalanced);
                    }
                    open = Some((kind.clone(), Vec::new()));
                }
                Token::Char { ch, marks } => match open.as_mut() {
                    Some((_, chars)) => chars.push((*ch, marks.clone())),
                    None => return Err(StepError::Unbalanced),
                },
                Token::Close => match open.take() {
                    Some((kind, chars)) => {
                        blocks.push(Block::new(kind, mark_ops::group_runs(chars)))
                    }
                    None => return Err(StepError::Unbalanced),
                },
            }
        }
        if open.is_some() {
            return Err(StepError::Unbalanced);
        }
        Ok(Doc::new(blocks))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum Step {
    Replace {
        from: usize,
        to: usize,
        #[serde(default)]
        slice: Slice,
    },
    AddMark {
        from: usize,
        to: usize,
        mark: Mark,
    },
    RemoveMark {
        from: usize,
        to: usize,
        kind: MarkKind,
    },
    SetBlockKind {
        pos: usize,
        kind: BlockKind,
    },
}

impl Step {
    /// Applies the step, producing a new version in which every node is fresh.
    pub fn apply(&self, doc: &Doc) -> Result<Doc, StepError> {
        let mut tokens = doc.to_tokens();
        match self {
            Step::Replace { from, to, slice } => {
                check_range(*from, *to, tokens.len())?;
                let inserts_text = slice
                    .tokens
                    .iter()
                    .any(|token| matches!(token, Token::Char { .. }));
                if inserts_text {
                    check_grapheme_boundary(doc, *from)?;
                }
                tokens.splice(*from..*to, slice.tokens.iter().cloned());
            }
            Step::AddMark { from, to, mark } => {
                check_range(*from, *to, tokens.len())?;
                mark_ops::add_mark(&mut tokens[*from..*to], mark);
            }
            Step::RemoveMark { from, to, kind } => {
                check_range(*from, *to, tokens.len())?;
                mark_ops::remove_mark(&mut tokens[*from..*to], kind);
            }
            Step::SetBlockKind { pos, kind } => {
                if !matches!(tokens.get(*pos), Some(Token::Open(_))) {
                    return Err(StepError::NotABlock(*pos));
                }
                tokens[*pos] = Token::Open(kind.clone());
            }
        }
        Doc::from_tokens(&tokens)
    }

    /// Position map of this step. Only replacements move positions.
    pub fn map(&self) -> StepMap {
        match self {
            Step::Replace { from, to, slice } => StepMap::replace(*from, to - from, slice.len()),
            _ => StepMap::empty(),
        }
    }

    pub fn operation(&self) -> EditOp {
        match self {
            Step::Replace { from, to, slice } => EditOp::replaced(*from, *to, slice.len()),
            Step::AddMark { from, to, .. } | Step::RemoveMark { from, to, .. } => {
                EditOp::format(*from, *to)
            }
            Step::SetBlockKind { pos, .. } => EditOp::format(*pos, pos + 1),
        }
    }
}

fn check_range(from: usize, to: usize, size: usize) -> Result<(), StepError> {
    if from > to || to > size {
        return Err(StepError::InvalidRange { from, to, size });
    }
    Ok(())
}

fn check_grapheme_boundary(doc: &Doc, pos: usize) -> Result<(), StepError> {
    let Some(Resolved::Inside { block, offset }) = doc.resolve(pos) else {
        return Ok(());
    };
    let text = doc.blocks()[block].text();
    if is_grapheme_boundary(&text, offset) {
        Ok(())
    } else {
        Err(StepError::InvalidGraphemeBoundary)
    }
}

pub(crate) fn is_grapheme_boundary(text: &str, char_offset: usize) -> bool {
    let Some((byte, _)) = text.char_indices().nth(char_offset) else {
        return true;
    };
    text.grapheme_indices(true).any(|(idx, _)| idx == byte)
}

/// Accumulates steps against a document version.
#[derive(Debug, Clone)]
pub struct Transaction {
    before: Doc,
    doc: Doc,
    steps: Vec<Step>,
}

impl Transaction {
    pub fn new(doc: &Doc) -> Self {
        Self {
            before: doc.clone(),
            doc: doc.clone(),
            steps: Vec::new(),
        }
    }

    pub fn before(&self) -> &Doc {
        &self.before
    }

    /// The document with every step so far applied.
    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step(&mut self, step: Step) -> Result<&mut Self, StepError> {
        self.doc = step.apply(&self.doc)?;
        self.steps.push(step);
        Ok(self)
    }

    /// Inserts `text` at `pos`, inheriting the marks of the preceding character.
    pub fn insert_text(&mut self, pos: usize, text: &str) -> Result<&mut Self, StepError> {
        let marks = match self.doc.resolve(pos) {
            Some(Resolved::Inside { block, offset }) => self.doc.blocks()[block].marks_at(offset),
            _ => return Err(StepError::NotInBlock(pos)),
        };
        self.insert_marked_text(pos, text, &marks)
    }

    pub fn insert_marked_text(
        &mut self,
        pos: usize,
        text: &str,
        marks: &MarkSet,
    ) -> Result<&mut Self, StepError> {
        if text.is_empty() {
            return Ok(self);
        }
        self.step(Step::Replace {
            from: pos,
            to: pos,
            slice: Slice::text(text, marks),
        })
    }

    pub fn delete(&mut self, from: usize, to: usize) -> Result<&mut Self, StepError> {
        self.step(Step::Replace {
            from,
            to,
            slice: Slice::empty(),
        })
    }

    /// Splits the block containing `pos`. Splitting a heading at its end
    /// starts a paragraph.
    pub fn split_block(&mut self, pos: usize) -> Result<&mut Self, StepError> {
        let Some(Resolved::Inside { block, offset }) = self.doc.resolve(pos) else {
            return Err(StepError::NotInBlock(pos));
        };
        let current = &self.doc.blocks()[block];
        let kind = match current.kind() {
            BlockKind::Heading { .. } if offset == current.len() => BlockKind::Paragraph,
            other => other.clone(),
        };
        self.step(Step::Replace {
            from: pos,
            to: pos,
            slice: Slice::split(kind),
        })
    }

    /// Joins the block starting at `pos` into its predecessor, as a
    /// backspace at the start of the block does.
    pub fn join_backward(&mut self, pos: usize) -> Result<&mut Self, StepError> {
        match self.doc.resolve(pos) {
            Some(Resolved::Inside { block, offset: 0 }) if block > 0 => self.delete(pos - 2, pos),
            _ => Err(StepError::NothingToJoin(pos)),
        }
    }

    /// Inserts a new block before block `index` (or at the end).
    pub fn insert_block(
        &mut self,
        index: usize,
        kind: BlockKind,
        text: &str,
    ) -> Result<&mut Self, StepError> {
        let pos = self.block_start(index)?;
        self.step(Step::Replace {
            from: pos,
            to: pos,
            slice: Slice::block(kind, text),
        })
    }

    pub fn remove_block(&mut self, index: usize) -> Result<&mut Self, StepError> {
        let from = self.block_start(index)?;
        let Some(block) = self.doc.blocks().get(index) else {
            return Err(StepError::NotABlock(from));
        };
        let to = from + block.len() + 2;
        self.delete(from, to)
    }

    pub fn add_mark(&mut self, from: usize, to: usize, mark: Mark) -> Result<&mut Self, StepError> {
        self.step(Step::AddMark { from, to, mark })
    }

    pub fn remove_mark(
        &mut self,
        from: usize,
        to: usize,
        kind: MarkKind,
    ) -> Result<&mut Self, StepError> {
        self.step(Step::RemoveMark { from, to, kind })
    }

    /// Removes `mark` when every character in range already carries its
    /// kind, adds it otherwise.
    pub fn toggle_mark(
        &mut self,
        from: usize,
        to: usize,
        mark: Mark,
    ) -> Result<&mut Self, StepError> {
        let tokens = self.doc.to_tokens();
        check_range(from, to, tokens.len())?;
        if mark_ops::range_has_mark(&tokens[from..to], &mark.kind) {
            self.remove_mark(from, to, mark.kind)
        } else {
            self.add_mark(from, to, mark)
        }
    }

    pub fn set_block_kind(&mut self, pos: usize, kind: BlockKind) -> Result<&mut Self, StepError> {
        self.step(Step::SetBlockKind { pos, kind })
    }

    pub fn finish(self) -> Edit {
        Edit {
            before: self.before,
            after: self.doc,
            steps: self.steps,
        }
    }

    fn block_start(&self, index: usize) -> Result<usize, StepError> {
        if index == self.doc.block_count() {
            return Ok(self.doc.size());
        }
        self.doc
            .block_positions()
            .get(index)
            .copied()
            .ok_or(StepError::InvalidRange {
                from: index,
                to: index,
                size: self.doc.block_count(),
            })
    }
}

/// An accepted edit: both versions and the steps between them.
#[derive(Debug, Clone)]
pub struct Edit {
    pub before: Doc,
    pub after: Doc,
    pub steps: Vec<Step>,
}

impl Edit {
    /// An edit with no steps, such as a selection change.
    pub fn identity(doc: &Doc) -> Self {
        Self {
            before: doc.clone(),
            after: doc.clone(),
            steps: Vec::new(),
        }
    }

    pub fn is_noop(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn mapping(&self) -> Mapping {
        Mapping::new(self.steps.iter().map(Step::map).collect())
    }

    /// The steps as range operations, each range expressed against the
    /// document as it stood before that step.
    pub fn operations(&self) -> Vec<EditOp> {
        self.steps.iter().map(Step::operation).collect()
    }
}
