//! Keystroke shortcuts that turn a typed prefix into block structure.
//!
//! Typing `#` (up to six times), `-`, or digits followed by `.` at the start
//! of a paragraph and then a space replaces the prefix with a heading, bullet
//! item or ordered item. The machine only watches keys; characters that do
//! not trigger are left for the editor to insert.

use super::step::{StepError, Transaction};
use super::{BlockKind, Doc, MAX_HEADING_LEVEL, Resolved};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shortcut {
    Heading,
    Bullet,
    OrderedDigits,
    OrderedDot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RuleState {
    #[default]
    Idle,
    Accumulating {
        shortcut: Shortcut,
        prefix_len: usize,
    },
}

#[derive(Debug)]
pub enum KeyOutcome {
    /// The key triggered a shortcut; apply this transaction instead of
    /// inserting the key.
    Handled(Transaction),
    PassThrough,
}

#[derive(Debug, Default)]
pub struct InputRules {
    state: RuleState,
}

impl InputRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> RuleState {
        self.state
    }

    pub fn reset(&mut self) {
        self.state = RuleState::Idle;
    }

    /// Feeds one keystroke typed at `caret` in `doc`, the document as it was
    /// before the key is inserted.
    pub fn handle_key(&mut self, doc: &Doc, caret: usize, key: char) -> KeyOutcome {
        let Some((block_pos, offset, text)) = paragraph_at(doc, caret) else {
            self.reset();
            return KeyOutcome::PassThrough;
        };

        let next = match (self.state, key) {
            (RuleState::Idle, '#') if offset == 0 => Some((Shortcut::Heading, 1)),
            (RuleState::Idle, '-') if offset == 0 => Some((Shortcut::Bullet, 1)),
            (RuleState::Idle, '0'..='9') if offset == 0 => Some((Shortcut::OrderedDigits, 1)),
            (
                RuleState::Accumulating {
                    shortcut: Shortcut::Heading,
                    prefix_len,
                },
                '#',
            ) if offset == prefix_len && prefix_len < usize::from(MAX_HEADING_LEVEL) => {
                Some((Shortcut::Heading, prefix_len + 1))
            }
            (
                RuleState::Accumulating {
                    shortcut: Shortcut::OrderedDigits,
                    prefix_len,
                },
                '0'..='9',
            ) if offset == prefix_len => Some((Shortcut::OrderedDigits, prefix_len + 1)),
            (
                RuleState::Accumulating {
                    shortcut: Shortcut::OrderedDigits,
                    prefix_len,
                },
                '.',
            ) if offset == prefix_len => Some((Shortcut::OrderedDot, prefix_len + 1)),
            (
                RuleState::Accumulating {
                    shortcut,
                    prefix_len,
                },
                ' ',
            ) if offset == prefix_len && shortcut != Shortcut::OrderedDigits => {
                self.reset();
                return match trigger(doc, block_pos, shortcut, &text, prefix_len) {
                    Ok(Some(tx)) => KeyOutcome::Handled(tx),
                    Ok(None) | Err(_) => KeyOutcome::PassThrough,
                };
            }
            _ => None,
        };

        self.state = match next {
            Some((shortcut, prefix_len)) => RuleState::Accumulating {
                shortcut,
                prefix_len,
            },
            None => RuleState::Idle,
        };
        KeyOutcome::PassThrough
    }
}

fn paragraph_at(doc: &Doc, caret: usize) -> Option<(usize, usize, String)> {
    let Resolved::Inside { block, offset } = doc.resolve(caret)? else {
        return None;
    };
    let node = &doc.blocks()[block];
    if node.kind() != &BlockKind::Paragraph {
        return None;
    }
    Some((caret - offset - 1, offset, node.text()))
}

/// Builds the replacement, re-checking the prefix against the block text so
/// an edit the machine did not see cannot trigger a stale shortcut.
fn trigger(
    doc: &Doc,
    block_pos: usize,
    shortcut: Shortcut,
    text: &str,
    prefix_len: usize,
) -> Result<Option<Transaction>, StepError> {
    let prefix: String = text.chars().take(prefix_len).collect();
    if prefix.chars().count() != prefix_len {
        return Ok(None);
    }
    let kind = match shortcut {
        Shortcut::Heading if prefix.chars().all(|ch| ch == '#') => {
            BlockKind::heading(prefix_len as u8)
        }
        Shortcut::Bullet if prefix == "-" => BlockKind::BulletItem,
        Shortcut::OrderedDot => {
            let Some(digits) = prefix.strip_suffix('.') else {
                return Ok(None);
            };
            let Ok(start) = digits.parse::<u64>() else {
                return Ok(None);
            };
            BlockKind::OrderedItem { start }
        }
        _ => return Ok(None),
    };

    let mut tx = Transaction::new(doc);
    tx.delete(block_pos + 1, block_pos + 1 + prefix_len)?
        .set_block_kind(block_pos, kind)?;
    Ok(Some(tx))
}
