//! Mark operations over token ranges.
//!
//! Marks only attach to characters; open and close tokens inside a range are
//! skipped, so a range may span block boundaries.

use super::Inline;
use super::step::Token;
use crate::core::mark::{Mark, MarkKind, MarkSet};

/// Groups characters into maximal runs of equal mark sets.
pub fn group_runs(chars: impl IntoIterator<Item = (char, MarkSet)>) -> Vec<Inline> {
    let mut runs: Vec<(String, MarkSet)> = Vec::new();
    for (ch, marks) in chars {
        match runs.last_mut() {
            Some((text, current)) if *current == marks => text.push(ch),
            _ => runs.push((ch.to_string(), marks)),
        }
    }
    runs.into_iter()
        .map(|(text, marks)| Inline::new(text, marks))
        .collect()
}

/// Adds `mark` to every character token, returning how many changed.
pub fn add_mark(tokens: &mut [Token], mark: &Mark) -> usize {
    let mut changed = 0;
    for token in tokens {
        if let Token::Char { marks, .. } = token
            && marks.get(&mark.kind) != Some(mark)
        {
            marks.insert(mark.clone());
            changed += 1;
        }
    }
    changed
}

pub fn remove_mark(tokens: &mut [Token], kind: &MarkKind) -> usize {
    let mut changed = 0;
    for token in tokens {
        if let Token::Char { marks, .. } = token
            && marks.remove(kind).is_some()
        {
            changed += 1;
        }
    }
    changed
}

/// True when the range holds at least one character and every character
/// carries a mark of `kind`.
pub fn range_has_mark(tokens: &[Token], kind: &MarkKind) -> bool {
    let mut chars = tokens.iter().filter_map(|token| match token {
        Token::Char { marks, .. } => Some(marks),
        _ => None,
    });
    let mut seen = false;
    let all = chars.all(|marks| {
        seen = true;
        marks.contains(kind)
    });
    seen && all
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc::BlockKind;

    fn chars(text: &str) -> Vec<Token> {
        text.chars()
            .map(|ch| Token::Char {
                ch,
                marks: MarkSet::new(),
            })
            .collect()
    }

    #[test]
    fn test_group_runs_is_maximal() {
        let bold = MarkSet::new().with(Mark::new(MarkKind::Bold));
        let runs = group_runs(vec![
            ('a', bold.clone()),
            ('b', bold.clone()),
            ('c', MarkSet::new()),
            ('d', bold),
        ]);
        let texts: Vec<&str> = runs.iter().map(|run| run.text()).collect();
        assert_eq!(texts, vec!["ab", "c", "d"]);
    }

    #[test]
    fn test_add_mark_skips_structural_tokens() {
        let mut tokens = chars("ab");
        tokens.push(Token::Close);
        tokens.push(Token::Open(BlockKind::Paragraph));
        tokens.extend(chars("c"));
        let changed = add_mark(&mut tokens, &Mark::new(MarkKind::Bold));
        assert_eq!(changed, 3);
        assert!(range_has_mark(&tokens, &MarkKind::Bold));
        assert_eq!(add_mark(&mut tokens, &Mark::new(MarkKind::Bold)), 0);
    }

    #[test]
    fn test_add_mark_replaces_same_kind_with_new_attrs() {
        let mut tokens = chars("a");
        add_mark(&mut tokens, &Mark::link("https://a.example"));
        assert_eq!(add_mark(&mut tokens, &Mark::link("https://b.example")), 1);
    }

    #[test]
    fn test_remove_mark_counts_changes() {
        let mut tokens = chars("abc");
        add_mark(&mut tokens[..2], &Mark::new(MarkKind::Italic));
        assert!(!range_has_mark(&tokens, &MarkKind::Italic));
        assert_eq!(remove_mark(&mut tokens, &MarkKind::Italic), 2);
    }

    #[test]
    fn test_empty_range_has_no_mark() {
        assert!(!range_has_mark(&[Token::Close], &MarkKind::Bold));
    }
}
