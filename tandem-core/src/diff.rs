//! Before/after text pair → operation.
//!
//! Trims the longest common prefix and suffix and replaces whatever is left
//! in the middle. One pass over each string, which fits keystroke-sized local
//! edits. It is not a minimal edit script: a find-and-replace touching several
//! regions becomes one large replacement spanning all of them. The result is
//! still exact, only bigger than it needs to be.

use crate::operation::{Component, Operation};

/// Encode the change from `old` to `new`.
///
/// Returns `None` when the texts are equal, never an empty operation.
pub fn encode(old: &str, new: &str) -> Option<Operation> {
    if old == new {
        return None;
    }

    let old_chars: Vec<char> = old.chars().collect();
    let new_chars: Vec<char> = new.chars().collect();

    let prefix = old_chars
        .iter()
        .zip(&new_chars)
        .take_while(|(a, b)| a == b)
        .count();

    // Bounded so prefix and suffix never overlap in either string.
    let max_suffix = old_chars.len().min(new_chars.len()) - prefix;
    let suffix = old_chars
        .iter()
        .rev()
        .zip(new_chars.iter().rev())
        .take(max_suffix)
        .take_while(|(a, b)| a == b)
        .count();

    let deleted = old_chars.len() - prefix - suffix;
    let inserted: String = new_chars[prefix..new_chars.len() - suffix].iter().collect();

    log::trace!(
        "diff: prefix={prefix} suffix={suffix} delete={deleted} insert={}",
        inserted.chars().count()
    );

    let op = Operation::new([
        Component::Delete {
            pos: prefix,
            len: deleted,
        },
        Component::Insert {
            pos: prefix,
            text: inserted,
        },
    ]);
    Some(op)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equal_texts_encode_to_nothing() {
        assert!(encode("", "").is_none());
        assert!(encode("same", "same").is_none());
    }

    #[test]
    fn test_append() {
        let op = encode("hello", "hello world").unwrap();
        assert_eq!(op, Operation::insert(5, " world"));
    }

    #[test]
    fn test_delete_prefix() {
        let op = encode("hello world", " world").unwrap();
        assert_eq!(op, Operation::delete(0, 5));
    }

    #[test]
    fn test_replace_middle_emits_delete_then_insert() {
        let op = encode("abcdef", "abXYef").unwrap();
        assert_eq!(
            op.components(),
            &[
                Component::Delete { pos: 2, len: 2 },
                Component::Insert {
                    pos: 2,
                    text: "XY".into()
                },
            ]
        );
    }

    #[test]
    fn test_repeated_chars_do_not_overlap() {
        // Prefix "aa" and suffix "aa" would overlap without the bound.
        let op = encode("aaa", "aaaa").unwrap();
        assert_eq!(op.apply_to("aaa").unwrap(), "aaaa");
        assert_eq!(op, Operation::insert(3, "a"));

        let op = encode("aaaa", "aa").unwrap();
        assert_eq!(op, Operation::delete(2, 2));
    }

    #[test]
    fn test_from_and_to_empty() {
        assert_eq!(encode("", "abc").unwrap(), Operation::insert(0, "abc"));
        assert_eq!(encode("abc", "").unwrap(), Operation::delete(0, 3));
    }

    #[test]
    fn test_multibyte_offsets_are_chars() {
        let op = encode("naïve café", "naïve cafés").unwrap();
        assert_eq!(op, Operation::insert(10, "s"));
        assert_eq!(op.apply_to("naïve café").unwrap(), "naïve cafés");
    }

    #[test]
    fn test_multi_region_edit_is_one_replacement() {
        let old = "one two one";
        let new = "ONE two ONE";
        let op = encode(old, new).unwrap();
        assert_eq!(op.components().len(), 2);
        assert_eq!(op.apply_to(old).unwrap(), new);
    }
}
