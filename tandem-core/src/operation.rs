//! Operations: the unit of change.
//!
//! An operation is an ordered list of components. Components apply left to
//! right, and every component's position is a char offset into the text as
//! left by the components before it. The diff encoder's output
//! `[Delete(i, n), Insert(i, s)]` therefore reads "remove `n` chars at `i`,
//! then put `s` at `i`".
//!
//! Operations never change after construction. Every combinator returns a new
//! operation.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::span::Spans;
use crate::transform::Side;

/// A single insert or delete.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Component {
    /// Insert `text` before the char at `pos`.
    Insert { pos: usize, text: String },
    /// Remove `len` chars starting at `pos`.
    Delete { pos: usize, len: usize },
}

impl Component {
    /// Char offset this component is anchored at.
    pub fn pos(&self) -> usize {
        match self {
            Component::Insert { pos, .. } | Component::Delete { pos, .. } => *pos,
        }
    }

    /// A component that changes nothing.
    pub fn is_empty(&self) -> bool {
        match self {
            Component::Insert { text, .. } => text.is_empty(),
            Component::Delete { len, .. } => *len == 0,
        }
    }
}

/// Raised when an operation does not fit the text it is applied to.
///
/// Under a correct protocol this never happens; seeing it means a replica and
/// the server disagree about the base text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OperationError {
    #[error("component {index} out of range: position {pos}, length {len}, text length {text_len}")]
    OutOfRange {
        index: usize,
        pos: usize,
        len: usize,
        text_len: usize,
    },
}

/// An ordered, immutable list of components.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Operation {
    components: Vec<Component>,
}

impl Operation {
    /// Build an operation, dropping zero-length components.
    pub fn new(components: impl IntoIterator<Item = Component>) -> Self {
        Self {
            components: components.into_iter().filter(|c| !c.is_empty()).collect(),
        }
    }

    /// The empty operation.
    pub fn noop() -> Self {
        Self::default()
    }

    /// Single-component insert.
    pub fn insert(pos: usize, text: impl Into<String>) -> Self {
        Self::new([Component::Insert {
            pos,
            text: text.into(),
        }])
    }

    /// Single-component delete.
    pub fn delete(pos: usize, len: usize) -> Self {
        Self::new([Component::Delete { pos, len }])
    }

    pub fn is_noop(&self) -> bool {
        self.components.is_empty()
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    pub fn into_components(self) -> Vec<Component> {
        self.components
    }

    /// Apply to `text`, returning the edited copy.
    ///
    /// Fails without touching anything if any component falls outside the
    /// text as it stands when that component is reached.
    pub fn apply_to(&self, text: &str) -> Result<String, OperationError> {
        let mut out = text.to_owned();
        let mut text_len = out.chars().count();

        for (index, component) in self.components.iter().enumerate() {
            match component {
                Component::Insert { pos, text } => {
                    let at = byte_index(&out, *pos).ok_or(OperationError::OutOfRange {
                        index,
                        pos: *pos,
                        len: 0,
                        text_len,
                    })?;
                    out.insert_str(at, text);
                    text_len += text.chars().count();
                }
                Component::Delete { pos, len } => {
                    let out_of_range = OperationError::OutOfRange {
                        index,
                        pos: *pos,
                        len: *len,
                        text_len,
                    };
                    let end = pos
                        .checked_add(*len)
                        .filter(|end| *end <= text_len)
                        .ok_or_else(|| out_of_range.clone())?;
                    let start_byte = byte_index(&out, *pos).ok_or_else(|| out_of_range.clone())?;
                    let end_byte = byte_index(&out, end).ok_or(out_of_range)?;
                    out.replace_range(start_byte..end_byte, "");
                    text_len -= len;
                }
            }
        }

        Ok(out)
    }

    /// One operation equivalent to applying `self` and then `next`.
    ///
    /// `next` must be expressed against the text `self` produces.
    pub fn compose(&self, next: &Operation) -> Operation {
        let composed = Spans::from_components(&self.components)
            .compose(&Spans::from_components(&next.components));
        Operation::new(composed.to_components())
    }

    /// Map a char offset in the base text to the text this operation
    /// produces.
    ///
    /// An offset inside a deleted range collapses to the start of that range.
    /// `side` decides whether an offset sitting exactly where text is inserted
    /// stays before it ([`Side::Left`]) or moves past it ([`Side::Right`]).
    pub fn transform_position(&self, pos: usize, side: Side) -> usize {
        if self.is_noop() {
            return pos;
        }
        Spans::from_components(&self.components).transform_position(pos, side)
    }

    /// Net change in text length, in chars.
    pub fn len_delta(&self) -> isize {
        self.components
            .iter()
            .map(|c| match c {
                Component::Insert { text, .. } => text.chars().count() as isize,
                Component::Delete { len, .. } => -(*len as isize),
            })
            .sum()
    }
}

impl From<Component> for Operation {
    fn from(component: Component) -> Self {
        Operation::new([component])
    }
}

/// Byte offset of the char at `char_pos`, or `text.len()` when `char_pos`
/// is one past the last char.
pub(crate) fn byte_index(text: &str, char_pos: usize) -> Option<usize> {
    text.char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .nth(char_pos)
}
