//! Retain/insert/delete runs: the form the algebra actually works in.
//!
//! A `Spans` value walks the base text from offset 0. Whatever it does not
//! mention at the end is retained, so two span lists never need to agree on
//! the base length to be composed or transformed. Only `Operation::apply_to`
//! checks bounds.
//!
//! Canonical form: no zero-length runs, adjacent runs of the same kind merged,
//! a delete always ahead of an insert at the same point, no trailing retain.

use crate::operation::Component;
use crate::transform::Side;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Span {
    Retain(usize),
    Delete(usize),
    Insert(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Spans {
    spans: Vec<Span>,
}

impl Spans {
    pub(crate) fn retain(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        if let Some(Span::Retain(r)) = self.spans.last_mut() {
            *r = r.saturating_add(n);
            return;
        }
        self.spans.push(Span::Retain(n));
    }

    pub(crate) fn delete(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        if let Some(Span::Delete(d)) = self.spans.last_mut() {
            *d = d.saturating_add(n);
            return;
        }
        let len = self.spans.len();
        if matches!(self.spans.last(), Some(Span::Insert(_))) {
            if len >= 2 {
                if let Span::Delete(d) = &mut self.spans[len - 2] {
                    *d = d.saturating_add(n);
                    return;
                }
            }
            self.spans.insert(len - 1, Span::Delete(n));
            return;
        }
        self.spans.push(Span::Delete(n));
    }

    pub(crate) fn insert(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if let Some(Span::Insert(s)) = self.spans.last_mut() {
            s.push_str(text);
            return;
        }
        self.spans.push(Span::Insert(text.to_owned()));
    }

    fn trimmed(mut self) -> Self {
        while matches!(self.spans.last(), Some(Span::Retain(_))) {
            self.spans.pop();
        }
        self
    }

    #[cfg(test)]
    pub(crate) fn as_slice(&self) -> &[Span] {
        &self.spans
    }

    /// Fold sequential components into one span list.
    pub(crate) fn from_components(components: &[Component]) -> Spans {
        components.iter().fold(Spans::default(), |acc, component| {
            let mut single = Spans::default();
            match component {
                Component::Insert { pos, text } => {
                    single.retain(*pos);
                    single.insert(text);
                }
                Component::Delete { pos, len } => {
                    single.retain(*pos);
                    single.delete(*len);
                }
            }
            if acc.spans.is_empty() {
                single.trimmed()
            } else {
                acc.compose(&single)
            }
        })
    }

    /// Back to sequential components, left to right.
    pub(crate) fn to_components(&self) -> Vec<Component> {
        let mut cursor: usize = 0;
        let mut out = Vec::with_capacity(self.spans.len());
        for span in &self.spans {
            match span {
                Span::Retain(n) => cursor = cursor.saturating_add(*n),
                Span::Delete(n) => out.push(Component::Delete {
                    pos: cursor,
                    len: *n,
                }),
                Span::Insert(s) => {
                    out.push(Component::Insert {
                        pos: cursor,
                        text: s.clone(),
                    });
                    cursor = cursor.saturating_add(char_len(s));
                }
            }
        }
        out
    }

    /// `self` followed by `next`.
    pub(crate) fn compose(&self, next: &Spans) -> Spans {
        let mut out = Spans::default();
        let mut a = SpanCursor::new(&self.spans);
        let mut b = SpanCursor::new(&next.spans);

        loop {
            match (a.head(), b.head()) {
                (Head::End, Head::End) => break,
                (Head::Delete(n), _) => {
                    out.delete(n);
                    a.advance(n);
                }
                (_, Head::Insert(s)) => {
                    out.insert(s);
                    b.advance(char_len(s));
                }
                (Head::End, Head::Retain(n)) => {
                    out.retain(n);
                    b.advance(n);
                }
                (Head::End, Head::Delete(n)) => {
                    out.delete(n);
                    b.advance(n);
                }
                (Head::Retain(n), Head::End) => {
                    out.retain(n);
                    a.advance(n);
                }
                (Head::Insert(s), Head::End) => {
                    out.insert(s);
                    a.advance(char_len(s));
                }
                (Head::Retain(x), Head::Retain(y)) => {
                    let n = x.min(y);
                    out.retain(n);
                    a.advance(n);
                    b.advance(n);
                }
                (Head::Retain(x), Head::Delete(y)) => {
                    let n = x.min(y);
                    out.delete(n);
                    a.advance(n);
                    b.advance(n);
                }
                (Head::Insert(s), Head::Retain(y)) => {
                    let n = char_len(s).min(y);
                    out.insert(char_prefix(s, n));
                    a.advance(n);
                    b.advance(n);
                }
                (Head::Insert(s), Head::Delete(y)) => {
                    // `next` deletes text `self` inserted: both vanish.
                    let n = char_len(s).min(y);
                    a.advance(n);
                    b.advance(n);
                }
            }
        }

        out.trimmed()
    }

    /// Rebase `self` so it applies after `other`. Both start from the same
    /// text.
    pub(crate) fn transform(&self, other: &Spans, side: Side) -> Spans {
        let mut out = Spans::default();
        let mut a = SpanCursor::new(&self.spans);
        let mut b = SpanCursor::new(&other.spans);

        loop {
            match (a.head(), b.head()) {
                (Head::End, Head::End) => break,
                (Head::Insert(s), Head::Insert(_)) if side == Side::Left => {
                    out.insert(s);
                    a.advance(char_len(s));
                }
                (Head::Insert(_), Head::Insert(t)) => {
                    let n = char_len(t);
                    out.retain(n);
                    b.advance(n);
                }
                (Head::Insert(s), _) => {
                    out.insert(s);
                    a.advance(char_len(s));
                }
                (_, Head::Insert(t)) => {
                    let n = char_len(t);
                    out.retain(n);
                    b.advance(n);
                }
                // `self` is done; whatever `other` still does is already
                // reflected in the text `out` will run against.
                (Head::End, _) => break,
                (Head::Retain(n), Head::End) => {
                    out.retain(n);
                    a.advance(n);
                }
                (Head::Delete(n), Head::End) => {
                    out.delete(n);
                    a.advance(n);
                }
                (Head::Retain(x), Head::Retain(y)) => {
                    let n = x.min(y);
                    out.retain(n);
                    a.advance(n);
                    b.advance(n);
                }
                (Head::Retain(x), Head::Delete(y)) => {
                    let n = x.min(y);
                    a.advance(n);
                    b.advance(n);
                }
                (Head::Delete(x), Head::Retain(y)) => {
                    let n = x.min(y);
                    out.delete(n);
                    a.advance(n);
                    b.advance(n);
                }
                (Head::Delete(x), Head::Delete(y)) => {
                    // Already gone on the other side.
                    let n = x.min(y);
                    a.advance(n);
                    b.advance(n);
                }
            }
        }

        out.trimmed()
    }

    pub(crate) fn transform_position(&self, pos: usize, side: Side) -> usize {
        let mut old: usize = 0;
        let mut new: usize = 0;
        for span in &self.spans {
            match span {
                Span::Retain(n) => {
                    if old.saturating_add(*n) > pos {
                        return new.saturating_add(pos - old);
                    }
                    old = old.saturating_add(*n);
                    new = new.saturating_add(*n);
                }
                Span::Delete(n) => {
                    if old.saturating_add(*n) > pos {
                        return new;
                    }
                    old = old.saturating_add(*n);
                }
                Span::Insert(s) => {
                    if old == pos && side == Side::Left {
                        return new;
                    }
                    new = new.saturating_add(char_len(s));
                }
            }
        }
        new.saturating_add(pos.saturating_sub(old))
    }
}

/// What a cursor has left of its current run.
#[derive(Debug, Clone, Copy)]
enum Head<'a> {
    Retain(usize),
    Delete(usize),
    Insert(&'a str),
    End,
}

/// Walks a span list, splitting runs as the other side demands.
struct SpanCursor<'a> {
    spans: &'a [Span],
    index: usize,
    // Chars consumed for retain/delete, bytes consumed for insert.
    offset: usize,
}

impl<'a> SpanCursor<'a> {
    fn new(spans: &'a [Span]) -> Self {
        Self {
            spans,
            index: 0,
            offset: 0,
        }
    }

    fn head(&self) -> Head<'a> {
        match self.spans.get(self.index) {
            None => Head::End,
            Some(Span::Retain(n)) => Head::Retain(n - self.offset),
            Some(Span::Delete(n)) => Head::Delete(n - self.offset),
            Some(Span::Insert(s)) => Head::Insert(&s[self.offset..]),
        }
    }

    /// Consume `n` units of the current run. `n` never exceeds what `head`
    /// reported.
    fn advance(&mut self, n: usize) {
        let done = match self.spans.get(self.index) {
            None => return,
            Some(Span::Retain(len)) | Some(Span::Delete(len)) => {
                self.offset += n;
                self.offset >= *len
            }
            Some(Span::Insert(s)) => {
                let rest = &s[self.offset..];
                self.offset += rest.char_indices().nth(n).map_or(rest.len(), |(i, _)| i);
                self.offset >= s.len()
            }
        };
        if done {
            self.index += 1;
            self.offset = 0;
        }
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn char_prefix(s: &str, n: usize) -> &str {
    match s.char_indices().nth(n) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}
