//! Minimal term and statement model.
//!
//! The store works on integer term identifiers; the richer RDF value model
//! lives outside this crate. These types are the data carried across the
//! interning boundary and returned by statement cursors.

/// Identifier assigned to an interned term.
///
/// Identifiers are positive; `0` is reserved for the default graph and
/// never names a stored term.
pub type TermId = i32;

/// The context identifier of the default graph.
pub const NO_CONTEXT: TermId = 0;

/// Sentinel for a term that has no identifier (yet). Never persisted.
pub const UNKNOWN_ID: TermId = i32::MAX;

/// An RDF term: IRI, blank node, or literal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Term {
    /// An IRI reference.
    Iri(String),
    /// A blank node, identified by its local label.
    Blank(String),
    /// A literal with an optional language tag or datatype IRI.
    Literal {
        /// The lexical form.
        label: String,
        /// Language tag, mutually exclusive with `datatype` in practice.
        lang: Option<String>,
        /// Datatype IRI.
        datatype: Option<String>,
    },
}

impl Term {
    /// Creates an IRI term.
    pub fn iri(value: impl Into<String>) -> Self {
        Term::Iri(value.into())
    }

    /// Creates a blank node term.
    pub fn blank(label: impl Into<String>) -> Self {
        Term::Blank(label.into())
    }

    /// Creates a plain literal.
    pub fn literal(label: impl Into<String>) -> Self {
        Term::Literal {
            label: label.into(),
            lang: None,
            datatype: None,
        }
    }

    /// Creates a language-tagged literal.
    pub fn literal_lang(label: impl Into<String>, lang: impl Into<String>) -> Self {
        Term::Literal {
            label: label.into(),
            lang: Some(lang.into()),
            datatype: None,
        }
    }

    /// Creates a typed literal.
    pub fn literal_typed(label: impl Into<String>, datatype: impl Into<String>) -> Self {
        Term::Literal {
            label: label.into(),
            lang: None,
            datatype: Some(datatype.into()),
        }
    }

    /// Returns `true` for terms usable in the subject or context position.
    pub fn is_resource(&self) -> bool {
        matches!(self, Term::Iri(_) | Term::Blank(_))
    }

    /// Returns `true` for IRI terms, the only kind usable as a predicate.
    pub fn is_iri(&self) -> bool {
        matches!(self, Term::Iri(_))
    }
}

/// A complete statement: three terms plus an optional named context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quad {
    /// Subject resource.
    pub subject: Term,
    /// Predicate IRI.
    pub predicate: Term,
    /// Object term.
    pub object: Term,
    /// Context resource, `None` for the default graph.
    pub context: Option<Term>,
}

impl Quad {
    /// Assembles a quad.
    pub fn new(subject: Term, predicate: Term, object: Term, context: Option<Term>) -> Self {
        Self {
            subject,
            predicate,
            object,
            context,
        }
    }
}

/// The four identifiers of a stored statement, in canonical field order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QuadIds {
    /// Subject identifier, never 0.
    pub subject: TermId,
    /// Predicate identifier, never 0.
    pub predicate: TermId,
    /// Object identifier, never 0.
    pub object: TermId,
    /// Context identifier, 0 for the default graph.
    pub context: TermId,
}

impl QuadIds {
    /// Assembles an identifier quad.
    pub fn new(subject: TermId, predicate: TermId, object: TermId, context: TermId) -> Self {
        Self {
            subject,
            predicate,
            object,
            context,
        }
    }
}
