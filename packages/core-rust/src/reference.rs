//! Hierarchical document references and their type-name form.
//!
//! A [`DocumentReference`] is the chain `wiki → space+ → document`. Class
//! documents double as the definition of a dynamic class, so the same chain
//! also names the class's generated record type via [`type_name`]:
//! every segment is [escaped](crate::escape::escape) and joined with `.`.
//! Escaped segments never contain `.`, so [`resolve_type_name`] splits
//! unambiguously.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};
use crate::escape::{escape, unescape};

/// Kind of a segment in a reference chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityType {
    /// Root segment.
    Wiki,
    /// Zero or more nested spaces; canonical keys require at least one.
    Space,
    /// Leaf segment.
    Document,
}

/// Fully-resolved reference to a document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentReference {
    /// Name of the wiki the document lives in.
    pub wiki: String,
    /// Space chain from outermost to innermost.
    pub spaces: Vec<String>,
    /// Name of the document itself.
    pub name: String,
}

impl DocumentReference {
    /// Creates a reference from its segments.
    pub fn new(
        wiki: impl Into<String>,
        spaces: impl IntoIterator<Item = impl Into<String>>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            wiki: wiki.into(),
            spaces: spaces.into_iter().map(Into::into).collect(),
            name: name.into(),
        }
    }

    /// Walks the chain from the root, tagging each segment with its type.
    pub fn segments(&self) -> impl Iterator<Item = (EntityType, &str)> {
        std::iter::once((EntityType::Wiki, self.wiki.as_str()))
            .chain(self.spaces.iter().map(|s| (EntityType::Space, s.as_str())))
            .chain(std::iter::once((EntityType::Document, self.name.as_str())))
    }
}

impl fmt::Display for DocumentReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&crate::key::canonical_key(self, None))
    }
}

/// Serializes a reference into the name of its generated record type.
///
/// ```
/// use dynastore_core::reference::{type_name, DocumentReference};
///
/// let class = DocumentReference::new("xwiki", ["My Space"], "Blog.Post");
/// assert_eq!(type_name(&class), "xwiki.MyX20Space.BlogX2EPost");
/// ```
#[must_use]
pub fn type_name(reference: &DocumentReference) -> String {
    reference
        .segments()
        .map(|(_, segment)| escape(segment))
        .collect::<Vec<_>>()
        .join(".")
}

/// Resolves a type name produced by [`type_name`] back into its reference.
///
/// # Errors
///
/// Returns [`StoreError::MalformedIdentifier`] if the name has fewer than
/// three segments or a segment does not unescape.
pub fn resolve_type_name(name: &str) -> StoreResult<DocumentReference> {
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() < 3 {
        return Err(StoreError::MalformedIdentifier {
            identifier: name.to_string(),
        });
    }

    let wiki = unescape(parts[0])?;
    let doc = unescape(parts[parts.len() - 1])?;
    let spaces = parts[1..parts.len() - 1]
        .iter()
        .map(|s| unescape(s))
        .collect::<StoreResult<Vec<_>>>()?;

    Ok(DocumentReference {
        wiki,
        spaces,
        name: doc,
    })
}
