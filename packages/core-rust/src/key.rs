//! Canonical document keys.
//!
//! Grammar: `key = wiki ":" 1*( space "." ) document [ ":" locale ]`.
//!
//! Each segment type is followed by its own separator, so distinct
//! `(reference, locale)` pairs never render to the same key as long as the
//! raw segments do not themselves contain `:` or `.`. That restriction is
//! enforced where references are built; segments are not escaped here.

use crate::reference::{DocumentReference, EntityType};

/// Renders the canonical key of a document in the given locale.
///
/// An absent or empty locale denotes the default translation.
///
/// ```
/// use dynastore_core::key::canonical_key;
/// use dynastore_core::reference::DocumentReference;
///
/// let home = DocumentReference::new("xwiki", ["Main"], "WebHome");
/// assert_eq!(canonical_key(&home, None), "xwiki:Main.WebHome");
/// assert_eq!(canonical_key(&home, Some("fr")), "xwiki:Main.WebHome:fr");
/// ```
#[must_use]
pub fn canonical_key(reference: &DocumentReference, locale: Option<&str>) -> String {
    let mut key = String::new();
    for (kind, segment) in reference.segments() {
        key.push_str(segment);
        match kind {
            EntityType::Wiki => key.push(':'),
            EntityType::Space => key.push('.'),
            EntityType::Document => {}
        }
    }

    if let Some(locale) = locale.filter(|l| !l.is_empty()) {
        key.push(':');
        key.push_str(locale);
    }
    key
}
