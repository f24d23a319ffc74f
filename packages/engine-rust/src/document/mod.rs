//! Documents and their owned parts.
//!
//! A [`Document`] owns its objects and attachments outright; saving a
//! document stores exactly those, with no graph walking.

pub mod cache;
pub mod links;
pub mod store;

use bytes::Bytes;

use dynastore_core::{type_name, DocumentReference, PropertyBag, SchemaDefinition, Value};

pub use cache::DocumentCache;
pub use links::{DocumentLock, LinkAndLockStore};
pub use store::{DocumentStore, SavedDocument};

/// A document with its class definition, objects and attachments.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub reference: DocumentReference,
    /// Translation locale. `None` for the default translation.
    pub locale: Option<String>,
    pub default_locale: String,
    pub title: String,
    pub content: String,
    pub author: String,
    /// Markup syntax identifier of `content`.
    pub syntax: String,
    pub hidden: bool,
    /// Milliseconds since the Unix epoch.
    pub created_at: i64,
    pub updated_at: i64,
    /// Class this document defines, if any. Its type name must be the
    /// document's own type name.
    pub class: Option<SchemaDefinition>,
    pub objects: Vec<DocumentObject>,
    pub attachments: Vec<Attachment>,
}

impl Document {
    #[must_use]
    pub fn new(reference: DocumentReference) -> Self {
        Self {
            reference,
            locale: None,
            default_locale: String::new(),
            title: String::new(),
            content: String::new(),
            author: String::new(),
            syntax: String::new(),
            hidden: false,
            created_at: 0,
            updated_at: 0,
            class: None,
            objects: Vec::new(),
            attachments: Vec::new(),
        }
    }

    /// Type name of the class this document defines.
    #[must_use]
    pub fn class_type_name(&self) -> String {
        type_name(&self.reference)
    }

    /// Locale as used in the canonical key.
    #[must_use]
    pub fn locale(&self) -> Option<&str> {
        self.locale.as_deref().filter(|l| !l.is_empty())
    }

    /// Objects of `class`, in storage order.
    pub fn objects_of<'a>(
        &'a self,
        class: &'a DocumentReference,
    ) -> impl Iterator<Item = &'a DocumentObject> {
        self.objects.iter().filter(move |o| o.class == *class)
    }

    pub fn attachment(&self, filename: &str) -> Option<&Attachment> {
        self.attachments.iter().find(|a| a.filename == filename)
    }
}

/// An instance of a class attached to a document.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentObject {
    pub class: DocumentReference,
    /// Position among the document's objects of the same class.
    pub number: u32,
    pub properties: PropertyBag,
}

impl DocumentObject {
    #[must_use]
    pub fn new(class: DocumentReference, number: u32) -> Self {
        let properties = PropertyBag::new(type_name(&class));
        Self {
            class,
            number,
            properties,
        }
    }

    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: Value) -> Self {
        self.properties.set(name, value);
        self
    }
}

/// File attached to a document.
#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    pub filename: String,
    pub mime_type: String,
    /// Content length in bytes.
    pub size: u64,
    /// Content to store with the next save. Loaded documents leave this
    /// empty; content is read through the attachment store.
    pub content: Option<Bytes>,
}

impl Attachment {
    /// Attachment carrying new content.
    pub fn with_content(
        filename: impl Into<String>,
        mime_type: impl Into<String>,
        content: impl Into<Bytes>,
    ) -> Self {
        let content = content.into();
        Self {
            filename: filename.into(),
            mime_type: mime_type.into(),
            size: content.len() as u64,
            content: Some(content),
        }
    }
}
