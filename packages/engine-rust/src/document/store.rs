//! Document persistence.
//!
//! Saving a document compiles its own class, compiles or extends the type of
//! every class its objects use, converts the objects into record instances,
//! and writes one document record with its attachment content, all in a
//! single session. The compiled types reach the registry only after that
//! session commits. Loading reverses the pipeline against the current
//! registry.

use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use dynastore_core::{
    canonical_key, resolve_type_name, DocumentReference, SchemaDefinition, StoreError,
    StoreResult,
};

use crate::attachment::AttachmentContentStore;
use crate::classes::{ClassProvider, OverridingClassProvider};
use crate::compiler::{SchemaCompiler, StagedTypes};
use crate::config::DocumentConfig;
use crate::converter::{from_bag, to_bag, RecordInstance};
use crate::object_list::{self, ObjectGroups};
use crate::registry::{GeneratedRecordType, TypeRegistry};
use crate::storage::{decode_record, encode_record, finish, DurableStore, StoreSession, DOCUMENTS_TABLE};

use super::{Attachment, Document, DocumentCache, DocumentObject};

const DOCUMENT: &str = "document";

#[derive(Debug, Serialize, Deserialize)]
struct DocumentRecord {
    reference: DocumentReference,
    locale: Option<String>,
    default_locale: String,
    title: String,
    content: String,
    author: String,
    syntax: String,
    hidden: bool,
    created_at: i64,
    updated_at: i64,
    class: Option<SchemaDefinition>,
    objects: Vec<RecordInstance>,
    attachments: Vec<AttachmentRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct AttachmentRecord {
    filename: String,
    mime_type: String,
    size: u64,
}

/// Canonical key of a document translation. An empty locale is the default
/// translation.
#[must_use]
pub fn document_key(reference: &DocumentReference, locale: Option<&str>) -> String {
    canonical_key(reference, locale.filter(|l| !l.is_empty()))
}

/// Only the attachment list of a stored document record.
#[derive(Deserialize)]
struct StoredAttachments {
    attachments: Vec<AttachmentRecord>,
}

/// Lookup of the record types a stored document was written with.
#[derive(Clone, Copy)]
enum TypeLookup {
    /// Through the registry, caching what is loaded.
    Registry,
    /// Straight from the session, seeing its uncommitted writes.
    Session,
}

/// Outcome of [`DocumentStore::save_in`].
///
/// Record types compiled by the save stay out of the registry until
/// [`publish`](Self::publish) is called after the session commits. Drop it
/// instead when the session is rolled back.
#[must_use]
#[derive(Debug)]
pub struct SavedDocument {
    key: String,
    staged: StagedTypes,
}

impl SavedDocument {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Record type versions the save compiled and wrote.
    pub fn staged_types(&self) -> &StagedTypes {
        &self.staged
    }

    /// Makes the compiled record types visible through `compiler`'s
    /// registry.
    pub fn publish(self, compiler: &SchemaCompiler) {
        compiler.publish(self.staged);
    }
}

/// Saves, loads and deletes documents.
pub struct DocumentStore {
    store: Arc<dyn DurableStore>,
    compiler: SchemaCompiler,
    classes: Arc<dyn ClassProvider>,
    attachments: AttachmentContentStore,
    cache: Arc<DocumentCache>,
}

impl DocumentStore {
    /// Creates a store. With a non-zero cache capacity the document cache
    /// is registered as a redefinition observer on the compiler's registry.
    #[must_use]
    pub fn new(
        store: Arc<dyn DurableStore>,
        compiler: SchemaCompiler,
        classes: Arc<dyn ClassProvider>,
        attachments: AttachmentContentStore,
        config: &DocumentConfig,
    ) -> Self {
        let cache = Arc::new(DocumentCache::new(config.cache_capacity));
        if config.cache_capacity > 0 {
            compiler.registry().register_observer(cache.clone());
        }
        Self {
            store,
            compiler,
            classes,
            attachments,
            cache,
        }
    }

    #[must_use]
    pub fn attachments(&self) -> &AttachmentContentStore {
        &self.attachments
    }

    #[must_use]
    pub fn cache(&self) -> &DocumentCache {
        &self.cache
    }

    /// Saves `document` with the content of its attachments in one session.
    ///
    /// # Errors
    ///
    /// - [`StoreError::MalformedSchema`] if the document's class is named
    ///   after another document
    /// - [`StoreError::TypeMismatch`] if an object value disagrees with its
    ///   class
    /// - [`StoreError::Io`] if the session or an attachment write fails
    pub async fn save(&self, document: &Document) -> StoreResult<()> {
        let mut session = self.store.begin_session().await?;
        let result = self.save_in(session.as_mut(), document).await;
        let saved = finish(session, result).await?;
        let key = saved.key().to_string();
        saved.publish(&self.compiler);
        self.cache.invalidate(&key);
        Ok(())
    }

    /// Writes the document record, its attachment content and any new
    /// record types into `session`.
    ///
    /// Saving the default translation also deletes the content of
    /// attachments the stored record lists but `document` no longer does.
    ///
    /// # Errors
    ///
    /// See [`save`](Self::save).
    pub async fn save_in(
        &self,
        session: &mut dyn StoreSession,
        document: &Document,
    ) -> StoreResult<SavedDocument> {
        let key = document_key(&document.reference, document.locale());
        let mut staged = StagedTypes::new();

        if let Some(class) = &document.class {
            let own = document.class_type_name();
            if class.type_name != own {
                return Err(StoreError::MalformedSchema {
                    type_name: class.type_name.clone(),
                    reason: format!("class defined by {key} must be named {own}"),
                });
            }
            self.compiler.compile(session, &mut staged, class).await?;
        }

        let classes = OverridingClassProvider::new(
            self.classes.as_ref(),
            &document.reference,
            document.class.as_ref(),
        );
        let mut by_class: IndexMap<&DocumentReference, Vec<&DocumentObject>> = IndexMap::new();
        for object in &document.objects {
            by_class.entry(&object.class).or_default().push(object);
        }

        let mut groups = ObjectGroups::new();
        for (class, mut objects) in by_class {
            objects.sort_by_key(|o| o.number);
            let mut instances = Vec::with_capacity(objects.len());
            let mut latest = None;
            for object in objects {
                let ty = self
                    .compiler
                    .compile_for_object(session, &mut staged, class, &object.properties, &classes)
                    .await?;
                let instance = from_bag(&object.properties, &ty)?
                    .with_key(format!("{key}/{}/{}", ty.type_name(), object.number));
                instances.push(instance);
                latest = Some(ty);
            }
            if let Some(ty) = latest {
                groups.insert(ty.type_name().to_string(), instances);
            }
        }
        self.compiler.persist_staged(session, &staged).await?;
        self.save_attachments_in(session, document, &key).await?;

        let record = DocumentRecord {
            reference: document.reference.clone(),
            locale: document.locale().map(str::to_string),
            default_locale: document.default_locale.clone(),
            title: document.title.clone(),
            content: document.content.clone(),
            author: document.author.clone(),
            syntax: document.syntax.clone(),
            hidden: document.hidden,
            created_at: document.created_at,
            updated_at: document.updated_at,
            class: document.class.clone(),
            objects: object_list::encode(groups)?,
            attachments: document
                .attachments
                .iter()
                .map(|a| AttachmentRecord {
                    filename: a.filename.clone(),
                    mime_type: a.mime_type.clone(),
                    size: a.size,
                })
                .collect(),
        };
        session
            .put(DOCUMENTS_TABLE, &key, encode_record(DOCUMENT, &record)?)
            .await?;
        debug!(key = %key, objects = record.objects.len(), types = staged.len(), "saved document");
        Ok(SavedDocument { key, staged })
    }

    /// Loads a document translation, or `None` if it was never saved.
    ///
    /// # Errors
    ///
    /// - [`StoreError::UnknownType`] if an object's type is not stored
    /// - [`StoreError::TypeMismatch`] if a stored value disagrees with its
    ///   class's current schema
    /// - [`StoreError::Corrupt`] or [`StoreError::Io`] on storage failures
    pub async fn load(
        &self,
        reference: &DocumentReference,
        locale: Option<&str>,
    ) -> StoreResult<Option<Document>> {
        let key = document_key(reference, locale);
        if let Some(document) = self.cache.get(&key, self.compiler.registry()) {
            return Ok(Some(document));
        }
        let epoch = self.cache.epoch();
        let mut session = self.store.begin_session().await?;
        let result = self.read(session.as_mut(), &key, TypeLookup::Registry).await;
        let Some((document, types)) = finish(session, result).await? else {
            return Ok(None);
        };
        let types: Vec<&GeneratedRecordType> = types.iter().map(AsRef::as_ref).collect();
        self.cache.insert(key, document.clone(), &types, epoch);
        Ok(Some(document))
    }

    /// [`load`](Self::load) as a step of an enclosing session, bypassing
    /// the cache. Record types are read from the session, so a document
    /// saved earlier in it decodes against the types that save wrote.
    ///
    /// # Errors
    ///
    /// See [`load`](Self::load).
    pub async fn load_in(
        &self,
        session: &mut dyn StoreSession,
        reference: &DocumentReference,
        locale: Option<&str>,
    ) -> StoreResult<Option<Document>> {
        let key = document_key(reference, locale);
        Ok(self
            .read(session, &key, TypeLookup::Session)
            .await?
            .map(|(document, _)| document))
    }

    /// Deletes a document translation. Deleting the default translation
    /// also deletes its attachment content.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Corrupt`] or [`StoreError::Io`] on storage
    /// failures.
    pub async fn delete(
        &self,
        reference: &DocumentReference,
        locale: Option<&str>,
    ) -> StoreResult<bool> {
        let mut session = self.store.begin_session().await?;
        let result = self.delete_in(session.as_mut(), reference, locale).await;
        let removed = finish(session, result).await?;
        let key = document_key(reference, locale);
        self.cache.invalidate(&key);
        if removed {
            debug!(key = %key, "deleted document");
        }
        Ok(removed)
    }

    /// [`delete`](Self::delete) as a step of an enclosing session.
    ///
    /// # Errors
    ///
    /// See [`delete`](Self::delete).
    pub async fn delete_in(
        &self,
        session: &mut dyn StoreSession,
        reference: &DocumentReference,
        locale: Option<&str>,
    ) -> StoreResult<bool> {
        let key = document_key(reference, locale);
        let Some(stored) = Self::stored_attachments(session, &key).await? else {
            return Ok(false);
        };
        session.delete(DOCUMENTS_TABLE, &key).await?;
        if locale.filter(|l| !l.is_empty()).is_none() {
            for attachment in stored {
                self.attachments
                    .delete_in(session, reference, &attachment.filename)
                    .await?;
            }
        }
        Ok(true)
    }

    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the lookup fails.
    pub async fn exists(
        &self,
        reference: &DocumentReference,
        locale: Option<&str>,
    ) -> StoreResult<bool> {
        let key = document_key(reference, locale);
        let mut session = self.store.begin_session().await?;
        let result = session.get(DOCUMENTS_TABLE, &key).await;
        Ok(finish(session, result).await?.is_some())
    }

    async fn save_attachments_in(
        &self,
        session: &mut dyn StoreSession,
        document: &Document,
        key: &str,
    ) -> StoreResult<()> {
        if document.locale().is_none() {
            let stored = Self::stored_attachments(session, key).await?;
            for removed in stored
                .iter()
                .flatten()
                .filter(|a| document.attachment(&a.filename).is_none())
            {
                debug!(key = %key, filename = %removed.filename, "deleting removed attachment");
                self.attachments
                    .delete_in(session, &document.reference, &removed.filename)
                    .await?;
            }
        }
        for attachment in &document.attachments {
            if let Some(content) = &attachment.content {
                let mut source: &[u8] = content;
                self.attachments
                    .save_in(session, &document.reference, &attachment.filename, &mut source)
                    .await?;
            }
        }
        Ok(())
    }

    async fn stored_attachments(
        session: &mut dyn StoreSession,
        key: &str,
    ) -> StoreResult<Option<Vec<AttachmentRecord>>> {
        let Some(bytes) = session.get(DOCUMENTS_TABLE, key).await? else {
            return Ok(None);
        };
        let stored: StoredAttachments = decode_record(DOCUMENT, &bytes)?;
        Ok(Some(stored.attachments))
    }

    async fn read(
        &self,
        session: &mut dyn StoreSession,
        key: &str,
        lookup: TypeLookup,
    ) -> StoreResult<Option<(Document, Vec<Arc<GeneratedRecordType>>)>> {
        let Some(bytes) = session.get(DOCUMENTS_TABLE, key).await? else {
            return Ok(None);
        };
        let record: DocumentRecord = decode_record(DOCUMENT, &bytes)?;

        let mut objects = Vec::with_capacity(record.objects.len());
        let mut types = Vec::new();
        for (type_name, instances) in object_list::decode(record.objects) {
            let class = resolve_type_name(&type_name)?;
            let ty = match lookup {
                TypeLookup::Registry => self.compiler.registry().resolve(session, &type_name).await?,
                TypeLookup::Session => Arc::new(TypeRegistry::load_from(session, &type_name).await?),
            };
            let schema = match record.class.as_ref().filter(|_| class == record.reference) {
                Some(own) => own.clone(),
                None => match self.classes.class_schema(&class).await? {
                    Some(schema) => schema,
                    None => ty.schema(),
                },
            };
            for (position, instance) in instances.iter().enumerate() {
                let number = u32::try_from(position).map_err(|_| StoreError::Corrupt {
                    what: DOCUMENT,
                    reason: format!("more than {} objects of {type_name}", u32::MAX),
                })?;
                objects.push(DocumentObject {
                    class: class.clone(),
                    number,
                    properties: to_bag(instance, &schema)?,
                });
            }
            types.push(ty);
        }

        let document = Document {
            reference: record.reference,
            locale: record.locale,
            default_locale: record.default_locale,
            title: record.title,
            content: record.content,
            author: record.author,
            syntax: record.syntax,
            hidden: record.hidden,
            created_at: record.created_at,
            updated_at: record.updated_at,
            class: record.class,
            objects,
            attachments: record
                .attachments
                .into_iter()
                .map(|a| Attachment {
                    filename: a.filename,
                    mime_type: a.mime_type,
                    size: a.size,
                    content: None,
                })
                .collect(),
        };
        Ok(Some((document, types)))
    }
}
