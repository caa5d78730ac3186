//! One live document per URL.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use tracing::{debug, trace};

use super::{Document, DocumentEvent, LoaderContext};
use crate::transport::DocumentUrl;

pub type DocumentPtr = Rc<RefCell<Document>>;

/// Hands out shared documents and keeps them loading.
///
/// The factory only holds weak references: a document lives as long as some
/// view holds it, and dropping the last handle cancels its loading session.
pub struct DocumentFactory {
    context: LoaderContext,
    documents: HashMap<DocumentUrl, Weak<RefCell<Document>>>,
}

impl DocumentFactory {
    pub fn new(context: LoaderContext) -> Self {
        Self {
            context,
            documents: HashMap::new(),
        }
    }

    /// The live document for `url`, or a new one that has already started
    /// loading.
    pub fn load(&mut self, url: &DocumentUrl) -> DocumentPtr {
        if let Some(doc) = self.documents.get(url).and_then(Weak::upgrade) {
            trace!(%url, "Reusing live document");
            return doc;
        }

        debug!(%url, "Creating document");
        let doc = Rc::new(RefCell::new(Document::new(url.clone(), self.context.clone())));
        self.documents.insert(url.clone(), Rc::downgrade(&doc));
        doc.borrow_mut().start();
        doc
    }

    /// Live document for `url`, without creating one.
    pub fn get(&self, url: &DocumentUrl) -> Option<DocumentPtr> {
        self.documents.get(url).and_then(Weak::upgrade)
    }

    /// Poll every live document and forget the dropped ones.
    pub fn poll_all(&mut self) -> Vec<(DocumentUrl, DocumentEvent)> {
        let mut events = Vec::new();
        self.documents.retain(|url, weak| match weak.upgrade() {
            Some(doc) => {
                events.extend(
                    doc.borrow_mut()
                        .poll()
                        .into_iter()
                        .map(|event| (url.clone(), event)),
                );
                true
            }
            None => {
                trace!(%url, "Forgetting dropped document");
                false
            }
        });
        events
    }

    /// Number of documents still alive.
    pub fn len(&self) -> usize {
        self.documents
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
