use async_trait::async_trait;
use lopdf::{Document, Object, ObjectId};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Page attributes a page may inherit from its ancestors in the page tree.
const INHERITED: [&[u8]; 4] = [b"MediaBox", b"CropBox", b"Resources", b"Rotate"];

/// Concatenates PDF files, in the given order, into one PDF.
#[async_trait]
pub trait ArtifactMerger: Send + Sync {
    async fn merge(&self, inputs: &[PathBuf], output: &Path) -> Result<()>;
}

pub struct PdfMerger {
    documents: Vec<(String, Document)>,
}

impl PdfMerger {
    pub fn new() -> Self {
        Self {
            documents: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub async fn add_pdf(&mut self, path: &Path) -> Result<()> {
        let data = fs::read(path)
            .await
            .map_err(|e| Error::Merge(format!("failed to read PDF file {}: {}", path.display(), e)))?;

        let document = Document::load_mem(&data)
            .map_err(|e| Error::Merge(format!("failed to parse PDF file {}: {}", path.display(), e)))?;

        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown.pdf")
            .to_string();

        debug!("Loaded PDF with {} pages from {}", document.get_pages().len(), path.display());
        self.documents.push((filename, document));

        Ok(())
    }

    /// Builds the merged document without writing it.
    pub fn combine(&self) -> Result<Document> {
        let ((_, first), rest) = self
            .documents
            .split_first()
            .ok_or_else(|| Error::Merge("no PDFs added to merge".to_string()))?;

        let mut merged = first.clone();
        let mut all_page_ids = flatten_pages(&mut merged);
        let mut max_id = merged.max_id;

        for (filename, document) in rest {
            let mut doc_copy = document.clone();

            // Renumber objects to avoid conflicts
            doc_copy.renumber_objects_with(max_id + 1);
            max_id = doc_copy.max_id;

            let pages = flatten_pages(&mut doc_copy);
            debug!("Appending {} pages from {}", pages.len(), filename);

            merged.objects.extend(doc_copy.objects);
            all_page_ids.extend(pages);
        }
        merged.max_id = max_id;

        let pages_id = merged
            .catalog()
            .and_then(|catalog| catalog.get(b"Pages"))
            .and_then(Object::as_reference)
            .map_err(|e| Error::Merge(format!("first document has no page tree: {}", e)))?;

        for page_id in &all_page_ids {
            if let Ok(Object::Dictionary(page)) = merged.get_object_mut(*page_id) {
                page.set("Parent", Object::Reference(pages_id));
            }
        }

        let count = all_page_ids.len();
        let pages = merged
            .get_object_mut(pages_id)
            .and_then(Object::as_dict_mut)
            .map_err(|e| Error::Merge(format!("page tree root is not a dictionary: {}", e)))?;
        pages.set(
            "Kids",
            Object::Array(all_page_ids.into_iter().map(Object::Reference).collect()),
        );
        pages.set("Count", Object::Integer(count as i64));

        info!("Merged {} documents into {} pages", self.documents.len(), count);
        Ok(merged)
    }

    pub async fn save(&self, output_path: &Path) -> Result<()> {
        let mut document = if self.documents.len() == 1 {
            // A single document is written through unchanged
            self.documents[0].1.clone()
        } else {
            self.combine()?
        };
        let data = serialize(&mut document)?;

        fs::write(output_path, data).await.map_err(|e| {
            Error::Merge(format!(
                "failed to write merged PDF to {}: {}",
                output_path.display(),
                e
            ))
        })?;

        info!("Successfully merged {} PDFs into {}", self.documents.len(), output_path.display());
        Ok(())
    }
}

impl Default for PdfMerger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ArtifactMerger for PdfMerger {
    async fn merge(&self, inputs: &[PathBuf], output: &Path) -> Result<()> {
        let mut merger = PdfMerger::new();
        for input in inputs {
            merger.add_pdf(input).await?;
        }
        merger.save(output).await
    }
}

fn serialize(document: &mut Document) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    document
        .save_to(&mut data)
        .map_err(|e| Error::Merge(format!("failed to serialize merged PDF: {}", e)))?;
    Ok(data)
}

/// Returns the page ids in reading order after copying inherited attributes onto
/// each page, so pages keep their size and resources once reparented.
fn flatten_pages(document: &mut Document) -> Vec<ObjectId> {
    let page_ids: Vec<ObjectId> = document.get_pages().into_values().collect();

    for page_id in &page_ids {
        let mut inherited = Vec::new();
        for key in INHERITED {
            if let Some(value) = inherited_value(document, *page_id, key) {
                inherited.push((key.to_vec(), value));
            }
        }
        if let Ok(Object::Dictionary(page)) = document.get_object_mut(*page_id) {
            for (key, value) in inherited {
                page.set(key, value);
            }
        }
    }

    page_ids
}

fn inherited_value(document: &Document, page_id: ObjectId, key: &[u8]) -> Option<Object> {
    let page = document.get_dictionary(page_id).ok()?;
    if page.has(key) {
        return None;
    }
    let mut parent = page.get(b"Parent").and_then(Object::as_reference).ok();
    while let Some(node_id) = parent {
        let node = document.get_dictionary(node_id).ok()?;
        if let Ok(value) = node.get(key) {
            return Some(value.clone());
        }
        parent = node.get(b"Parent").and_then(Object::as_reference).ok();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use lopdf::dictionary;

    fn sample_pdf(pages: usize) -> Vec<u8> {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let kids: Vec<Object> = (0..pages)
            .map(|_| {
                doc.add_object(dictionary! {
                    "Type" => "Page",
                    "Parent" => pages_id,
                })
                .into()
            })
            .collect();
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => pages as i64,
                "MediaBox" => vec![0i64.into(), 0i64.into(), 595i64.into(), 842i64.into()],
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);

        let mut bytes = Vec::new();
        doc.save_to(&mut bytes).unwrap();
        bytes
    }

    #[tokio::test]
    async fn merges_pages_in_input_order() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.pdf");
        let b = dir.path().join("b.pdf");
        std::fs::write(&a, sample_pdf(1)).unwrap();
        std::fs::write(&b, sample_pdf(2)).unwrap();
        let output = dir.path().join("out.pdf");

        PdfMerger::new().merge(&[a, b], &output).await.unwrap();

        let merged = Document::load(&output).unwrap();
        let pages = merged.get_pages();
        assert_eq!(pages.len(), 3);
        for page_id in pages.values() {
            let page = merged.get_dictionary(*page_id).unwrap();
            assert!(page.has(b"MediaBox"));
        }
    }

    #[tokio::test]
    async fn single_input_is_written_through() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.pdf");
        std::fs::write(&a, sample_pdf(2)).unwrap();
        let output = dir.path().join("out.pdf");

        PdfMerger::new().merge(&[a], &output).await.unwrap();
        assert_eq!(Document::load(&output).unwrap().get_pages().len(), 2);
    }

    #[tokio::test]
    async fn unreadable_input_is_a_merge_error() {
        let dir = tempfile::tempdir().unwrap();
        let bogus = dir.path().join("bogus.pdf");
        std::fs::write(&bogus, b"not a pdf").unwrap();

        let err = PdfMerger::new()
            .merge(&[bogus], &dir.path().join("out.pdf"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Merge(_)));
    }

    #[test]
    fn combine_without_documents_fails() {
        assert!(matches!(PdfMerger::new().combine(), Err(Error::Merge(_))));
    }
}
