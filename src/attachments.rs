use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Metadata for a file staged for the current compose action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub media_type: String,
    #[serde(default)]
    pub size: u64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AttachmentError {
    #[error("no attachment at position {0}")]
    OutOfRange(usize),
    #[error("replacement must be {expected}, got {actual}")]
    MediaTypeMismatch { expected: String, actual: String },
}

/// Flat ordered list of staged files, newest batch first.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AttachmentList {
    files: Vec<Attachment>,
}

impl AttachmentList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepend a batch, keeping the batch's own order.
    pub fn add(&mut self, files: impl IntoIterator<Item = Attachment>) {
        let mut batch: Vec<Attachment> = files.into_iter().collect();
        batch.append(&mut self.files);
        self.files = batch;
    }

    pub fn remove(&mut self, index: usize) -> Option<Attachment> {
        (index < self.files.len()).then(|| self.files.remove(index))
    }

    /// Swap the file at `index` for one of the same media type. On error the
    /// list is left untouched.
    pub fn replace(&mut self, index: usize, file: Attachment) -> Result<Attachment, AttachmentError> {
        let slot = self
            .files
            .get_mut(index)
            .ok_or(AttachmentError::OutOfRange(index))?;

        if slot.media_type != file.media_type {
            return Err(AttachmentError::MediaTypeMismatch {
                expected: slot.media_type.clone(),
                actual: file.media_type,
            });
        }

        Ok(std::mem::replace(slot, file))
    }

    pub fn recent(&self, n: usize) -> &[Attachment] {
        &self.files[..n.min(self.files.len())]
    }

    pub fn files(&self) -> &[Attachment] {
        &self.files
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str, media_type: &str) -> Attachment {
        Attachment {
            name: name.to_string(),
            media_type: media_type.to_string(),
            size: 1,
        }
    }

    fn names(list: &AttachmentList) -> Vec<&str> {
        list.files().iter().map(|f| f.name.as_str()).collect()
    }

    #[test]
    fn add_prepends_batches() {
        let mut list = AttachmentList::new();
        list.add([file("a.pdf", "application/pdf")]);
        list.add([file("b.csv", "text/csv"), file("c.csv", "text/csv")]);
        assert_eq!(names(&list), vec!["b.csv", "c.csv", "a.pdf"]);
    }

    #[test]
    fn remove_by_position() {
        let mut list = AttachmentList::new();
        list.add([file("a", "text/plain"), file("b", "text/plain")]);
        assert_eq!(list.remove(0).map(|f| f.name), Some("a".to_string()));
        assert_eq!(list.remove(5), None);
        assert_eq!(names(&list), vec!["b"]);
    }

    #[test]
    fn replace_requires_same_media_type() {
        let mut list = AttachmentList::new();
        list.add([file("q1.xlsx", "application/vnd.ms-excel")]);

        let err = list.replace(0, file("q1.pdf", "application/pdf")).unwrap_err();
        assert!(matches!(err, AttachmentError::MediaTypeMismatch { .. }));
        assert_eq!(names(&list), vec!["q1.xlsx"]);

        let old = list
            .replace(0, file("q2.xlsx", "application/vnd.ms-excel"))
            .unwrap();
        assert_eq!(old.name, "q1.xlsx");
        assert_eq!(names(&list), vec!["q2.xlsx"]);

        assert_eq!(
            list.replace(3, file("x", "text/plain")),
            Err(AttachmentError::OutOfRange(3))
        );
    }

    #[test]
    fn recent_is_capped() {
        let mut list = AttachmentList::new();
        list.add((0..8).map(|i| file(&i.to_string(), "text/plain")));
        assert_eq!(list.recent(6).len(), 6);
        assert_eq!(list.recent(10).len(), 8);
    }
}
