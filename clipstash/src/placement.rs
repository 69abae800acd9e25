//! Content handed back to the platform clipboard
//!
//! [`ClipboardContent`] is lowered to the exact MIME offers the clipboard
//! collaborator should advertise.

use crate::interface::{Offer, Selection, CONCEALED_MIME_TYPE};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlacementError {
    #[error("cannot read {path}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("selection has no offers")]
    EmptySelection,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyOptions {
    /// Mark the content so history capture never stores it
    pub concealed: bool,
}

impl CopyOptions {
    pub fn concealed() -> Self {
        Self { concealed: true }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClipboardContent {
    Text { text: String },
    Html { html: String, text: Option<String> },
    File { path: PathBuf },
    Selection(Selection),
}

impl ClipboardContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn into_offers(self, options: CopyOptions) -> Result<Vec<Offer>, PlacementError> {
        let mut offers = match self {
            ClipboardContent::Text { text } => vec![Offer::new("text/plain", text)],
            ClipboardContent::Html { html, text } => {
                let mut offers = vec![Offer::new("text/html", html)];
                if let Some(text) = text {
                    offers.push(Offer::new("text/plain", text));
                }
                offers
            }
            ClipboardContent::File { path } => {
                let data = std::fs::read(&path).map_err(|source| PlacementError::File { path, source })?;
                vec![Offer::new(sniff_mime_type(&data), data)]
            }
            ClipboardContent::Selection(selection) => {
                if selection.offers.is_empty() {
                    return Err(PlacementError::EmptySelection);
                }
                selection.offers
            }
        };

        if options.concealed {
            offers.push(Offer::new(CONCEALED_MIME_TYPE, b"1".to_vec()));
        }
        Ok(offers)
    }

    /// Lower to a selection, as the clipboard listener would deliver it back
    pub fn into_selection(self, options: CopyOptions) -> Result<Selection, PlacementError> {
        self.into_offers(options).map(Selection::new)
    }
}

fn sniff_mime_type(data: &[u8]) -> &'static str {
    if let Some(kind) = infer::get(data) {
        return kind.mime_type();
    }
    if std::str::from_utf8(data).is_ok() {
        "text/plain"
    } else {
        "application/octet-stream"
    }
}
