//! Scanned documents: OCR text, layout hint, heuristic extractor.

use super::{SourceKind, TabularSource};
use crate::error::Result;
use crate::ocr::{rows_for_layout, OcrExtractor};
use std::path::Path;

pub(super) fn open(path: &Path, ocr: &dyn OcrExtractor) -> Result<TabularSource> {
    let document = ocr.extract(path)?;
    let rows = rows_for_layout(&document);
    let mut headers: Vec<String> = Vec::new();
    for row in &rows {
        for key in row.keys() {
            if !headers.contains(key) {
                headers.push(key.clone());
            }
        }
    }
    tracing::info!(
        file = %path.display(),
        layout = ?document.layout,
        pages = document.pages,
        rows = rows.len(),
        confidence = document.confidence,
        "scanned document extracted"
    );
    let mut source = TabularSource::new(
        SourceKind::Scanned,
        headers,
        document.confidence,
        Box::new(rows.into_iter().map(Ok)),
    );
    source.ocr_layout = Some(document.layout);
    Ok(source)
}

#[cfg(test)]
mod tests {
    use super::super::open_source;
    use crate::error::{PipelineError, Result};
    use crate::ocr::{detect_layout, OcrExtractor};
    use crate::types::{OcrDocument, OcrLayout};
    use serde_json::json;
    use std::path::Path;

    struct FixedText(&'static str);

    impl OcrExtractor for FixedText {
        fn extract(&self, _path: &Path) -> Result<OcrDocument> {
            Ok(OcrDocument {
                text: self.0.to_string(),
                lines: vec![],
                layout: detect_layout(self.0),
                confidence: 0.82,
                tables: vec![],
                pages: 1,
            })
        }
    }

    struct Broken;

    impl OcrExtractor for Broken {
        fn extract(&self, _path: &Path) -> Result<OcrDocument> {
            Err(PipelineError::Ocr("service down".into()))
        }
    }

    #[test]
    fn receipt_scan_yields_one_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ticket.jpg");
        std::fs::write(&path, b"\xff\xd8").unwrap();
        let ocr = FixedText("SUPERMERCADO LA FAVORITA S.A.\nTicket 000981\n02/03/2024\nTotal 12,40\nEfectivo 20,00\nCambio 7,60");
        let mut source = open_source(&path, Some(&ocr)).unwrap();
        assert_eq!(source.ocr_layout, Some(OcrLayout::Receipt));
        assert!((source.parser_confidence - 0.82).abs() < 1e-9);
        let rows = source.take_sample(10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["Total"], json!(12.4));
        assert_eq!(rows[0]["Fecha"], json!("2024-03-02"));
    }

    #[test]
    fn ocr_failure_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.png");
        std::fs::write(&path, b"png").unwrap();
        let err = open_source(&path, Some(&Broken)).unwrap_err();
        assert_eq!(err.kind(), "ocr");
    }
}
