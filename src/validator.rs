use crate::blob_store::{BlobRef, BlobStore};
use crate::descriptor::FileDescriptor;
use crate::error::{GateError, Result};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{debug, info, instrument, warn};

/// Required column count per file type.
///
/// This table is part of the validator's contract, not external config.
/// `type6` is listed here but absent from the default expected set: a
/// type6 file is skipped by validation and still relocated with its batch.
pub fn required_columns(file_type: &str) -> Option<usize> {
    match file_type {
        "type5" => Some(2),
        "type10" | "type4" => Some(3),
        "type1" | "type2" => Some(4),
        "type9" => Some(5),
        "type3" => Some(14),
        "type6" => Some(15),
        "type8" => Some(21),
        "type7" => Some(23),
        _ => None,
    }
}

/// One structural defect found in a batch file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationError {
    pub file_type: String,
    pub filename: String,
    /// 0-based line index; `None` for file-level errors
    pub line: Option<usize>,
    /// 0-based field index within the line, when one field is at fault
    pub field: Option<usize>,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.line, self.field) {
            (Some(line), Some(field)) => write!(
                f,
                "{} file '{}' Record {} Field {}: {}",
                self.file_type, self.filename, line, field, self.message
            ),
            (Some(line), None) => write!(
                f,
                "{} file '{}' Record {}: {}",
                self.file_type, self.filename, line, self.message
            ),
            _ => write!(f, "{} file '{}': {}", self.file_type, self.filename, self.message),
        }
    }
}

/// Scan one CSV stream for structural defects.
///
/// Per line (0-based): a field-count mismatch yields one error and the scan
/// moves on to the next line; on a conforming line the first field not
/// wrapped in double quotes is reported. After the scan, content that was
/// not valid UTF-8 adds one file-level error.
pub async fn validate_reader<R: AsyncRead + Unpin>(
    reader: R,
    required_columns: usize,
    descriptor: &FileDescriptor,
) -> std::io::Result<Vec<ValidationError>> {
    let mut errors = Vec::new();
    let mut utf8_ok = true;
    let mut segments = BufReader::new(reader).split(b'\n');
    let mut line_number = 0usize;

    while let Some(mut raw) = segments.next_segment().await? {
        if raw.last() == Some(&b'\r') {
            raw.pop();
        }

        let line = match String::from_utf8(raw) {
            Ok(s) => s,
            Err(e) => {
                utf8_ok = false;
                String::from_utf8_lossy(e.as_bytes()).into_owned()
            }
        };

        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() != required_columns {
            errors.push(ValidationError {
                file_type: descriptor.file_type.clone(),
                filename: descriptor.filename.clone(),
                line: Some(line_number),
                field: None,
                message: format!(
                    "is malformed. Should have {} values; has {}",
                    required_columns,
                    fields.len()
                ),
            });
            line_number += 1;
            continue;
        }

        for (i, field) in fields.iter().enumerate() {
            // each field must be enclosed in double quotes
            if field.len() < 2 || !field.starts_with('"') || !field.ends_with('"') {
                errors.push(ValidationError {
                    file_type: descriptor.file_type.clone(),
                    filename: descriptor.filename.clone(),
                    line: Some(line_number),
                    field: Some(i),
                    message: format!("value ({field}) is not enclosed in double quotes (\")"),
                });
                break;
            }
        }

        line_number += 1;
    }

    if !utf8_ok {
        errors.push(ValidationError {
            file_type: descriptor.file_type.clone(),
            filename: descriptor.filename.clone(),
            line: None,
            field: None,
            message: "is not UTF-8 encoded".to_string(),
        });
    }

    Ok(errors)
}

/// Validates every recognized file of a completed batch
pub struct FileSetValidator {
    store: Arc<dyn BlobStore>,
}

impl FileSetValidator {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self { store }
    }

    /// Validate one blob against the column table.
    ///
    /// A missing source blob yields an empty error list: a concurrent mover
    /// may already have relocated it.
    #[instrument(skip(self), fields(blob = %blob))]
    pub async fn validate_file(
        &self,
        blob: &BlobRef,
        descriptor: &FileDescriptor,
        required_columns: usize,
    ) -> Result<Vec<ValidationError>> {
        let reader = match self.store.open(blob).await {
            Ok(reader) => reader,
            Err(e) if e.is_not_found() => {
                debug!(blob = %blob, "Source blob gone, skipping validation");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        validate_reader(reader, required_columns, descriptor)
            .await
            .map_err(|e| GateError::Storage(format!("read '{blob}': {e}")))
    }

    /// Validate a completed batch found under `{container}/{prefix}`.
    ///
    /// Lists everything physically present at the prefix, so that relocation
    /// later covers the whole listing, but validates only the blobs whose
    /// type is in `file_types`. An expected type missing from the column
    /// table is fatal for the whole batch.
    ///
    /// Returns the full listing together with the aggregated errors.
    #[instrument(skip(self, file_types))]
    pub async fn validate_file_set(
        &self,
        container: &str,
        prefix: &str,
        file_types: &BTreeSet<String>,
    ) -> Result<(Vec<BlobRef>, Vec<ValidationError>)> {
        let blobs = self.store.list(container, prefix).await?;
        info!(
            container = %container,
            prefix = %prefix,
            count = blobs.len(),
            "Validating file set"
        );

        let mut errors = Vec::new();

        for blob in &blobs {
            let descriptor = match FileDescriptor::parse(&blob.to_string()) {
                Some(d) => d,
                None => {
                    debug!(blob = %blob, "Blob outside the naming convention, skipped");
                    continue;
                }
            };

            if !file_types.contains(&descriptor.file_type) {
                debug!(
                    blob = %blob,
                    file_type = %descriptor.file_type,
                    "Skipped. Isn't in the list of file types to process"
                );
                continue;
            }

            let columns = required_columns(&descriptor.file_type).ok_or_else(|| {
                GateError::UnrecognizedFileType {
                    batch_key: format!("{container}/{prefix}"),
                    file_type: descriptor.file_type.clone(),
                }
            })?;

            let file_errors = self.validate_file(blob, &descriptor, columns).await?;
            if !file_errors.is_empty() {
                warn!(
                    blob = %blob,
                    error_count = file_errors.len(),
                    "Structural errors found"
                );
                metrics::counter!("gate.validation.errors").increment(file_errors.len() as u64);
            }
            errors.extend(file_errors);
        }

        Ok((blobs, errors))
    }
}
