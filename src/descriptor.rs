use serde::{Deserialize, Serialize};

/// Folder that newly uploaded batch files land in. Blobs created anywhere
/// else are not part of the intake workflow.
pub const INBOUND_FOLDER: &str = "inbound";

/// Attributes of one customer upload, derived from its blob path.
///
/// Blobs follow the naming convention
/// `{container}/inbound/{customer}-...{batch}_{file_type}.{ext}` where the
/// filename up to the last `_` is the batch prefix shared by every file of
/// one upload run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    /// Storage container the blob lives in
    pub container: String,
    /// Customer name, the first `-`-separated token of the filename
    pub customer_name: String,
    /// Prefix shared by all files of the batch (filename minus `_{type}.{ext}`)
    pub batch_prefix: String,
    /// Blob filename including extension
    pub filename: String,
    /// File type code, the token after the last `_`, lowercased
    pub file_type: String,
}

impl FileDescriptor {
    /// Parse a blob URL or path into its batch attributes.
    ///
    /// Returns `None` when the path doesn't follow the intake layout: no
    /// `inbound` folder segment, no container segment in front of it, or a
    /// filename without the `{customer}-...{batch}_{type}.{ext}` shape.
    /// `None` means "not applicable", never an error.
    pub fn parse(url: &str) -> Option<Self> {
        let path = url
            .split_once("://")
            .map(|(_, rest)| match rest.split_once('/') {
                Some((_host, path)) => path,
                None => "",
            })
            .unwrap_or(url);

        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let inbound_pos = segments.iter().position(|s| *s == INBOUND_FOLDER)?;
        if inbound_pos == 0 || inbound_pos + 1 >= segments.len() {
            return None;
        }

        let container = segments[inbound_pos - 1];
        let filename = *segments.last()?;

        let stem = match filename.rsplit_once('.') {
            Some((stem, _ext)) => stem,
            None => filename,
        };
        let (batch_prefix, file_type) = stem.rsplit_once('_')?;
        let (customer_name, _) = filename.split_once('-')?;
        if batch_prefix.is_empty() || file_type.is_empty() || customer_name.is_empty() {
            return None;
        }

        Some(Self {
            container: container.to_string(),
            customer_name: customer_name.to_string(),
            batch_prefix: batch_prefix.to_string(),
            filename: filename.to_string(),
            file_type: file_type.to_lowercase(),
        })
    }

    /// Full storage prefix covering every file of this batch:
    /// `{container}/inbound/{batch_prefix}`
    pub fn batch_key(&self) -> String {
        format!(
            "{}/{}/{}",
            self.container, INBOUND_FOLDER, self.batch_prefix
        )
    }
}
