//! Generic file upload on top of the AutoUploadable feature: selects the
//! files to upload through a configured glob pattern, optionally overridden
//! per trigger within the limits of the access mode.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;
use tracing::error;

use uplift_protocol::{FORCE_OPTION, UPLOAD_FILES_OPTION};

use crate::mode::AccessMode;
use crate::uploadable::{AutoUploadable, ErrorResponse, UploadCustomizer};

/// File-upload customizer: all backend communication is handled by the
/// [`AutoUploadable`], this type only decides which files get uploaded.
pub struct FileUpload {
    files_glob: String,
    mode: AccessMode,
    uploadable: Arc<AutoUploadable>,
}

impl FileUpload {
    pub fn new(files_glob: String, mode: AccessMode, uploadable: Arc<AutoUploadable>) -> Arc<Self> {
        Arc::new(Self {
            files_glob,
            mode,
            uploadable,
        })
    }

    fn glob_permitted(&self, requested: &str) -> Result<bool, ErrorResponse> {
        match self.mode {
            AccessMode::Lax => Ok(true),
            AccessMode::Strict => Ok(requested == self.files_glob),
            AccessMode::Scoped => glob::Pattern::new(&self.files_glob)
                .map(|pattern| pattern.matches(requested))
                .map_err(|e| {
                    ErrorResponse::internal(format!(
                        "invalid files glob '{}': {e}",
                        self.files_glob
                    ))
                }),
        }
    }
}

impl UploadCustomizer for FileUpload {
    fn do_trigger(
        &self,
        correlation_id: &str,
        options: &HashMap<String, String>,
    ) -> Result<(), ErrorResponse> {
        let files_glob = match options.get(UPLOAD_FILES_OPTION) {
            None => self.files_glob.clone(),
            Some(requested) => {
                if !self.glob_permitted(requested)? {
                    return Err(ErrorResponse::internal(format!(
                        "uploading '{requested}' with mode '{}' is not permitted",
                        self.mode
                    )));
                }
                requested.clone()
            }
        };

        if files_glob.is_empty() {
            return Err(ErrorResponse::internal("upload files not specified"));
        }

        let mut single = self.uploadable.config().single_upload;
        if options.get(FORCE_OPTION).map(String::as_str) == Some("true") {
            single = false;
        }
        if single && self.uploadable.has_pending_uploads() {
            return Err(ErrorResponse::internal(
                "there is an ongoing upload - set the 'force' option to 'true' to force trigger the upload",
            ));
        }

        let files: Vec<PathBuf> = match glob::glob(&files_glob) {
            Ok(paths) => paths.filter_map(Result::ok).collect(),
            Err(e) => {
                error!("failed to trigger upload {correlation_id}: {e}");
                return Err(ErrorResponse::internal(e.to_string()));
            }
        };

        self.uploadable.upload_files(correlation_id, &files, options);

        Ok(())
    }

    fn handle_operation(&self, operation: &str, _payload: &Value) -> ErrorResponse {
        ErrorResponse::bad_request(format!("Unsupported operation: {operation}"))
    }

    fn on_tick(&self) {
        let correlation_id = self.uploadable.next_uid();
        if let Err(e) = self.do_trigger(&correlation_id, &HashMap::new()) {
            error!("error on periodic trigger: {}", e.message);
        }
    }
}
