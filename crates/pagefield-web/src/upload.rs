use axum::extract::Multipart;

use pagefield_core::{Credentials, Document, JobRequest};

use crate::error::ApiError;

/// An uploaded file with its data and metadata.
pub struct UploadedFile {
    pub filename: String,
    pub data: Vec<u8>,
}

/// Parsed form fields from the multipart upload.
#[derive(Default)]
pub struct FormFields {
    pub files: Vec<UploadedFile>,
    pub instructions: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Parse a multipart form upload into structured form fields.
pub async fn parse_multipart(mut multipart: Multipart) -> Result<FormFields, String> {
    let mut fields = FormFields::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| format!("Failed to read form field: {}", e))?
    {
        let name = field.name().unwrap_or("").to_string();

        match name.as_str() {
            "pdf" | "pdf_files" => {
                let filename = field.file_name().unwrap_or("upload.pdf").to_string();
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| format!("Failed to read file data: {}", e))?
                    .to_vec();
                fields.files.push(UploadedFile { filename, data });
            }
            "instructions" | "prompt" => {
                fields.instructions = non_empty(field.text().await, &name)?;
            }
            "username" => {
                fields.username = non_empty(field.text().await, &name)?;
            }
            "password" => {
                fields.password = non_empty(field.text().await, &name)?;
            }
            _ => {
                // Ignore unknown fields
                let _ = field.bytes().await;
            }
        }
    }

    Ok(fields)
}

fn non_empty<E: std::fmt::Display>(
    value: Result<String, E>,
    name: &str,
) -> Result<Option<String>, String> {
    let value = value.map_err(|e| format!("Failed to read {}: {}", name, e))?;
    Ok(Some(value).filter(|v| !v.trim().is_empty()))
}

impl FormFields {
    /// Check that every required field is present and each file is a PDF.
    /// Runs before any credential check.
    pub fn into_request(self) -> Result<JobRequest, ApiError> {
        let (Some(instructions), Some(username), Some(password)) =
            (self.instructions, self.username, self.password)
        else {
            return Err(ApiError::BadRequest(
                "Missing required fields: pdf, instructions, username, password".into(),
            ));
        };
        if self.files.is_empty() {
            return Err(ApiError::BadRequest("No file uploaded".into()));
        }

        let mut documents = Vec::with_capacity(self.files.len());
        for file in self.files {
            if !is_pdf(&file.data) {
                return Err(ApiError::BadRequest(format!(
                    "{} is not a PDF",
                    file.filename
                )));
            }
            documents.push(Document::from_upload(&file.filename, file.data));
        }

        Ok(JobRequest {
            documents,
            instructions,
            credentials: Credentials::new(username, password),
        })
    }
}

/// PDF magic bytes.
fn is_pdf(data: &[u8]) -> bool {
    data.starts_with(b"%PDF-")
}
