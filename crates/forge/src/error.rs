use http::StatusCode;

/// Failures callers need to tell apart. Everything else travels as plain
/// `anyhow::Error` context.
#[derive(Debug, thiserror::Error)]
pub enum ForgeError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("{0}")]
    MissingConfig(&'static str),
    #[error("API error {status}: {message}")]
    Api { status: StatusCode, message: String },
}

/// Whether anything in the error chain is a [`ForgeError::NotFound`].
pub fn is_not_found(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| matches!(cause.downcast_ref(), Some(ForgeError::NotFound(_))))
        || err.chain().any(|cause| {
            matches!(
                cause.downcast_ref::<octocrab::Error>(),
                Some(octocrab::Error::GitHub { source, .. })
                    if source.status_code == StatusCode::NOT_FOUND
            )
        })
}
