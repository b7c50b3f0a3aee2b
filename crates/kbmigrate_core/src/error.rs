use thiserror::Error;

/// Failures raised by the source and destination HTTP layers.
///
/// Rate limiting is handled inside the requester and never surfaces here
/// unless the retry budget runs out.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{endpoint}: still rate limited after {attempts} attempts")]
    RetriesExhausted { endpoint: String, attempts: usize },

    #[error("{endpoint}: HTTP {status}: {body}")]
    Transport {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("no details found for {kind} {id}")]
    MissingDetail { kind: &'static str, id: u64 },

    #[error("{endpoint}: unexpected response shape: {detail}")]
    InvalidResponse { endpoint: String, detail: String },
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Transport { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Trims a response body for inclusion in an error message.
pub(crate) fn truncate_body(body: &str) -> String {
    const LIMIT: usize = 500;
    let trimmed = body.trim();
    if trimmed.chars().count() <= LIMIT {
        return trimmed.to_string();
    }
    let mut out = trimmed.chars().take(LIMIT).collect::<String>();
    out.push_str("...");
    out
}
