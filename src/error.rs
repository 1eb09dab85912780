use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Unusable input detected before any tracking starts.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("video error: {0}")]
    Video(String),

    #[error("model error: {0}")]
    Model(String),

    #[error("tracking cancelled")]
    Cancelled,

    #[error("a tracking batch is already running")]
    BatchInFlight,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("opencv error: {0}")]
    OpenCv(#[from] opencv::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Errors that abort a whole batch instead of a single video.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Configuration(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
