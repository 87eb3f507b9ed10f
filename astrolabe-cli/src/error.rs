use astrolabe_core::model::ModelError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("terminal I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Model(#[from] ModelError),
}

impl CliError {
    pub fn user_message(&self) -> String {
        match self {
            CliError::Io(err) => format!("Terminal I/O failed: {err}"),
            CliError::Model(err) => err.user_message(),
        }
    }
}
