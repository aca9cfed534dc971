use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Update(#[from] agentup_core::UpdateError),
}

pub type Result<T> = std::result::Result<T, CliError>;
