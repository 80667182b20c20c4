use thiserror::Error;

#[derive(Error, Debug)]
pub enum HearthError {
    #[error("invalid config value for {key}: {value}")]
    InvalidConfig { key: String, value: String },
}
