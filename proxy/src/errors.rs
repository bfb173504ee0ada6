use crate::config::ValidationError;
use std::io;

#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ValidationError),
    #[error("upstream request failed: {0}")]
    ReqwestError(#[from] reqwest::Error),
    #[error("hyper error: {0}")]
    Hyper(#[from] hyper::Error),
    #[error("could not read request body: {0}")]
    RequestBody(String),
}
