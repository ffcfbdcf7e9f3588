use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum GateError {
    #[error("I/O error: {0}")]
    #[diagnostic(code(portcullis::io))]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    #[diagnostic(code(portcullis::config))]
    Config(#[from] config::ConfigError),

    #[error("HTTP client error: {0}")]
    #[diagnostic(code(portcullis::http))]
    Http(#[from] reqwest::Error),

    #[error("JOSE error: {0}")]
    #[diagnostic(code(portcullis::jose))]
    Jose(String),

    #[error("Invalid configuration: {0}")]
    #[diagnostic(
        code(portcullis::invalid_config),
        help("Check config.toml and PORTCULLIS__* environment overrides")
    )]
    InvalidConfig(String),

    #[error("{0}")]
    #[diagnostic(code(portcullis::other))]
    Other(String),
}

impl From<josekit::JoseError> for GateError {
    fn from(value: josekit::JoseError) -> Self {
        GateError::Jose(value.to_string())
    }
}
