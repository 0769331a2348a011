#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("{0}")]
    Bridge(#[from] tunsocks_bridge::BridgeError),

    #[error("{0}")]
    Settings(#[from] tunsocks_settings::SettingsError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}
