#[derive(thiserror::Error, Debug)]
pub(crate) enum ServerError {
    #[error("Request carries no Host to route a tunnel by")]
    MissingHost,
    #[error("Request Host is not valid text")]
    InvalidHost,
    #[error("Tunneled upgrade is missing its Upgrade header")]
    InvalidUpgrade,
}
