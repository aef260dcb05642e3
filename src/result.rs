/// Type alias for [`std::result::Result`] with [`anyhow::Error`] as the default error.
pub type Result<T, E = anyhow::Error> = std::result::Result<T, E>;
