pub type AnyError = anyhow::Error;
pub type AnyResult<T> = std::result::Result<T, AnyError>;
