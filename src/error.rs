#[derive(Debug, thiserror::Error)]
pub enum NetWatchError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("insufficient permission: {0}")]
    InsufficientPermission(String),
    #[error("no such interface: {0}")]
    NoInterface(String),
    #[error("capture ring setup failed on {interface}: {detail}")]
    RingAlloc { interface: String, detail: String },
    #[error("capture device error: {0}")]
    CaptureDevice(String),
    #[error("DNS parse error at offset {offset}: {detail}")]
    DnsParse { offset: usize, detail: String },
    #[error("interface enumeration error: {0}")]
    Interface(#[source] std::io::Error),
    #[error("store error: {0}")]
    StoreTransient(#[source] rusqlite::Error),
    #[error("store fatal: {0}")]
    StoreFatal(String),
    #[error("fatal: {0}")]
    Fatal(String),
}

impl NetWatchError {
    /// True for store failures that should stop the writer rather than be
    /// retried on the next batch.
    pub fn is_store_fatal(&self) -> bool {
        matches!(self, NetWatchError::StoreFatal(_))
    }
}

impl From<rusqlite::Error> for NetWatchError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(code, _)
                if matches!(
                    code.code,
                    rusqlite::ErrorCode::CannotOpen
                        | rusqlite::ErrorCode::NotADatabase
                        | rusqlite::ErrorCode::DatabaseCorrupt
                        | rusqlite::ErrorCode::DiskFull
                        | rusqlite::ErrorCode::ReadOnly
                ) =>
            {
                NetWatchError::StoreFatal(e.to_string())
            }
            _ => NetWatchError::StoreTransient(e),
        }
    }
}
