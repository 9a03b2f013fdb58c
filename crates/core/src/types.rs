/// Platform-side job identifier. Opaque, unique for the lifetime of a queue.
pub type JobId = String;

/// Server-assigned identifier of one submission to the remote service.
pub type RemoteId = String;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
