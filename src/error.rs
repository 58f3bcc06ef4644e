use thiserror::Error;

/// Errors surfaced by snapshot persistence.
///
/// Rejection of an admission is not an error (it is the `false` return of
/// `allow_visit`), and configuration misuse is fatal rather than recoverable;
/// only the snapshot lifecycle produces values of this type.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// The file's layout does not match the configured rules: wrong rule
    /// count, wrong rule index, an unknown key tag, or more deadlines for one
    /// visitor than the rule's limit admits.
    #[error("snapshot does not match the configured rules")]
    Inconsistent,

    /// A deadline run is out of order or reaches past `now + window`; the
    /// file was modified after it was written. `offset` is the reader
    /// position just past the offending deadline.
    #[error("snapshot rejected at byte offset {offset}")]
    Tampered { offset: u64 },

    /// `save_once` was called before any snapshot path was configured.
    #[error("no snapshot path configured; call load_and_autosave first")]
    NoPath,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
