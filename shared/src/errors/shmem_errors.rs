use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShmemError {
    #[error("shm_open(`{name}`) failed: {source}")]
    Open {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("mapping `{name}` ({size} bytes) failed: {source}")]
    Map {
        name: String,
        size: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("resizing `{name}` to {size} bytes failed: {source}")]
    Resize {
        name: String,
        size: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("stat of `{name}` failed: {source}")]
    Stat {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("file lock on `{name}` failed: {source}")]
    Lock {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("shm_unlink(`{name}`) failed: {source}")]
    Unlink {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("shared memory name `{name}` exceeds the {max}-byte limit")]
    NameTooLong { name: String, max: usize },
}
