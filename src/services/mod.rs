pub mod content;
pub mod dispatcher;
pub mod session_store;
pub mod storage;
pub mod sweeper;
pub mod tus;
pub mod upload_error;
