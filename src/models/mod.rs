pub mod checkpoint;
pub mod event;
pub mod job;
pub mod log;
pub mod request;
pub mod row;
