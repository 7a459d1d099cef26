pub mod marker;
pub mod sync;
pub mod watch;
