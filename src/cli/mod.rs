pub mod check;
pub mod mask;
pub mod watch;
