//! Device drivers
//!
//! Only the console lives here; everything else the core touches is
//! consumed through interfaces (filesystem, secondary boot).

pub mod uart;
