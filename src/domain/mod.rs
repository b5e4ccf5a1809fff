pub mod alert;
pub mod notification;
pub mod report;
pub mod status;

pub use alert::*;
pub use notification::*;
pub use report::*;
pub use status::*;
