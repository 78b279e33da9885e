mod device;
mod message;
mod payload;
mod reading;
mod result;

pub use device::*;
pub use message::*;
pub use payload::*;
pub use reading::*;
pub use result::*;
