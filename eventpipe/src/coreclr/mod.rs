//! Well-known CLR event payloads and their dispatch.

mod enums;
mod events;

pub use enums::*;
pub use events::*;
