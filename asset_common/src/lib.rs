mod asset;
mod asset_file_header;
mod event;
mod transform_state;

pub use asset::*;
pub use asset_file_header::*;
pub use event::*;
pub use transform_state::*;
