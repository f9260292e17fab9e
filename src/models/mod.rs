pub mod bom;
pub mod enums;
pub mod geometry;

pub use bom::*;
pub use enums::*;
pub use geometry::*;
