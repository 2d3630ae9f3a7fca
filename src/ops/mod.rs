pub mod ai;
pub mod background;
pub mod text;
pub mod transform;
pub mod watermark;
