//! Windows, layers and the terminal.

pub mod layer;
pub mod terminal;
pub mod window;

pub use layer::{ActiveLayer, Layer, LayerManager};
pub use terminal::Terminal;
pub use window::{Surface, ToplevelWindow, Window};
