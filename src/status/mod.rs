//! Runtime status artifact and panel diff emission.

pub mod panel_diffs;
pub mod writer;

pub use self::panel_diffs::{apply_diff, compute_diff, PanelDiffEmitter};
pub use self::writer::{StatusInputs, StatusWriter};
