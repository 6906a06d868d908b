//! Native call UI bridge.

pub mod bridge;

pub use bridge::{NativeCallUi, NativeUiBridge, NativeUiEvent, NoopCallUi};
