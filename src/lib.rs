// src/lib.rs
//
// Library entry point for Rust and FFI consumers.
//
// The control side (`State`) owns the handle table and talks to each
// engine through a lock-free command queue; engines run wherever their
// driver puts them.

mod audio_buffer;
mod bridge;
mod command;
mod compiler;
mod config;
mod driver;
mod engine;
mod error;
mod fixed;
mod handle;
mod object;
mod program;
mod property;
mod render;
mod scheduler;
mod state;
mod table;
mod voice;
mod wave;

#[cfg(test)]
mod test_programs;

pub mod ffi;

// Re-export key types for Rust consumers
pub use audio_buffer::AudioBuffer;
pub use bridge::EngineReadback;
pub use command::{InsertFn, TapFn};
pub use compiler::{BankDef, Definition, ScriptCompiler};
pub use config::{Config, MAX_BUFFER, MAX_CHANNELS, RenderSettings, StateFlags};
pub use driver::{AudioDriver, BlockSink, BufferDriver, DriverSettings, StreamDriver};
pub use engine::Engine;
pub use error::{Error, ErrorCode, Result};
pub use fixed::{Args, Fixed, MAX_ARGS, args};
pub use handle::Handle;
pub use object::{InstanceId, ObjectKind, Payload, Record};
pub use program::{
    GroupProgram, MAX_ENTRY_POINTS, ProcessContext, Program, UnitStatus, VoiceSetup, VoiceUnit,
    group_ep,
};
pub use property::Property;
pub use state::State;
pub use table::{Released, SharedTable};
pub use wave::{Wave, WaveFlags, WaveKind};
