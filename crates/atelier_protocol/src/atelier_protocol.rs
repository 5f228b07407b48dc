//! Atelier Protocol
//!
//! Shared vocabulary between the plugin host and its worker process:
//! - `frame`: length-delimited frames over any async byte stream
//! - `wire`: correlated request/response envelopes and method payloads
//! - `manifest`: the `plugin.json` manifest model
//! - `plugin`: declarative method signatures and configuration options

pub mod frame;
pub mod manifest;
pub mod plugin;
pub mod wire;

pub use frame::{Frame, FrameError, FrameReader, FrameWriter, MessageType, DEFAULT_MAX_FRAME_LEN};
pub use manifest::{ManifestError, PluginManifest, MANIFEST_FILE_NAME};
pub use plugin::{
    ConfigChoice, ConfigType, MethodParameter, ParamType, PluginConfigOption, PluginMethod,
    ValidationRule,
};
pub use wire::{methods, Request, Response, WireError};
