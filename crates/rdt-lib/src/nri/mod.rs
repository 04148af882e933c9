//! Node Resource Interface adapter
//!
//! [`NriServer`] implements the plugin side of the runtime protocol on top
//! of the hook registry; [`Stub`] carries it over the runtime's socket.

pub mod api;
mod error;
mod server;
mod transport;

pub use api::{Event, EventMask};
pub use error::{NriError, TransportError};
pub use server::{
    NriServer, NriServerOptions, Plugin, PluginState, SandboxStore, DEFAULT_EVENTS,
    DEFAULT_PLUGIN_IDX, DEFAULT_PLUGIN_NAME,
};
pub use transport::{
    read_chunk, write_chunk, write_frame, Demux, Frame, Stub, MESSAGE_HEADER_LENGTH,
    MESSAGE_LENGTH_MAX, MESSAGE_TYPE_REQUEST, MESSAGE_TYPE_RESPONSE, MUX_HEADER_LENGTH,
    MUX_PAYLOAD_MAX, PLUGIN_SERVICE_CONN, RUNTIME_SERVICE_CONN,
};
