//! core-api: the client/server protocol front end.
//!
//! Length-prefixed big-endian packet framing, the session handshake and
//! state machine (auth, tty, raw, suspend), key-range filtered key delivery,
//! and the watchable parameter registry.

mod auth;
mod host;
mod packet;
mod params;
mod server;
mod text;
mod wire;

pub use auth::{AuthError, AuthScheme, Authenticator, PeerIdentity};
pub use host::{HostError, HostSpec, SOCKET_DIRECTORY, SOCKET_PORT_BASE, parse_host};
pub use packet::{DecodeEvent, MAX_PACKET_SIZE, Packet, PacketDecoder};
pub use params::{
    ParamAttributes, ParamError, ParamRegistry, ParamRequestFlags, ParamValue, id as param_id,
};
pub use server::{ApiError, ApiServer};
pub use text::{cell_for_char, cells_for_text};
pub use wire::{
    KEY_FLAG_RELEASE, KEY_TYPE_COMMAND, KEY_TYPE_DRIVER, KeyRange, PROTOCOL_VERSION, WireError,
    WriteFields, WriteRequest, command_key_code, decode_key_code, driver_key_code, encode_error,
    encode_key_code, encode_key_ranges, encode_tty_path, error_code, kind, parse_key_ranges,
    parse_tty_path,
};
