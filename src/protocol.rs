//! LED Strip Wire Protocol
//!
//! Text protocol spoken over the serial link: one `\r\n`-terminated line per
//! command, verb first, payload (if any) appended directly.

/// Set the strip to a solid color: `SET_COLOR#RRGGBB`.
pub const SET_COLOR: &str = "SET_COLOR";

/// Set global brightness: `SET_BRIGHTNESS<0-255>`.
pub const SET_BRIGHTNESS: &str = "SET_BRIGHTNESS";

/// Start a named animation: `SET_ANIMATION<NAME>`.
pub const SET_ANIMATION: &str = "SET_ANIMATION";

/// Sent once after a successful connect.
pub const CONNECTED: &str = "CONNECTED";

/// Sent best-effort before an orderly disconnect.
pub const DISCONNECTED: &str = "DISCONNECTED";

/// Line terminator. The firmware reads lines, so every command carries it.
pub const LINE_END: &str = "\r\n";

/// An outbound command, immutable once constructed. Encoding is pure and has
/// no dependency on connection state; the coordinator gates when an encoded
/// command is actually written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Solid color as a packed RGB integer. Only the low 24 bits are used;
    /// alpha/overflow bits from platform color ints are truncated.
    SetColor(u32),
    SetBrightness(u8),
    SetAnimation(String),
    Hello,
    Bye,
}

impl Command {
    /// Encode to the wire line, terminator included.
    pub fn encode(&self) -> String {
        match self {
            Command::SetColor(rgb) => {
                format!("{SET_COLOR}#{:06X}{LINE_END}", rgb & 0x00FF_FFFF)
            }
            Command::SetBrightness(value) => format!("{SET_BRIGHTNESS}{value}{LINE_END}"),
            Command::SetAnimation(name) => {
                format!("{SET_ANIMATION}{}{LINE_END}", name.to_uppercase())
            }
            Command::Hello => format!("{CONNECTED}{LINE_END}"),
            Command::Bye => format!("{DISCONNECTED}{LINE_END}"),
        }
    }
}
