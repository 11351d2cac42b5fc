//! Builtin message set and the decode registry.
//!
//! Concrete messages are identified solely by their type id. The builtin
//! vocabulary covers the generic command replies and the 2D navigation
//! group; applications extend the set by registering messages in the
//! custom group.
//!
//! Replies reuse the id of their request with the reply bit set:
//! `NAV2D_CAPS == NAV2D_CAPS_QUERY | REPLY_BIT`.

use std::{any::Any, collections::HashMap, fmt};

use bytes::Bytes;
use prost::Message as _;

use crate::{
    angle::Angle,
    error::{ProtocolError, Result},
    typed::{REPLY_BIT, Typed},
};

/// Group of the generic command replies.
pub const GROUP_COMMAND: u32 = 0x0000_0000;
/// Group of the 2D navigation messages.
pub const GROUP_NAV2D: u32 = 0x0002_0000;
/// Base group for application-defined messages.
pub const GROUP_CUSTOM: u32 = 0x7f00_0000;

/// Generic success reply.
pub const COMMAND_OK: u32 = GROUP_COMMAND | REPLY_BIT;
/// Generic failure reply.
pub const COMMAND_ERR: u32 = GROUP_COMMAND | REPLY_BIT | 0x0001;
/// Query for navigation capabilities.
pub const NAV2D_CAPS_QUERY: u32 = GROUP_NAV2D;
/// Reply to [`NAV2D_CAPS_QUERY`].
pub const NAV2D_CAPS: u32 = NAV2D_CAPS_QUERY | REPLY_BIT;
/// Drive straight at a given speed.
pub const NAV2D_DRIVE: u32 = GROUP_NAV2D | 0x0001;
/// Turn in place at a given angular speed.
pub const NAV2D_TURN: u32 = GROUP_NAV2D | 0x0002;

/// A message that can be put on the wire.
///
/// Implementations pair a fixed type id with the protobuf encoding of the
/// payload. The trait is object safe so transports can accept any message
/// without knowing its concrete type.
pub trait WireMessage: Send + Sync + 'static {
    /// Wire type id of this message.
    fn type_id(&self) -> u32;

    /// Encoded payload bytes.
    fn payload(&self) -> Bytes;
}

impl Typed {
    /// Wraps a message into an envelope, leaving the sequence at zero.
    pub fn from_msg(msg: &dyn WireMessage) -> Self {
        Self::new(msg.type_id(), msg.payload())
    }
}

/// A decoded message, consumed by downcasting to its concrete type.
pub type Decoded = Box<dyn Any + Send>;

type Decoder = fn(u32, &[u8]) -> Result<Decoded>;

fn decode_as<M>(type_id: u32, data: &[u8]) -> Result<Decoded>
where
    M: prost::Message + Default + Send + 'static,
{
    match M::decode(data) {
        Ok(msg) => Ok(Box::new(msg)),
        Err(e) => Err(ProtocolError::Payload { type_id, reason: e.to_string() }),
    }
}

/// Maps type ids to payload decoders.
///
/// [`Registry::builtin`] knows the builtin vocabulary; applications add
/// custom-group messages with [`Registry::register`].
pub struct Registry {
    decoders: HashMap<u32, Decoder>,
}

impl Registry {
    /// Creates a registry with the builtin message set.
    pub fn builtin() -> Self {
        let mut reg = Self { decoders: HashMap::new() };
        reg.register::<CommandOk>(COMMAND_OK);
        reg.register::<CommandErr>(COMMAND_ERR);
        reg.register::<Nav2dCapsQuery>(NAV2D_CAPS_QUERY);
        reg.register::<Nav2dCaps>(NAV2D_CAPS);
        reg.register::<Nav2dDrive>(NAV2D_DRIVE);
        reg.register::<Nav2dTurn>(NAV2D_TURN);
        reg
    }

    /// Registers a message type. A later registration for the same type id
    /// replaces the earlier one.
    pub fn register<M>(&mut self, type_id: u32)
    where
        M: prost::Message + Default + Send + 'static,
    {
        self.decoders.insert(type_id, decode_as::<M>);
    }

    /// Decodes the payload of an envelope into a fresh message.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::UnknownType`] if the type id has no decoder;
    /// [`ProtocolError::Payload`] if the payload does not match the schema.
    pub fn decode(&self, typed: &Typed) -> Result<Decoded> {
        let decoder = self
            .decoders
            .get(&typed.type_id)
            .ok_or(ProtocolError::UnknownType { type_id: typed.type_id })?;
        decoder(typed.type_id, &typed.message)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry").field("types", &self.decoders.len()).finish()
    }
}

/// Generic success reply for commands without a dedicated reply message.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CommandOk {}

/// Generic failure reply carrying a human-readable reason.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CommandErr {
    /// What went wrong on the controller side.
    #[prost(string, tag = "1")]
    pub message: String,
}

impl CommandErr {
    /// Creates a failure reply from a reason.
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }

    /// The reply sent for commands no controller claimed.
    pub fn unsupported() -> Self {
        Self::new("unsupported command")
    }
}

impl fmt::Display for CommandErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for CommandErr {}

/// Queries the navigation capabilities of a controller.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Nav2dCapsQuery {}

/// Navigation capabilities.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Nav2dCaps {
    /// Maximum drive speed in mm/s; zero when unknown.
    #[prost(float, tag = "1")]
    pub drive_speed_max: f32,
    /// Maximum turn speed in rad/s; zero when unknown.
    #[prost(float, tag = "2")]
    pub turn_speed_max: f32,
}

/// Drives straight at `speed` mm/s, optionally ramping at `accel` mm/s².
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Nav2dDrive {
    /// Target speed in mm/s; negative drives backwards, zero stops.
    #[prost(float, tag = "1")]
    pub speed: f32,
    /// Acceleration magnitude in mm/s²; zero switches speed instantly.
    #[prost(float, tag = "2")]
    pub accel: f32,
}

/// Turns in place at `speed` rad/s.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Nav2dTurn {
    /// Angular speed in rad/s; sign picks the direction.
    #[prost(float, tag = "1")]
    pub speed: f32,
}

impl Nav2dTurn {
    /// Builds a turn at `rate` per second. User-facing surfaces speak
    /// degrees; [`Angle`] carries the normalized conversion so callers
    /// never pass raw radians.
    pub fn at_rate(rate: Angle) -> Self {
        Self { speed: rate.radians() as f32 }
    }

    /// The turn rate as an angle per second.
    pub fn rate(&self) -> Angle {
        Angle::from_radians(f64::from(self.speed))
    }
}

macro_rules! wire_message {
    ($msg:ty, $type_id:expr) => {
        impl WireMessage for $msg {
            fn type_id(&self) -> u32 {
                $type_id
            }

            fn payload(&self) -> Bytes {
                self.encode_to_vec().into()
            }
        }
    };
}

wire_message!(CommandOk, COMMAND_OK);
wire_message!(CommandErr, COMMAND_ERR);
wire_message!(Nav2dCapsQuery, NAV2D_CAPS_QUERY);
wire_message!(Nav2dCaps, NAV2D_CAPS);
wire_message!(Nav2dDrive, NAV2D_DRIVE);
wire_message!(Nav2dTurn, NAV2D_TURN);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_round_trip() {
        let caps = Nav2dCaps { drive_speed_max: 350.0, turn_speed_max: 1.5 };
        let mut typed = Typed::from_msg(&caps);
        typed.sequence = 7;

        let reg = Registry::builtin();
        let decoded = reg.decode(&typed).expect("decode");
        let decoded = decoded.downcast::<Nav2dCaps>().expect("downcast");
        assert_eq!(*decoded, caps);
    }

    #[test]
    fn unknown_type_id_is_surfaced() {
        let reg = Registry::builtin();
        let typed = Typed::new(GROUP_CUSTOM | 0x0042, Bytes::new());
        assert!(matches!(
            reg.decode(&typed),
            Err(ProtocolError::UnknownType { type_id }) if type_id == GROUP_CUSTOM | 0x0042
        ));
    }

    #[test]
    fn corrupt_payload_is_surfaced_per_schema() {
        let reg = Registry::builtin();
        let typed = Typed::new(COMMAND_ERR, vec![0xff, 0xff, 0xff]);
        assert!(matches!(
            reg.decode(&typed),
            Err(ProtocolError::Payload { type_id: COMMAND_ERR, .. })
        ));
    }

    #[test]
    fn custom_registration() {
        #[derive(Clone, PartialEq, ::prost::Message)]
        struct Blink {
            #[prost(uint32, tag = "1")]
            times: u32,
        }

        const BLINK: u32 = GROUP_CUSTOM | 0x0001;

        let mut reg = Registry::builtin();
        reg.register::<Blink>(BLINK);

        let typed = Typed::new(BLINK, Blink { times: 3 }.encode_to_vec());
        let decoded = reg.decode(&typed).expect("decode");
        assert_eq!(decoded.downcast::<Blink>().expect("downcast").times, 3);
    }

    #[test]
    fn command_err_is_an_error() {
        let err = CommandErr::unsupported();
        assert_eq!(err.to_string(), "unsupported command");
    }

    #[test]
    fn turn_rate_round_trips_through_degrees() {
        let turn = Nav2dTurn::at_rate(Angle::from_degrees(90.0));
        assert!((f64::from(turn.speed) - std::f64::consts::FRAC_PI_2).abs() < 1e-6);
        assert!((turn.rate().degrees() - 90.0).abs() < 1e-4);

        // Sign picks the direction and survives the conversion.
        let turn = Nav2dTurn::at_rate(Angle::from_degrees(-30.0));
        assert!(turn.speed < 0.0);
        assert!((turn.rate().degrees() + 30.0).abs() < 1e-4);
    }
}
