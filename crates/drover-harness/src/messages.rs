//! Custom-group messages used by scenarios.

use bytes::Bytes;
use prost::Message as _;

use drover_proto::{
    messages::{GROUP_CUSTOM, WireMessage},
    typed::KIND_EVENT,
};

/// Type id of [`Telemetry`], in the custom group's event space.
pub const TELEMETRY: u32 = KIND_EVENT | GROUP_CUSTOM | 0x0001;

/// A minimal telemetry event for exercising the event path.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Telemetry {
    /// Arbitrary reading.
    #[prost(uint32, tag = "1")]
    pub reading: u32,
}

impl WireMessage for Telemetry {
    fn type_id(&self) -> u32 {
        TELEMETRY
    }

    fn payload(&self) -> Bytes {
        self.encode_to_vec().into()
    }
}
