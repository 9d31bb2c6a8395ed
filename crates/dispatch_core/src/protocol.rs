//! Typed wire protocol for the bidirectional client channels.
//!
//! Frames are JSON objects `{event, data}`. Both directions are closed
//! tagged unions: an unknown inbound event fails deserialization and is a
//! protocol violation, not ignorable noise.
//!
//! Coordinates are `[lng, lat]` arrays end to end, matching what clients
//! send and what the durable store persists.

use serde::{Deserialize, Serialize};

use crate::auth::Role;
use crate::ids::{ChannelId, DriverId, OfferId};

/// Client-to-server events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum InboundEvent {
    #[serde(rename = "user:register")]
    UserRegister {
        role: Role,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        coordinates: Option<[f64; 2]>,
    },
    #[serde(rename = "location:update")]
    LocationUpdate { coordinates: [f64; 2] },
    #[serde(rename = "ride:accept")]
    RideAccept {
        #[serde(rename = "requestId")]
        request_id: OfferId,
    },
    #[serde(rename = "ride:reject")]
    RideReject {
        #[serde(rename = "requestId")]
        request_id: OfferId,
    },
}

/// The offer payload as drivers see it in `ride:request` and
/// `ride:accept:success`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferPayload {
    pub request_id: OfferId,
    /// Pickup point, `[lng, lat]`.
    pub pickup: [f64; 2],
    /// Destination point, `[lng, lat]`.
    pub destination: [f64; 2],
    pub fare: f64,
    pub distance_km: f64,
    /// Seconds until the offer expires.
    pub expires_in: u64,
}

/// Server-to-client events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum OutboundEvent {
    #[serde(rename = "user:registered")]
    UserRegistered {
        success: bool,
        #[serde(rename = "channelId")]
        channel_id: ChannelId,
    },
    #[serde(rename = "ride:request")]
    RideRequest(OfferPayload),
    #[serde(rename = "ride:request:cancelled")]
    RideRequestCancelled {
        #[serde(rename = "requestId")]
        request_id: OfferId,
        reason: String,
    },
    #[serde(rename = "ride:request:expired")]
    RideRequestExpired {
        #[serde(rename = "requestId")]
        request_id: OfferId,
        message: String,
    },
    #[serde(rename = "ride:request:failed")]
    RideRequestFailed { message: String },
    #[serde(rename = "ride:accepted")]
    RideAccepted {
        #[serde(rename = "requestId")]
        request_id: OfferId,
        #[serde(rename = "driverId")]
        driver_id: DriverId,
        #[serde(rename = "driverName")]
        driver_name: String,
        message: String,
    },
    #[serde(rename = "ride:accept:success")]
    RideAcceptSuccess {
        #[serde(rename = "requestId")]
        request_id: OfferId,
        #[serde(rename = "rideDetails")]
        ride_details: OfferPayload,
    },
    #[serde(rename = "ride:accept:failed")]
    RideAcceptFailed {
        #[serde(rename = "requestId")]
        request_id: OfferId,
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_events_deserialize_from_wire_frames() {
        let frame = r#"{"event":"location:update","data":{"coordinates":[13.405,52.52]}}"#;
        let event: InboundEvent = serde_json::from_str(frame).expect("parse");
        assert_eq!(
            event,
            InboundEvent::LocationUpdate {
                coordinates: [13.405, 52.52]
            }
        );
    }

    #[test]
    fn register_without_coordinates_is_valid() {
        let frame = r#"{"event":"user:register","data":{"role":"rider"}}"#;
        let event: InboundEvent = serde_json::from_str(frame).expect("parse");
        assert_eq!(
            event,
            InboundEvent::UserRegister {
                role: Role::Rider,
                coordinates: None
            }
        );
    }

    #[test]
    fn unknown_events_are_protocol_violations() {
        let frame = r#"{"event":"ride:teleport","data":{}}"#;
        assert!(serde_json::from_str::<InboundEvent>(frame).is_err());
    }

    #[test]
    fn outbound_events_serialize_with_wire_names() {
        let event = OutboundEvent::RideRequestCancelled {
            request_id: OfferId::new(),
            reason: "accepted_by_other".into(),
        };
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["event"], "ride:request:cancelled");
        assert_eq!(json["data"]["reason"], "accepted_by_other");
        assert!(json["data"]["requestId"].is_string());
    }

    #[test]
    fn offer_payload_round_trips() {
        let payload = OfferPayload {
            request_id: OfferId::new(),
            pickup: [13.405, 52.52],
            destination: [13.38, 52.51],
            fare: 7.25,
            distance_km: 3.17,
            expires_in: 15,
        };
        let event = OutboundEvent::RideRequest(payload.clone());
        let json = serde_json::to_string(&event).expect("serialize");
        let back: OutboundEvent = serde_json::from_str(&json).expect("parse");
        assert_eq!(back, OutboundEvent::RideRequest(payload));
    }
}
