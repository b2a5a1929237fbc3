//! Reply predicates for [`DongleTransport::request`](crate::DongleTransport::request).

use canbridge_remp::{
    CanConfigPayload, CliPayload, CorrelationId, DeviceId, MessageType, PairingPayload,
};

use crate::Matcher;

/// CAN config replies carry no correlation id, so they match on device and type.
pub fn config_response(device_id: DeviceId) -> Matcher {
    Box::new(move |msg, _| {
        msg.msg_type == MessageType::CanConfig
            && msg.device_id == device_id
            && matches!(msg.can_config(), Ok(CanConfigPayload::Response { .. }))
    })
}

pub fn cli_response(corr_id: CorrelationId) -> Matcher {
    Box::new(move |msg, _| {
        msg.msg_type == MessageType::Cli
            && matches!(msg.cli(), Ok(CliPayload::Response(r)) if r.corr_id == corr_id)
    })
}

pub fn pairing_ack(corr_id: CorrelationId) -> Matcher {
    Box::new(move |msg, _| {
        msg.msg_type == MessageType::Pairing
            && matches!(msg.pairing(), Ok(PairingPayload::Ack { corr_id: c, .. }) if c == corr_id)
    })
}
