// Copyright (c) 2026 Mandau Authors
// SPDX-License-Identifier: AGPL-3.0

//! Generated gRPC bindings for the Mandau wire protocol.
//!
//! The schema lives in `proto/mandau/v1/mandau.proto`; this crate exposes the
//! tonic client/server stubs plus small conversion helpers between the
//! well-known protobuf types and `chrono`.

pub mod v1 {
    tonic::include_proto!("mandau.v1");
}

use chrono::{DateTime, TimeZone, Utc};

/// Convert a `chrono` timestamp into the protobuf well-known type.
pub fn to_proto_timestamp(t: DateTime<Utc>) -> prost_types::Timestamp {
    prost_types::Timestamp {
        seconds: t.timestamp(),
        nanos: t.timestamp_subsec_nanos() as i32,
    }
}

/// Convert a protobuf timestamp back into `chrono`, clamping invalid values
/// to the epoch rather than failing.
pub fn from_proto_timestamp(t: &prost_types::Timestamp) -> DateTime<Utc> {
    Utc.timestamp_opt(t.seconds, t.nanos.max(0) as u32)
        .single()
        .unwrap_or_else(|| Utc.timestamp_opt(0, 0).single().expect("epoch is valid"))
}

/// Convert a `std::time::Duration` into the protobuf well-known type.
pub fn to_proto_duration(d: std::time::Duration) -> prost_types::Duration {
    prost_types::Duration {
        seconds: d.as_secs() as i64,
        nanos: d.subsec_nanos() as i32,
    }
}

/// Convert a protobuf duration into `std::time::Duration`; negative values
/// collapse to zero.
pub fn from_proto_duration(d: &prost_types::Duration) -> std::time::Duration {
    if d.seconds < 0 {
        return std::time::Duration::ZERO;
    }
    std::time::Duration::new(d.seconds as u64, d.nanos.max(0) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_roundtrip() {
        let now = Utc::now();
        let proto = to_proto_timestamp(now);
        let back = from_proto_timestamp(&proto);
        assert_eq!(now.timestamp(), back.timestamp());
    }

    #[test]
    fn duration_negative_clamps_to_zero() {
        let d = prost_types::Duration { seconds: -5, nanos: 0 };
        assert_eq!(from_proto_duration(&d), std::time::Duration::ZERO);
    }
}
