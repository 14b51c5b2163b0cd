//! The gRPC interfaces between the CLI, the hub, and the agents.

// Code generated by protobuf.
pub mod idl {
    tonic::include_proto!("idl");
}

use bytes::Bytes;

/// Builds the status returned for a failed request whose error carries an operator-visible
/// next action. The next action travels in the status details.
pub fn status_with_next_action(code: tonic::Code, message: String, next_action: &str) -> tonic::Status {
    if next_action.is_empty() {
        tonic::Status::new(code, message)
    } else {
        tonic::Status::with_details(code, message, Bytes::copy_from_slice(next_action.as_bytes()))
    }
}

/// The next action carried by `status`, if any.
pub fn next_action(status: &tonic::Status) -> Option<String> {
    let details = status.details();
    if details.is_empty() {
        return None;
    }
    Some(String::from_utf8_lossy(details).into_owned())
}
