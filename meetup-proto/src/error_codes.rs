//! Codes carried in `errorCode` when a request is rejected

/// The request payload could not be parsed or failed validation
pub const BAD_REQUEST: i32 = 400;

/// The request referenced a peer that is not in the room
pub const PEER_NOT_FOUND: i32 = 404;

/// The method is not handled by the receiver
pub const METHOD_NOT_FOUND: i32 = 405;

/// The receiver did not answer in time
pub const REQUEST_TIMEOUT: i32 = 408;

/// The transport the request needs is not connected
pub const TRANSPORT_NOT_READY: i32 = 409;

/// Anything else
pub const INTERNAL_ERROR: i32 = 500;
