//! Call-out points for forward-secure sealing.
//!
//! A sealed file interleaves TAG objects that authenticate every object
//! appended since the previous tag. The signature scheme lives outside
//! this crate; the engine only feeds objects to a [`Sealer`] and writes the
//! tags it produces.

use crate::format::ObjectType;

/// Length of the digest stored in a TAG object.
pub const TAG_LENGTH: usize = 32;

/// An authenticator fed with every object a sealed file appends.
pub trait Sealer: Send {
    /// Adds the object at `offset` to the running authentication state.
    ///
    /// `bytes` is the object's full on-disk encoding at the time it became
    /// reachable.
    fn hmac_put_object(&mut self, object_type: ObjectType, offset: u64, bytes: &[u8]);

    /// Returns the epoch to close with a tag if `realtime` has moved past
    /// the current sealing interval.
    fn tag_due(&mut self, realtime: u64) -> Option<u64>;

    /// The epoch the running state currently covers.
    fn epoch(&self) -> u64;

    /// Finalises the running state into a tag digest for `epoch` and starts
    /// a fresh one.
    fn finish_tag(&mut self, seqnum: u64, epoch: u64) -> [u8; TAG_LENGTH];
}
