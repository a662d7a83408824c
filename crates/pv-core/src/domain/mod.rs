//! Pure decision logic shared by the server: the channel state machine, the
//! discovery address policy and the beacon schedule.  Nothing here touches a
//! socket or a clock.

pub mod address_policy;
pub mod backoff;
pub mod channel_state;
