//! Chronicle Orders — sample bounded context.
//!
//! An `Order` aggregate whose event family includes two legacy event
//! shapes, upgraded on load, plus command and query handlers built on the
//! aggregate store.

pub mod application;
pub mod domain;
