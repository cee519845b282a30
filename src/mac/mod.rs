//! A monotonic clock reader, carried over unchanged from
//! `samply-in-process`, that the suspension-based sampler
//! ([`crate::platform::mac`]) uses to time suspend/resume windows.

pub mod time;
