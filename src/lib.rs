//! Client for a digital setting circles (DSC) server over Bluetooth LE.
//!
//! The DSC server reports telescope azimuth and elevation as decimal text
//! on a handful of GATT characteristics. [`infrastructure::bluetooth`]
//! keeps one session to it and turns every value into a [`DscEvent`].

pub mod domain;
pub mod infrastructure;

pub use domain::error::{DecodeError, SessionError};
pub use domain::models::{ConnectionState, DscEvent, DscReadings, EventSink};
